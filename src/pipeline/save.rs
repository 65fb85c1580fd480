//! Save stage: one per channel.
//!
//! Pops admitted frames, writes them to disk when saving is enabled and
//! routes them on. With display enabled and a raw input format, the frame is
//! converted into a buffer from the channel's conversion pool; the converted
//! copy goes downstream and the raw buffer goes home. Without a downstream
//! queue the frame is recycled after saving.
//!
//! Once `frame_limit` frames are saved the stage cancels the whole run.

use super::naming;
use super::stage::{Flow, StageContext, StageWorker};
use crate::buffer::{ExchangeQueue, QueueFailure, Wait};
use crate::bus::BusClient;
use crate::config::{RawFileFormat, RuntimeSchedule, SaveConfig, TimeoutConfig};
use crate::devices::{FileWriter, FormatConverter, FrameRecord, LayoutParams};
use crate::error::{PipelineError, Result, ResultExt};
use crate::types::PoolId;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct SaveTimeouts {
    dequeue: Wait,
    enqueue: Wait,
    priming: Wait,
}

impl From<&TimeoutConfig> for SaveTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            dequeue: Wait::millis(config.save_dequeue_ms),
            enqueue: Wait::millis(config.save_enqueue_ms),
            priming: Wait::millis(config.priming_ms),
        }
    }
}

/// Raw-to-display conversion into a dedicated pool
pub struct Conversion {
    pub converter: Box<dyn FormatConverter>,
    pub pool: PoolId,
    pub layout: LayoutParams,
}

pub struct SaveStage {
    channel: u32,
    input: ExchangeQueue,
    output: Option<ExchangeQueue>,
    writer: Option<Box<dyn FileWriter>>,
    file_prefix: String,
    file_format: RawFileFormat,
    conversion: Option<Conversion>,
    sensor_tag: String,
    runtime: Option<Arc<RuntimeSchedule>>,
    bus: Option<BusClient>,
    active_setting: Option<usize>,
    frame_limit: Option<u64>,
    timeouts: SaveTimeouts,
    saved: u64,
}

impl SaveStage {
    /// `writer` is only used when `save.enabled` is set
    pub fn new(
        channel: u32,
        input: ExchangeQueue,
        save: &SaveConfig,
        timeouts: &TimeoutConfig,
        writer: Box<dyn FileWriter>,
    ) -> Self {
        Self {
            channel,
            input,
            output: None,
            writer: save.enabled.then_some(writer),
            file_prefix: save.file_prefix.clone(),
            file_format: save.format,
            conversion: None,
            sensor_tag: String::new(),
            runtime: None,
            bus: None,
            active_setting: None,
            frame_limit: None,
            timeouts: timeouts.into(),
            saved: 0,
        }
    }

    pub fn with_output(mut self, output: ExchangeQueue) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversion = Some(conversion);
        self
    }

    pub fn with_sensor_tag(mut self, tag: impl Into<String>) -> Self {
        self.sensor_tag = tag.into();
        self
    }

    /// Follow `schedule` for filename tags; with a bus client, also ask the
    /// bus worker to apply each setting as it becomes active
    pub fn with_runtime(mut self, schedule: Arc<RuntimeSchedule>, bus: Option<BusClient>) -> Self {
        self.runtime = Some(schedule);
        self.bus = bus;
        self
    }

    pub fn with_frame_limit(mut self, limit: Option<u64>) -> Self {
        self.frame_limit = limit;
        self
    }

    /// Filename tag for saved frame `frame`, switching runtime settings as
    /// the schedule moves on
    fn tag_for(&mut self, frame: u64) -> String {
        let Some(schedule) = &self.runtime else {
            return self.sensor_tag.clone();
        };
        let Some(index) = schedule.index_for_frame(frame) else {
            return self.sensor_tag.clone();
        };
        if self.active_setting != Some(index) {
            self.active_setting = Some(index);
            tracing::debug!(channel = self.channel, frame, "Runtime setting {} active", index);
            if let Some(bus) = &self.bus {
                bus.apply_runtime_setting(index);
            }
        }
        schedule
            .get(index)
            .map(|setting| setting.tag.clone())
            .unwrap_or_default()
    }
}

impl StageWorker for SaveStage {
    fn name(&self) -> String {
        format!("save-{}", self.channel)
    }

    fn step(&mut self, ctx: &StageContext) -> Result<Flow> {
        let buffer = match self.input.pop(self.timeouts.dequeue, Some(&ctx.cancel)) {
            Ok(buffer) => buffer,
            Err(QueueFailure::Empty) => {
                ctx.status.record_timeout();
                return Ok(Flow::Continue);
            }
            Err(failure) => return Err(failure.into_error(self.input.name())),
        };
        let frame = ctx.pools.guard(buffer);
        let index = self.saved;

        let tag = self.tag_for(index);
        if let Some(writer) = self.writer.as_mut() {
            let path = naming::output_path(&self.file_prefix, &tag, self.channel, index, self.file_format);
            let record = FrameRecord::for_buffer(&frame, self.channel, index, &tag);
            writer
                .write(&path, &frame, &record)
                .with_context(|| format!("save {}", path.display()))?;
            tracing::trace!(channel = self.channel, "Saved {}", path.display());
        }
        self.saved += 1;
        ctx.status.record_processed();

        match (&self.output, &mut self.conversion) {
            (None, _) => drop(frame),
            (Some(output), None) => {
                frame.forward(output, self.timeouts.enqueue, &ctx.cancel);
            }
            (Some(output), Some(conversion)) => {
                let pool = ctx.pools.pool(conversion.pool)?;
                let converted = match pool.acquire(self.timeouts.priming, Some(&ctx.cancel)) {
                    Ok(buffer) => buffer,
                    Err(QueueFailure::Cancelled) => return Ok(Flow::Continue),
                    Err(_) => {
                        return Err(PipelineError::ResourceExhausted(format!(
                            "conversion pool `{}` empty",
                            pool.name()
                        )))
                    }
                };
                let mut converted = ctx.pools.guard(converted);
                conversion
                    .converter
                    .convert(&frame, &mut converted, &conversion.layout)
                    .with_context(|| format!("channel {} convert", self.channel))?;
                converted.set_sequence(frame.meta().sequence);
                converted.set_channel(frame.meta().channel);
                drop(frame);
                converted.forward(output, self.timeouts.enqueue, &ctx.cancel);
            }
        }

        if self.frame_limit.is_some_and(|limit| self.saved >= limit) {
            tracing::info!(channel = self.channel, frames = self.saved, "Save frame limit reached");
            ctx.cancel.cancel();
            return Ok(Flow::Finished);
        }
        Ok(Flow::Continue)
    }

    fn drain(&mut self, _ctx: &StageContext) {
        tracing::debug!(channel = self.channel, saved = self.saved, "Save stage drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PoolRegistry;
    use crate::config::RuntimeSetting;
    use crate::bus::CommandScript;
    use crate::devices::{RecordingWriter, SimConverter};
    use crate::pipeline::cancel::CancelToken;
    use crate::pipeline::stage::StageStatus;
    use crate::types::{FrameMeta, SurfaceFormat};

    struct Fixture {
        ctx: StageContext,
        raw: PoolId,
        rgba: PoolId,
        input: ExchangeQueue,
        output: ExchangeQueue,
    }

    fn fixture() -> Fixture {
        let mut registry = PoolRegistry::new();
        let raw = registry
            .create_pool("capture-0", 5, FrameMeta::new(8, 4, SurfaceFormat::Raw8))
            .unwrap();
        let rgba = registry
            .create_pool("conversion-0", 5, FrameMeta::new(4, 2, SurfaceFormat::Rgba))
            .unwrap();
        Fixture {
            ctx: StageContext {
                cancel: CancelToken::new(),
                pools: Arc::new(registry),
                status: Arc::new(StageStatus::default()),
            },
            raw,
            rgba,
            input: ExchangeQueue::new("save-0", 4),
            output: ExchangeQueue::new("composite-0", 4),
        }
    }

    fn queue_frames(fx: &Fixture, count: u64) {
        let pool = fx.ctx.pools.pool(fx.raw).unwrap();
        for sequence in 0..count {
            let mut buffer = pool.acquire(Wait::Immediate, None).unwrap();
            buffer.set_sequence(sequence);
            buffer.set_channel(Some(0));
            fx.input.push(buffer, Wait::Immediate, None).unwrap();
        }
    }

    fn enabled() -> SaveConfig {
        SaveConfig {
            enabled: true,
            ..SaveConfig::default()
        }
    }

    #[test]
    fn test_saves_and_recycles_without_output() {
        let fx = fixture();
        let writer = RecordingWriter::new();
        let mut stage = SaveStage::new(0, fx.input.clone(), &enabled(), &TimeoutConfig::uniform(5), Box::new(writer.clone()))
            .with_sensor_tag("_e10.00ms_g1.00");
        queue_frames(&fx, 2);

        stage.step(&fx.ctx).unwrap();
        stage.step(&fx.ctx).unwrap();

        let records = writer.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].0, std::path::PathBuf::from("out_e10.00ms_g1.00_vc0_01.raw"));
        assert_eq!(records[1].1.sequence, 1);
        assert!(fx.ctx.pools.conservation().is_balanced());
    }

    #[test]
    fn test_disabled_save_forwards_raw_buffer() {
        let fx = fixture();
        let writer = RecordingWriter::new();
        let mut stage = SaveStage::new(0, fx.input.clone(), &SaveConfig::default(), &TimeoutConfig::uniform(5), Box::new(writer.clone()))
            .with_output(fx.output.clone());
        queue_frames(&fx, 1);

        stage.step(&fx.ctx).unwrap();
        assert!(writer.records().is_empty());
        let forwarded = fx.output.drain();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].home(), fx.raw);
        fx.ctx.pools.recycle_all(forwarded);
    }

    #[test]
    fn test_conversion_forwards_copy_and_returns_raw() {
        let fx = fixture();
        let mut stage = SaveStage::new(0, fx.input.clone(), &SaveConfig::default(), &TimeoutConfig::uniform(5), Box::new(RecordingWriter::new()))
            .with_output(fx.output.clone())
            .with_conversion(Conversion {
                converter: Box::new(SimConverter::new()),
                pool: fx.rgba,
                layout: LayoutParams {
                    output: SurfaceFormat::Rgba,
                    ..LayoutParams::default()
                },
            });
        queue_frames(&fx, 3);

        for _ in 0..3 {
            stage.step(&fx.ctx).unwrap();
        }
        let converted = fx.output.drain();
        assert_eq!(converted.len(), 3);
        assert!(converted.iter().all(|b| b.home() == fx.rgba));
        assert_eq!(converted[2].meta().sequence, 2);
        assert_eq!(converted[2].meta().channel, Some(0));
        assert_eq!(fx.ctx.pools.pool(fx.raw).unwrap().available(), 5);

        fx.ctx.pools.recycle_all(converted);
        assert!(fx.ctx.pools.conservation().is_balanced());
    }

    #[test]
    fn test_converter_fault_is_fatal_and_leaks_nothing() {
        let fx = fixture();
        let mut stage = SaveStage::new(0, fx.input.clone(), &SaveConfig::default(), &TimeoutConfig::uniform(5), Box::new(RecordingWriter::new()))
            .with_output(fx.output.clone())
            .with_conversion(Conversion {
                converter: Box::new(SimConverter::failing()),
                pool: fx.rgba,
                layout: LayoutParams::default(),
            });
        queue_frames(&fx, 1);

        assert!(stage.step(&fx.ctx).is_err());
        assert!(fx.ctx.pools.conservation().is_balanced());
    }

    #[test]
    fn test_frame_limit_cancels_run() {
        let fx = fixture();
        let mut stage = SaveStage::new(0, fx.input.clone(), &SaveConfig::default(), &TimeoutConfig::uniform(5), Box::new(RecordingWriter::new()))
            .with_frame_limit(Some(2));
        queue_frames(&fx, 2);

        assert_eq!(stage.step(&fx.ctx).unwrap(), Flow::Continue);
        assert!(!fx.ctx.cancel.is_cancelled());
        assert_eq!(stage.step(&fx.ctx).unwrap(), Flow::Finished);
        assert!(fx.ctx.cancel.is_cancelled());
    }

    #[test]
    fn test_empty_input_counts_timeout() {
        let fx = fixture();
        let mut stage = SaveStage::new(0, fx.input.clone(), &SaveConfig::default(), &TimeoutConfig::uniform(1), Box::new(RecordingWriter::new()));
        assert_eq!(stage.step(&fx.ctx).unwrap(), Flow::Continue);
        assert_eq!(fx.ctx.status.stats().timeouts, 1);
    }

    #[test]
    fn test_runtime_tags_and_bus_requests() {
        let fx = fixture();
        let schedule = RuntimeSchedule::new(vec![
            RuntimeSetting { frames: 1, script: CommandScript::new(), tag: "_short".into() },
            RuntimeSetting { frames: 2, script: CommandScript::new(), tag: "_long".into() },
        ])
        .unwrap();
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let (_replies_tx, replies_rx) = crossbeam_channel::unbounded();
        let client = BusClient {
            receiver: replies_rx,
            command_sender: commands_tx,
        };
        let writer = RecordingWriter::new();
        let mut stage = SaveStage::new(0, fx.input.clone(), &enabled(), &TimeoutConfig::uniform(5), Box::new(writer.clone()))
            .with_sensor_tag("_ignored")
            .with_runtime(Arc::new(schedule), Some(client));
        queue_frames(&fx, 4);

        for _ in 0..4 {
            stage.step(&fx.ctx).unwrap();
        }
        let tags: Vec<String> = writer.records().into_iter().map(|(_, r)| r.settings_tag).collect();
        assert_eq!(tags, vec!["_short", "_long", "_long", "_short"]);

        let requested: Vec<_> = commands_rx.try_iter().collect();
        assert_eq!(
            requested,
            vec![
                crate::bus::BusCommand::ApplyRuntimeSetting(0),
                crate::bus::BusCommand::ApplyRuntimeSetting(1),
                crate::bus::BusCommand::ApplyRuntimeSetting(0),
            ]
        );
    }
}
