//! Pipeline assembly, run control and teardown.
//!
//! [`PipelineBuilder`] turns a [`PipelineConfig`] and a [`DeviceSet`] into a
//! [`Pipeline`]: it allocates every pool, creates the inter-stage queues and
//! wires the stages:
//!
//! ```text
//! capture-i ──► save-i ──► composite ──► display      (display enabled)
//! capture-i ──► save-i                                (display disabled)
//! ```
//!
//! Teardown stops the stages downstream first (display, composite, save,
//! capture), drains every queue back to the home pools and reports whether
//! each pool got all its buffers back.

use super::cancel::CancelToken;
use super::capture::CaptureStage;
use super::composite::{composite_layout, CompositeStage};
use super::display::DisplayStage;
use super::save::{Conversion, SaveStage};
use super::stage::{spawn_stage, StageHandle, StageWorker};
use crate::buffer::{ConservationReport, ExchangeQueue, PoolRegistry};
use crate::bus::BusClient;
use crate::config::{
    PipelineConfig, RuntimeSchedule, COMPOSITE_QUEUE_SIZE, CONVERSION_POOL_SIZE, DISPLAY_QUEUE_SIZE,
    SAVE_QUEUE_SIZE,
};
use crate::devices::{
    BlitEngine, CaptureDevice, DisplayEngine, FileWriter, FormatConverter, LayoutParams, RawFileWriter,
    SimBlitter, SimCaptureDevice, SimConverter, SimDisplay,
};
use crate::error::{PipelineError, Result};
use crate::types::{FrameMeta, StageState, StageStats, SurfaceFormat};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// How long teardown waits for each stage before logging it as stuck
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame interval of the simulated sensors (~30 fps)
const SIM_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// External collaborators, one capture device, converter and writer per
/// channel
pub struct DeviceSet {
    pub capture: Vec<Box<dyn CaptureDevice>>,
    pub converters: Vec<Box<dyn FormatConverter>>,
    pub writers: Vec<Box<dyn FileWriter>>,
    pub blitter: Box<dyn BlitEngine>,
    pub display: Box<dyn DisplayEngine>,
}

impl DeviceSet {
    /// In-process stand-ins for every collaborator, writing real files
    pub fn simulated(config: &PipelineConfig) -> Self {
        let channels = 0..config.num_channels() as u32;
        Self {
            capture: channels
                .clone()
                .map(|ch| {
                    Box::new(SimCaptureDevice::new(ch).with_frame_interval(SIM_FRAME_INTERVAL))
                        as Box<dyn CaptureDevice>
                })
                .collect(),
            converters: channels
                .clone()
                .map(|_| Box::new(SimConverter::new()) as Box<dyn FormatConverter>)
                .collect(),
            writers: channels
                .map(|_| Box::new(RawFileWriter::new(config.save.sidecar)) as Box<dyn FileWriter>)
                .collect(),
            blitter: Box::new(SimBlitter::new()),
            display: Box::new(SimDisplay::new()),
        }
    }
}

/// Kind of stage, in teardown order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageRole {
    Display,
    Composite,
    Save,
    Capture,
}

/// Final counters of one stage
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub name: String,
    pub role: StageRole,
    pub state: StageState,
    pub stats: StageStats,
}

/// Outcome of a run, printed as JSON by the binary
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageSummary>,
    pub conservation: ConservationReport,
    /// First fatal stage error, if any
    pub error: Option<String>,
}

impl RunSummary {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Configures and wires a [`Pipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    sensor_tag: String,
    runtime: Option<Arc<RuntimeSchedule>>,
    bus: Option<BusClient>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            sensor_tag: String::new(),
            runtime: None,
            bus: None,
        }
    }

    /// Filename tag used when no runtime setting applies
    pub fn with_sensor_tag(mut self, tag: impl Into<String>) -> Self {
        self.sensor_tag = tag.into();
        self
    }

    pub fn with_runtime(mut self, schedule: Arc<RuntimeSchedule>) -> Self {
        self.runtime = Some(schedule);
        self
    }

    /// Bus worker that applies runtime settings as they become active
    pub fn with_bus(mut self, client: BusClient) -> Self {
        self.bus = Some(client);
        self
    }

    pub fn build(self, devices: DeviceSet) -> Result<Pipeline> {
        let config = self.config;
        config.validate()?;
        let channels = config.num_channels();
        for (what, count) in [
            ("capture devices", devices.capture.len()),
            ("converters", devices.converters.len()),
            ("writers", devices.writers.len()),
        ] {
            if count != channels {
                return Err(PipelineError::Config(format!(
                    "{count} {what} for {channels} channels"
                )));
            }
        }

        let mut registry = PoolRegistry::new();
        let mut links = Vec::new();
        let mut workers: Vec<(StageRole, Box<dyn StageWorker>)> = Vec::new();
        let mut composite_inputs = Vec::new();
        let mut composite_sizes = Vec::new();
        let display = config.display.enabled;
        let convert = display && config.channels[0].format.is_raw();

        let device_iter = devices
            .capture
            .into_iter()
            .zip(devices.converters)
            .zip(devices.writers);
        for (index, ((capture, converter), writer)) in device_iter.enumerate() {
            let channel = &config.channels[index];
            let ch = index as u32;

            let capture_pool = registry.create_pool(
                format!("capture-{ch}"),
                channel.buffer_count,
                FrameMeta::new(channel.width, channel.height, channel.format),
            )?;
            let save_queue = ExchangeQueue::new(format!("save-{ch}"), SAVE_QUEUE_SIZE);
            links.push(save_queue.clone());
            workers.push((
                StageRole::Capture,
                Box::new(CaptureStage::new(
                    ch,
                    channel,
                    &config.timeouts,
                    capture,
                    capture_pool,
                    save_queue.clone(),
                )?),
            ));

            let mut save = SaveStage::new(ch, save_queue, &config.save, &config.timeouts, writer)
                .with_sensor_tag(self.sensor_tag.clone())
                .with_frame_limit(channel.cadence.frame_limit);
            if let Some(schedule) = &self.runtime {
                // Only one channel drives the bus
                let bus = if index == 0 { self.bus.clone() } else { None };
                save = save.with_runtime(schedule.clone(), bus);
            }

            if display {
                let queue = ExchangeQueue::new(format!("composite-{ch}"), COMPOSITE_QUEUE_SIZE);
                links.push(queue.clone());
                composite_inputs.push(queue.clone());
                save = save.with_output(queue);

                if convert {
                    let (width, height) = (channel.width / 2, channel.height / 2);
                    let pool = registry.create_pool(
                        format!("conversion-{ch}"),
                        CONVERSION_POOL_SIZE,
                        FrameMeta::new(width, height, SurfaceFormat::Rgba),
                    )?;
                    save = save.with_conversion(Conversion {
                        converter,
                        pool,
                        layout: LayoutParams {
                            output: SurfaceFormat::Rgba,
                            ..LayoutParams::default()
                        },
                    });
                    composite_sizes.push((width, height));
                } else {
                    composite_sizes.push((channel.width, channel.height));
                }
            }
            workers.push((StageRole::Save, Box::new(save)));
        }

        if display {
            let (rects, width, height) = composite_layout(&composite_sizes);
            let format = if convert {
                SurfaceFormat::Rgba
            } else {
                config.channels[0].format
            };
            let composite_pool = registry.create_pool(
                "composite",
                config.display.composite_buffers,
                FrameMeta::new(width, height, format),
            )?;
            let display_queue = ExchangeQueue::new("display", DISPLAY_QUEUE_SIZE);
            links.push(display_queue.clone());

            workers.push((
                StageRole::Composite,
                Box::new(CompositeStage::new(
                    composite_inputs,
                    rects,
                    display_queue.clone(),
                    devices.blitter,
                    composite_pool,
                    &config.timeouts,
                )?),
            ));
            workers.push((
                StageRole::Display,
                Box::new(DisplayStage::new(
                    display_queue,
                    devices.display,
                    &config.display,
                    &config.timeouts,
                )),
            ));
        }

        tracing::info!(
            channels,
            pools = registry.len(),
            stages = workers.len(),
            display = config.display.enabled,
            "Pipeline built"
        );

        Ok(Pipeline {
            cancel: CancelToken::new(),
            pools: Arc::new(registry),
            links,
            pending: workers,
            running: Vec::new(),
            started_at: None,
        })
    }
}

/// A wired pipeline, started with [`start`](Self::start) and torn down with
/// [`shutdown`](Self::shutdown)
pub struct Pipeline {
    cancel: CancelToken,
    pools: Arc<PoolRegistry>,
    /// Every inter-stage queue
    links: Vec<ExchangeQueue>,
    pending: Vec<(StageRole, Box<dyn StageWorker>)>,
    running: Vec<(StageRole, StageHandle)>,
    started_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    /// Token that stops the run; clone it into signal handlers
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    /// Spawn every stage thread. If one fails to spawn, the run is cancelled
    /// and the error returned; [`shutdown`](Self::shutdown) still cleans up.
    pub fn start(&mut self) -> Result<()> {
        self.started_at = Some(Utc::now());
        for (role, worker) in self.pending.drain(..) {
            match spawn_stage(worker, self.cancel.clone(), self.pools.clone()) {
                Ok(handle) => self.running.push((role, handle)),
                Err(e) => {
                    self.cancel.cancel();
                    return Err(e);
                }
            }
        }
        tracing::info!(stages = self.running.len(), "Pipeline started");
        Ok(())
    }

    /// Block until the run is cancelled, by a frame limit, a fatal stage
    /// error or the caller
    pub fn wait(&self) {
        self.cancel.wait();
    }

    /// Like [`wait`](Self::wait) with a timeout; true if cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.cancel.wait_timeout(timeout)
    }

    /// Current counters of every running stage
    pub fn stage_stats(&self) -> Vec<(String, StageStats)> {
        self.running
            .iter()
            .map(|(_, handle)| (handle.name().to_string(), handle.stats()))
            .collect()
    }

    /// Cancel, stop every stage downstream-first, drain the queues and
    /// account for every buffer
    pub fn shutdown(mut self) -> RunSummary {
        self.cancel.cancel();
        self.running.sort_by_key(|(role, _)| *role);

        let mut stages = Vec::new();
        let mut error = None;
        for (role, handle) in self.running.drain(..) {
            if !handle.wait_stopped(STOP_TIMEOUT) {
                tracing::warn!(stage = handle.name(), "Stage still running after {:?}", STOP_TIMEOUT);
            }
            let summary = StageSummary {
                name: handle.name().to_string(),
                role,
                state: handle.state(),
                stats: handle.stats(),
            };
            if let Err(e) = handle.join() {
                error.get_or_insert_with(|| e.to_string());
            }
            stages.push(summary);
        }

        for link in &self.links {
            self.pools.recycle_all(link.drain());
        }
        let conservation = self.pools.conservation();
        for pool in conservation.missing() {
            tracing::error!(
                pool = %pool.name,
                allocated = pool.allocated,
                recovered = pool.recovered,
                "Buffers missing after teardown"
            );
        }
        tracing::info!(balanced = conservation.is_balanced(), "Pipeline shut down");

        RunSummary {
            started_at: self.started_at,
            finished_at: Utc::now(),
            stages,
            conservation,
            error,
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
