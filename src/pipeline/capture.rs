//! Capture stage: one per channel.
//!
//! Each step feeds every free buffer of the channel's pool to the capture
//! device, retrieves one filled frame, and applies the admission policy.
//! Admitted frames are stamped with their sequence number and forwarded to
//! the save stage; rejected frames go straight back to the pool.
//!
//! Retrieve timeouts and buffer starvation are expected while the sensor
//! starts up, but more than `max_retry` in a row is fatal.

use super::admission::AdmissionPolicy;
use super::stage::{Flow, StageContext, StageWorker};
use crate::buffer::{ExchangeQueue, Wait};
use crate::config::{ChannelConfig, TimeoutConfig};
use crate::devices::{CaptureDevice, Retrieved};
use crate::error::{PipelineError, Result, ResultExt};
use crate::types::PoolId;
use std::time::{Duration, Instant};

/// Interval between throughput log lines
const FPS_LOG_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
struct CaptureTimeouts {
    feed: Duration,
    get_frame: Duration,
    enqueue: Wait,
    max_retry: u32,
}

impl From<&TimeoutConfig> for CaptureTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            feed: TimeoutConfig::ms(config.capture_feed_ms),
            get_frame: TimeoutConfig::ms(config.capture_get_frame_ms),
            enqueue: Wait::millis(config.capture_enqueue_ms),
            max_retry: config.capture_max_retry,
        }
    }
}

/// Frames-per-second meter logged at a fixed interval
#[derive(Debug)]
struct FpsMeter {
    window_start: Instant,
    frames: u64,
}

impl FpsMeter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
        }
    }

    fn tick(&mut self, channel: u32) {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= FPS_LOG_INTERVAL {
            let fps = self.frames as f64 / elapsed.as_secs_f64();
            tracing::info!(channel, "Capture rate {:.2} fps", fps);
            self.window_start = Instant::now();
            self.frames = 0;
        }
    }
}

pub struct CaptureStage {
    channel: u32,
    device: Box<dyn CaptureDevice>,
    pool: PoolId,
    output: ExchangeQueue,
    policy: AdmissionPolicy,
    frame_limit: Option<u64>,
    timeouts: CaptureTimeouts,
    /// Index of the next retrieved frame; only advances on a real frame
    frame_index: u64,
    admitted: u64,
    consecutive_timeouts: u32,
    consecutive_starved: u32,
    fps: FpsMeter,
}

impl CaptureStage {
    pub fn new(
        channel: u32,
        config: &ChannelConfig,
        timeouts: &TimeoutConfig,
        device: Box<dyn CaptureDevice>,
        pool: PoolId,
        output: ExchangeQueue,
    ) -> Result<Self> {
        Ok(Self {
            channel,
            device,
            pool,
            output,
            policy: config.cadence.policy()?,
            frame_limit: config.cadence.frame_limit,
            timeouts: timeouts.into(),
            frame_index: 0,
            admitted: 0,
            consecutive_timeouts: 0,
            consecutive_starved: 0,
            fps: FpsMeter::new(),
        })
    }

    /// Hand every free pool buffer to the device
    fn feed_free_buffers(&mut self, ctx: &StageContext) -> Result<()> {
        let pool = ctx.pools.pool(self.pool)?;
        while let Ok(buffer) = pool.acquire(Wait::Immediate, None) {
            if let Err(fault) = self.device.feed(buffer, self.timeouts.feed) {
                ctx.pools.recycle_all(fault.reclaimed);
                return Err(fault
                    .error
                    .with_context(format!("channel {} feed", self.channel)));
            }
        }
        Ok(())
    }
}

impl StageWorker for CaptureStage {
    fn name(&self) -> String {
        format!("capture-{}", self.channel)
    }

    fn step(&mut self, ctx: &StageContext) -> Result<Flow> {
        self.feed_free_buffers(ctx)?;

        let retrieved = self
            .device
            .retrieve(self.timeouts.get_frame)
            .with_context(|| format!("channel {} retrieve", self.channel))?;

        let buffer = match retrieved {
            Retrieved::Frame(buffer) => buffer,
            Retrieved::Timeout => {
                ctx.status.record_timeout();
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts > self.timeouts.max_retry {
                    return Err(PipelineError::Timeout(format!(
                        "channel {}: no frame after {} attempts",
                        self.channel, self.consecutive_timeouts
                    )));
                }
                tracing::warn!(
                    channel = self.channel,
                    attempt = self.consecutive_timeouts,
                    "Frame retrieve timed out"
                );
                return Ok(Flow::Continue);
            }
            Retrieved::InsufficientBuffering => {
                self.consecutive_starved += 1;
                if self.consecutive_starved > self.timeouts.max_retry {
                    return Err(PipelineError::ResourceExhausted(format!(
                        "channel {}: capture engine starved of buffers",
                        self.channel
                    )));
                }
                tracing::warn!(channel = self.channel, "Capture engine has insufficient buffering");
                return Ok(Flow::Continue);
            }
        };

        self.consecutive_timeouts = 0;
        self.consecutive_starved = 0;
        let index = self.frame_index;
        self.frame_index += 1;

        let mut frame = ctx.pools.guard(buffer);
        if !self.policy.admit(index) {
            ctx.status.record_dropped();
            return Ok(Flow::Continue);
        }

        frame.set_sequence(self.policy.sequence_of(index));
        frame.set_channel(Some(self.channel));
        tracing::trace!(channel = self.channel, index, "Frame admitted");

        if !frame.forward(&self.output, self.timeouts.enqueue, &ctx.cancel) {
            return Ok(Flow::Continue);
        }
        ctx.status.record_processed();
        self.admitted += 1;
        self.fps.tick(self.channel);

        if self.frame_limit.is_some_and(|limit| self.admitted >= limit) {
            tracing::info!(channel = self.channel, frames = self.admitted, "Capture frame limit reached");
            return Ok(Flow::Finished);
        }
        Ok(Flow::Continue)
    }

    fn drain(&mut self, ctx: &StageContext) {
        let mut released = 0usize;
        while let Some(buffer) = self.device.release() {
            ctx.pools.recycle_all([buffer]);
            released += 1;
        }
        self.device.stop();
        tracing::debug!(channel = self.channel, released, "Capture device stopped");
    }
}
