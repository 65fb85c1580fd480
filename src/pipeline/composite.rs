//! Composite stage: one shared across channels.
//!
//! Collects one frame per channel into its slots, blits them side by side
//! into a composite buffer and forwards that to the display stage. Slots
//! already filled are kept while waiting for the remaining channels.

use super::stage::{Flow, StageContext, StageWorker};
use crate::buffer::{ExchangeQueue, FrameBuffer, QueueFailure, Wait};
use crate::config::TimeoutConfig;
use crate::devices::{BlitEngine, BlitParams};
use crate::error::{PipelineError, Result, ResultExt};
use crate::types::{PoolId, Rect};

/// Destination rectangles for channels of the given sizes, laid out left to
/// right, plus the overall `(width, height)`
pub fn composite_layout(sizes: &[(u32, u32)]) -> (Vec<Rect>, u32, u32) {
    let mut x0 = 0;
    let rects = sizes
        .iter()
        .map(|&(width, height)| {
            let rect = Rect::new(x0, 0, x0 + width, height);
            x0 += width;
            rect
        })
        .collect();
    let height = sizes.iter().map(|&(_, h)| h).max().unwrap_or(0);
    (rects, x0, height)
}

#[derive(Debug, Clone, Copy)]
struct CompositeTimeouts {
    dequeue: Wait,
    enqueue: Wait,
    priming: Wait,
}

pub struct CompositeStage {
    inputs: Vec<ExchangeQueue>,
    output: ExchangeQueue,
    blitter: Box<dyn BlitEngine>,
    pool: PoolId,
    rects: Vec<Rect>,
    slots: Vec<Option<FrameBuffer>>,
    timeouts: CompositeTimeouts,
}

impl CompositeStage {
    /// `inputs[i]` is blitted into `rects[i]`
    pub fn new(
        inputs: Vec<ExchangeQueue>,
        rects: Vec<Rect>,
        output: ExchangeQueue,
        blitter: Box<dyn BlitEngine>,
        pool: PoolId,
        timeouts: &TimeoutConfig,
    ) -> Result<Self> {
        if inputs.len() != rects.len() || inputs.is_empty() {
            return Err(PipelineError::Config(format!(
                "composite needs one rectangle per input, got {} inputs and {} rectangles",
                inputs.len(),
                rects.len()
            )));
        }
        let slots = inputs.iter().map(|_| None).collect();
        Ok(Self {
            inputs,
            output,
            blitter,
            pool,
            rects,
            slots,
            timeouts: CompositeTimeouts {
                dequeue: Wait::millis(timeouts.composite_dequeue_ms),
                enqueue: Wait::millis(timeouts.composite_enqueue_ms),
                priming: Wait::millis(timeouts.priming_ms),
            },
        })
    }

    /// Fill empty slots; false if some channel had nothing in time
    fn fill_slots(&mut self, ctx: &StageContext) -> Result<bool> {
        for (slot, input) in self.slots.iter_mut().zip(&self.inputs) {
            if slot.is_some() {
                continue;
            }
            match input.pop(self.timeouts.dequeue, Some(&ctx.cancel)) {
                Ok(buffer) => *slot = Some(buffer),
                Err(QueueFailure::Empty) => {
                    ctx.status.record_timeout();
                    return Ok(false);
                }
                Err(failure) => return Err(failure.into_error(input.name())),
            }
        }
        Ok(true)
    }
}

impl StageWorker for CompositeStage {
    fn name(&self) -> String {
        "composite".to_string()
    }

    fn step(&mut self, ctx: &StageContext) -> Result<Flow> {
        if !self.fill_slots(ctx)? {
            return Ok(Flow::Continue);
        }

        let pool = ctx.pools.pool(self.pool)?;
        let target = match pool.acquire(self.timeouts.priming, Some(&ctx.cancel)) {
            Ok(buffer) => buffer,
            Err(QueueFailure::Cancelled) => return Ok(Flow::Continue),
            Err(_) => {
                return Err(PipelineError::ResourceExhausted(format!(
                    "composite pool `{}` empty",
                    pool.name()
                )))
            }
        };
        let mut target = ctx.pools.guard(target);

        let mut sequence = 0;
        for (index, (slot, rect)) in self.slots.iter().zip(&self.rects).enumerate() {
            let Some(source) = slot else { continue };
            sequence = sequence.max(source.meta().sequence);
            self.blitter
                .blit(&mut target, *rect, source, &BlitParams::default())
                .with_context(|| format!("blit channel {index}"))?;
        }
        target.set_sequence(sequence);
        target.set_channel(None);
        ctx.pools.recycle_all(self.slots.iter_mut().filter_map(Option::take));

        if target.forward(&self.output, self.timeouts.enqueue, &ctx.cancel) {
            ctx.status.record_processed();
        }
        Ok(Flow::Continue)
    }

    fn drain(&mut self, ctx: &StageContext) {
        ctx.pools.recycle_all(self.slots.iter_mut().filter_map(Option::take));
    }
}
