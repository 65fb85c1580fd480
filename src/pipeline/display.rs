//! Display stage: shows composite frames.
//!
//! The display engine keeps the current image on screen and hands back the
//! one it replaced, which goes straight home. On shutdown the stage flushes
//! the engine so the last image is released too.

use super::stage::{Flow, StageContext, StageWorker};
use crate::buffer::{ExchangeQueue, QueueFailure, Wait};
use crate::config::{DisplayConfig, TimeoutConfig};
use crate::devices::DisplayEngine;
use crate::error::Result;
use crate::types::Rect;

pub struct DisplayStage {
    input: ExchangeQueue,
    engine: Box<dyn DisplayEngine>,
    position: Option<Rect>,
    dequeue: Wait,
}

impl DisplayStage {
    pub fn new(
        input: ExchangeQueue,
        engine: Box<dyn DisplayEngine>,
        config: &DisplayConfig,
        timeouts: &TimeoutConfig,
    ) -> Self {
        Self {
            input,
            engine,
            position: config.position,
            dequeue: Wait::millis(timeouts.display_dequeue_ms),
        }
    }
}

impl StageWorker for DisplayStage {
    fn name(&self) -> String {
        "display".to_string()
    }

    fn step(&mut self, ctx: &StageContext) -> Result<Flow> {
        let image = match self.input.pop(self.dequeue, Some(&ctx.cancel)) {
            Ok(buffer) => buffer,
            Err(QueueFailure::Empty) => {
                ctx.status.record_timeout();
                return Ok(Flow::Continue);
            }
            Err(failure) => return Err(failure.into_error(self.input.name())),
        };

        match self.engine.flip(Some(image), self.position) {
            Ok(released) => {
                ctx.pools.recycle_all(released);
                ctx.status.record_processed();
                Ok(Flow::Continue)
            }
            Err(fault) => {
                ctx.pools.recycle_all(fault.reclaimed);
                Err(fault.error.with_context("display flip"))
            }
        }
    }

    fn drain(&mut self, ctx: &StageContext) {
        match self.engine.flip(None, None) {
            Ok(released) => ctx.pools.recycle_all(released),
            Err(fault) => {
                tracing::error!("Display flush failed: {}", fault.error);
                ctx.pools.recycle_all(fault.reclaimed);
            }
        }
    }
}
