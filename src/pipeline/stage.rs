//! Common worker loop shared by every pipeline stage.
//!
//! A stage is a [`StageWorker`] run on its own thread by [`spawn_stage`].
//! The loop drives the `Idle → Running → Draining → Stopped` state machine:
//!
//! - **Running**: call [`StageWorker::step`] until the cancel token fires,
//!   the worker reports [`Flow::Finished`], or a step fails.
//! - A failed step is fatal for the whole run: the loop trips the cancel
//!   token so every other stage unwinds too.
//! - **Draining**: [`StageWorker::drain`] returns every buffer the worker
//!   still holds to its home pool.
//! - **Stopped**: the exit signal fires; [`StageHandle::wait_stopped`] and
//!   [`StageHandle::join`] block on it rather than polling.

use super::cancel::CancelToken;
use crate::buffer::PoolRegistry;
use crate::error::{PipelineError, Result};
use crate::types::{StageState, StageStats};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What the loop should do after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The stage reached its own end condition (e.g. frame limit)
    Finished,
}

/// Shared state and counters of one stage
#[derive(Debug, Default)]
pub struct StageStatus {
    state: AtomicU8,
    processed: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

impl StageStatus {
    pub fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: StageState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StageStats {
        StageStats {
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Everything a stage step can reach besides its own fields
#[derive(Debug, Clone)]
pub struct StageContext {
    pub cancel: CancelToken,
    pub pools: Arc<PoolRegistry>,
    pub status: Arc<StageStatus>,
}

/// One pipeline stage
pub trait StageWorker: Send {
    /// Name used for the thread and in logs
    fn name(&self) -> String;

    /// One pass of the loop: acquire input, process, route the result.
    ///
    /// Expected timeouts and backpressure are handled inside and reported as
    /// [`Flow::Continue`]; an `Err` is fatal for the run.
    fn step(&mut self, ctx: &StageContext) -> Result<Flow>;

    /// Return every held buffer to its home pool
    fn drain(&mut self, ctx: &StageContext);
}

/// Owner-side view of a running stage
#[derive(Debug)]
pub struct StageHandle {
    name: String,
    status: Arc<StageStatus>,
    exited: Receiver<()>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl StageHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        self.status.state()
    }

    pub fn stats(&self) -> StageStats {
        self.status.stats()
    }

    /// Block until the stage reaches `Stopped` or `timeout` elapses.
    /// Returns true if stopped.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            _ => true,
        }
    }

    /// Wait for the thread to finish and collect its outcome
    pub fn join(mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread.join().unwrap_or_else(|_| {
            Err(PipelineError::device(
                self.name.clone(),
                "stage thread panicked",
            ))
        })
    }
}

/// Start `worker` on a named thread
pub fn spawn_stage(
    mut worker: Box<dyn StageWorker>,
    cancel: CancelToken,
    pools: Arc<PoolRegistry>,
) -> Result<StageHandle> {
    let name = worker.name();
    let status = Arc::new(StageStatus::default());
    let (exit_tx, exited) = bounded::<()>(0);
    let ctx = StageContext {
        cancel,
        pools,
        status: status.clone(),
    };

    let thread = thread::Builder::new()
        .name(name.clone())
        .spawn(move || run_stage(worker.as_mut(), &ctx, exit_tx))
        .map_err(|e| PipelineError::Io(e).with_context("spawn stage thread"))?;

    Ok(StageHandle {
        name,
        status,
        exited,
        thread: Some(thread),
    })
}

/// Body of a stage thread. `_exit` is dropped on return (or unwind), which
/// is what [`StageHandle::wait_stopped`] observes.
fn run_stage(worker: &mut dyn StageWorker, ctx: &StageContext, _exit: Sender<()>) -> Result<()> {
    let name = worker.name();
    ctx.status.set_state(StageState::Running);
    tracing::info!(stage = %name, "Stage started");

    let mut outcome = Ok(());
    while !ctx.cancel.is_cancelled() {
        match worker.step(ctx) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Finished) => {
                tracing::info!(stage = %name, "Stage finished");
                break;
            }
            Err(e) if e.is_cancellation() => break,
            Err(e) => {
                tracing::error!(stage = %name, "Fatal stage error: {}", e);
                ctx.status.record_failure();
                ctx.cancel.cancel();
                outcome = Err(e.with_context(name.clone()));
                break;
            }
        }
    }

    ctx.status.set_state(StageState::Draining);
    worker.drain(ctx);
    ctx.status.set_state(StageState::Stopped);

    let stats = ctx.status.stats();
    tracing::info!(
        stage = %name,
        processed = stats.processed,
        dropped = stats.dropped,
        timeouts = stats.timeouts,
        "Stage stopped"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ExchangeQueue, PopError, Wait};
    use crate::types::{FrameMeta, PoolId, SurfaceFormat};
    use std::time::Instant;

    /// Moves buffers from a queue into its hands and never lets go until drained
    struct Hoarder {
        input: ExchangeQueue,
        held: Vec<crate::buffer::FrameBuffer>,
        fail_after: Option<usize>,
        finish_after: Option<usize>,
    }

    impl StageWorker for Hoarder {
        fn name(&self) -> String {
            "hoarder".into()
        }

        fn step(&mut self, ctx: &StageContext) -> Result<Flow> {
            if self.fail_after == Some(self.held.len()) {
                return Err(PipelineError::device("hoarder", "boom"));
            }
            if self.finish_after == Some(self.held.len()) {
                return Ok(Flow::Finished);
            }
            match self
                .input
                .pop(Wait::For(Duration::from_millis(20)), Some(&ctx.cancel))
            {
                Ok(buffer) => {
                    self.held.push(buffer);
                    ctx.status.record_processed();
                }
                Err(PopError::Empty) => ctx.status.record_timeout(),
                Err(_) => {}
            }
            Ok(Flow::Continue)
        }

        fn drain(&mut self, ctx: &StageContext) {
            ctx.pools.recycle_all(self.held.drain(..));
        }
    }

    fn setup(count: usize) -> (Arc<PoolRegistry>, PoolId, ExchangeQueue) {
        let mut registry = PoolRegistry::new();
        let id = registry
            .create_pool("src", count, FrameMeta::new(2, 2, SurfaceFormat::Raw8))
            .unwrap();
        let registry = Arc::new(registry);
        let input = ExchangeQueue::new("in", count);
        let pool = registry.pool(id).unwrap();
        while let Ok(buffer) = pool.acquire(Wait::Immediate, None) {
            input.push(buffer, Wait::Immediate, None).unwrap();
        }
        (registry, id, input)
    }

    #[test]
    fn test_cancel_stops_idle_stage_and_drains() {
        let (registry, _, input) = setup(3);
        let cancel = CancelToken::new();
        let worker = Hoarder {
            input,
            held: Vec::new(),
            fail_after: None,
            finish_after: None,
        };
        let handle = spawn_stage(Box::new(worker), cancel.clone(), registry.clone()).unwrap();

        // Wait until everything has been hoarded and the stage is blocked on an empty queue
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().processed < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.state(), StageState::Running);

        cancel.cancel();
        assert!(handle.wait_stopped(Duration::from_secs(1)));
        assert_eq!(handle.state(), StageState::Stopped);
        handle.join().unwrap();
        assert!(registry.conservation().is_balanced());
    }

    #[test]
    fn test_fatal_error_trips_cancel() {
        let (registry, id, input) = setup(1);
        let cancel = CancelToken::new();
        let worker = Hoarder {
            input,
            held: Vec::new(),
            fail_after: Some(1),
            finish_after: None,
        };
        let handle = spawn_stage(Box::new(worker), cancel.clone(), registry.clone()).unwrap();

        assert!(handle.wait_stopped(Duration::from_secs(5)));
        assert!(cancel.is_cancelled());
        assert_eq!(handle.stats().failures, 1);
        assert!(handle.join().is_err());
        // the buffer held at the time of the fault went home through drain
        assert_eq!(registry.pool(id).unwrap().available(), 1);
        assert!(registry.conservation().is_balanced());
    }

    #[test]
    fn test_finished_stage_does_not_cancel_others() {
        let (registry, _, input) = setup(2);
        let cancel = CancelToken::new();
        let worker = Hoarder {
            input,
            held: Vec::new(),
            fail_after: None,
            finish_after: Some(2),
        };
        let handle = spawn_stage(Box::new(worker), cancel.clone(), registry.clone()).unwrap();

        assert!(handle.wait_stopped(Duration::from_secs(5)));
        assert!(!cancel.is_cancelled());
        handle.join().unwrap();
        assert!(registry.conservation().is_balanced());
    }
}
