//! Process-wide cooperative cancellation.
//!
//! A [`CancelToken`] is cloned into every stage at construction. Stages poll
//! [`CancelToken::is_cancelled`] at loop top; blocking queue operations also
//! select on [`CancelToken::signal`], a channel that disconnects the moment
//! the token fires, so a blocked push/pop wakes immediately instead of
//! waiting out its timeout.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    /// Dropped on cancel; never sends
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// Shared cancellation flag
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Request shutdown. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut trigger = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        trigger.take();
        tracing::debug!("Cancellation requested");
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver that becomes disconnected once the token fires
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// Block until cancelled or `timeout` elapses. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.inner.signal.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            _ => true,
        }
    }

    /// Block until cancelled
    pub fn wait(&self) {
        while !self.is_cancelled() {
            let _ = self.inner.signal.recv();
        }
    }
}
