//! Bounded buffer-exchange queue.
//!
//! [`ExchangeQueue`] is a fixed-capacity MPMC FIFO of [`FrameBuffer`]s
//! backed by a crossbeam bounded channel. The queue keeps both channel ends,
//! so it never disconnects while a handle exists; clones share the same
//! storage.
//!
//! Push and pop take a [`Wait`] and an optional [`CancelToken`]. With a
//! token, the operation selects on the token's signal as well, so
//! cancellation wakes a blocked call immediately. A failed push hands the
//! buffer back inside [`PushError`]; nothing is ever dropped on failure.

use super::frame::FrameBuffer;
use crate::error::PipelineError;
use crate::pipeline::cancel::CancelToken;
use crossbeam_channel::{bounded, Receiver, Select, Sender};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long a queue operation may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Non-blocking
    Immediate,
    /// Block up to the duration
    For(Duration),
    /// Block until the operation completes or is cancelled
    Forever,
}

impl Wait {
    /// `0` means non-blocking
    pub fn millis(ms: u64) -> Self {
        if ms == 0 {
            Wait::Immediate
        } else {
            Wait::For(Duration::from_millis(ms))
        }
    }
}

impl From<Duration> for Wait {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Wait::Immediate
        } else {
            Wait::For(duration)
        }
    }
}

/// Why a queue operation gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFailure {
    /// No space before the wait elapsed
    Full,
    /// Nothing to take before the wait elapsed
    Empty,
    /// The cancel token fired
    Cancelled,
    /// The underlying channel closed
    Disconnected,
}

impl QueueFailure {
    pub fn into_error(self, queue: &str) -> PipelineError {
        match self {
            QueueFailure::Full => PipelineError::QueueFull(queue.to_string()),
            QueueFailure::Empty => PipelineError::QueueEmpty(queue.to_string()),
            QueueFailure::Cancelled => PipelineError::Cancelled,
            QueueFailure::Disconnected => {
                PipelineError::ResourceExhausted(format!("queue `{queue}` disconnected"))
            }
        }
    }
}

/// Failed push; owns the buffer that could not be queued
#[derive(Debug)]
pub struct PushError {
    reason: QueueFailure,
    buffer: FrameBuffer,
}

impl PushError {
    pub fn reason(&self) -> QueueFailure {
        self.reason
    }

    pub fn into_buffer(self) -> FrameBuffer {
        self.buffer
    }

    pub fn into_parts(self) -> (QueueFailure, FrameBuffer) {
        (self.reason, self.buffer)
    }
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "push of {} failed: {:?}", self.buffer.id(), self.reason)
    }
}

/// Failed pop
pub type PopError = QueueFailure;

/// Bounded FIFO of frame buffers
#[derive(Clone)]
pub struct ExchangeQueue {
    name: Arc<str>,
    capacity: usize,
    sender: Sender<FrameBuffer>,
    receiver: Receiver<FrameBuffer>,
}

impl fmt::Debug for ExchangeQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl ExchangeQueue {
    /// Create an empty queue holding at most `capacity` buffers
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            name: Arc::from(name.into()),
            capacity,
            sender,
            receiver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    /// Push, blocking up to `wait` while the queue is full
    pub fn push(
        &self,
        buffer: FrameBuffer,
        wait: Wait,
        cancel: Option<&CancelToken>,
    ) -> Result<(), PushError> {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(PushError {
                reason: QueueFailure::Cancelled,
                buffer,
            });
        }

        let mut select = Select::new();
        let send_index = select.send(&self.sender);
        if let Some(token) = cancel {
            select.recv(token.signal());
        }

        let selected = match wait {
            Wait::Immediate => select.try_select().ok(),
            Wait::For(timeout) => select.select_timeout(timeout).ok(),
            Wait::Forever => Some(select.select()),
        };

        match (selected, cancel) {
            (None, _) => Err(PushError {
                reason: QueueFailure::Full,
                buffer,
            }),
            (Some(op), _) if op.index() == send_index => {
                op.send(&self.sender, buffer).map_err(|e| PushError {
                    reason: QueueFailure::Disconnected,
                    buffer: e.into_inner(),
                })
            }
            (Some(op), Some(token)) => {
                let _ = op.recv(token.signal());
                Err(PushError {
                    reason: QueueFailure::Cancelled,
                    buffer,
                })
            }
            (Some(_), None) => unreachable!("only the send operation is registered"),
        }
    }

    /// Pop the oldest buffer, blocking up to `wait` while the queue is empty
    pub fn pop(&self, wait: Wait, cancel: Option<&CancelToken>) -> Result<FrameBuffer, PopError> {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(QueueFailure::Cancelled);
        }

        let mut select = Select::new();
        let recv_index = select.recv(&self.receiver);
        if let Some(token) = cancel {
            select.recv(token.signal());
        }

        let selected = match wait {
            Wait::Immediate => select.try_select().ok(),
            Wait::For(timeout) => select.select_timeout(timeout).ok(),
            Wait::Forever => Some(select.select()),
        };

        match (selected, cancel) {
            (None, _) => Err(QueueFailure::Empty),
            (Some(op), _) if op.index() == recv_index => op
                .recv(&self.receiver)
                .map_err(|_| QueueFailure::Disconnected),
            (Some(op), Some(token)) => {
                let _ = op.recv(token.signal());
                Err(QueueFailure::Cancelled)
            }
            (Some(_), None) => unreachable!("only the receive operation is registered"),
        }
    }

    /// Push, retrying each `wait` interval while the queue stays full.
    ///
    /// Full is backpressure, not failure: this only gives up when the token
    /// fires (or the channel disconnects).
    pub fn push_with_backpressure(
        &self,
        mut buffer: FrameBuffer,
        wait: Wait,
        cancel: &CancelToken,
    ) -> Result<(), PushError> {
        loop {
            match self.push(buffer, wait, Some(cancel)) {
                Ok(()) => return Ok(()),
                Err(err) if err.reason() == QueueFailure::Full => {
                    tracing::trace!(queue = %self.name, "Backpressure, retrying push");
                    buffer = err.into_buffer();
                    if wait == Wait::Immediate {
                        std::thread::yield_now();
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Take every queued buffer without blocking
    pub fn drain(&self) -> Vec<FrameBuffer> {
        self.receiver.try_iter().collect()
    }
}
