//! Frame buffers and the queues they circulate through.
//!
//! # Ownership protocol
//!
//! A [`FrameBuffer`] is not `Clone`: at any instant exactly one queue or one
//! stage owns it. Every buffer records the [`PoolId`](crate::types::PoolId)
//! of the pool it was allocated into, and the [`PoolRegistry`] maps that id
//! back to the pool's queue. A stage that pops a buffer either forwards it
//! to one downstream [`ExchangeQueue`] or recycles it to its home pool,
//! regardless of which stage produced it.
//!
//! [`BufferGuard`] enforces the second half of that rule: a guarded buffer
//! that is neither forwarded nor taken goes home when the guard drops, which
//! covers `?` early returns and cancellation.
//!
//! Buffers are allocated once by [`BufferPool::create`] and released only
//! when the registry is dropped at teardown.

pub mod frame;
pub mod pool;
pub mod queue;

pub use frame::{BufferId, FrameBuffer};
pub use pool::{BufferGuard, BufferPool, ConservationReport, PoolBalance, PoolRegistry};
pub use queue::{ExchangeQueue, PopError, PushError, QueueFailure, Wait};
