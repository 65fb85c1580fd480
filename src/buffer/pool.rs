//! Buffer pools and the registry that maps buffers back to them.

use super::frame::{BufferId, FrameBuffer};
use super::queue::{ExchangeQueue, PopError, QueueFailure, Wait};
use crate::error::{PipelineError, Result};
use crate::pipeline::cancel::CancelToken;
use crate::types::{FrameMeta, PoolId};
use serde::Serialize;
use std::ops::{Deref, DerefMut};

/// A fixed set of identical buffers plus the queue that holds the free ones
#[derive(Debug)]
pub struct BufferPool {
    id: PoolId,
    meta: FrameMeta,
    allocated: usize,
    free: ExchangeQueue,
}

impl BufferPool {
    /// Allocate `count` buffers of the given geometry straight into the
    /// pool's free queue. This is the only place buffers are created.
    pub fn create(id: PoolId, name: impl Into<String>, count: usize, meta: FrameMeta) -> Result<Self> {
        let name = name.into();
        if count == 0 {
            return Err(PipelineError::Config(format!(
                "pool `{name}` needs at least one buffer"
            )));
        }

        let free = ExchangeQueue::new(name, count);
        for index in 0..count {
            let buffer = FrameBuffer::allocate(
                BufferId {
                    pool: id,
                    index: index as u32,
                },
                meta,
            );
            free.push(buffer, Wait::Immediate, None).map_err(|e| {
                PipelineError::ResourceExhausted(format!("pool `{}` rejected {e}", free.name()))
            })?;
        }

        tracing::debug!(
            pool = %id,
            name = free.name(),
            count,
            width = meta.width,
            height = meta.height,
            format = %meta.format,
            "Allocated buffer pool"
        );

        Ok(Self {
            id,
            meta,
            allocated: count,
            free,
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.free.name()
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// Buffers created at allocation time
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Buffers currently sitting in the free queue
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// The free queue itself
    pub fn queue(&self) -> &ExchangeQueue {
        &self.free
    }

    /// Borrow a free buffer
    pub fn acquire(&self, wait: Wait, cancel: Option<&CancelToken>) -> std::result::Result<FrameBuffer, PopError> {
        self.free.pop(wait, cancel)
    }

    /// Return a buffer that belongs to this pool
    pub fn recycle(&self, buffer: FrameBuffer) -> Result<()> {
        if buffer.home() != self.id {
            return Err(PipelineError::ResourceExhausted(format!(
                "buffer {} recycled into foreign pool `{}`",
                buffer.id(),
                self.name()
            )));
        }
        // The free queue has room for every buffer the pool owns.
        self.free
            .push(buffer, Wait::Immediate, None)
            .map_err(|e| {
                let (reason, buffer) = e.into_parts();
                PipelineError::ResourceExhausted(format!(
                    "pool `{}` could not take back {}: {:?}",
                    self.name(),
                    buffer.id(),
                    reason
                ))
            })
    }
}

/// Lookup table from [`PoolId`] to pool.
///
/// Buffers carry only the id of their home pool; this table is the single
/// place that resolves it. Pools are added during setup, then the registry
/// is shared read-only behind an `Arc`.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: Vec<BufferPool>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new pool and return its id
    pub fn create_pool(&mut self, name: impl Into<String>, count: usize, meta: FrameMeta) -> Result<PoolId> {
        let id = PoolId(self.pools.len() as u32);
        self.pools.push(BufferPool::create(id, name, count, meta)?);
        Ok(id)
    }

    pub fn pool(&self, id: PoolId) -> Result<&BufferPool> {
        self.pools
            .get(id.0 as usize)
            .ok_or_else(|| PipelineError::Config(format!("unknown {id}")))
    }

    pub fn pools(&self) -> impl Iterator<Item = &BufferPool> {
        self.pools.iter()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Return a buffer to its home pool, wherever it came from
    pub fn recycle(&self, buffer: FrameBuffer) -> Result<()> {
        let pool = self.pool(buffer.home())?;
        pool.recycle(buffer)
    }

    /// Recycle a batch, logging rather than failing on individual errors
    pub fn recycle_all(&self, buffers: impl IntoIterator<Item = FrameBuffer>) {
        for buffer in buffers {
            let id = buffer.id();
            if let Err(e) = self.recycle(buffer) {
                tracing::error!(buffer = %id, "Failed to recycle buffer: {}", e);
            }
        }
    }

    /// Wrap a buffer so it goes home unless explicitly forwarded
    pub fn guard(&self, buffer: FrameBuffer) -> BufferGuard<'_> {
        BufferGuard {
            registry: self,
            buffer: Some(buffer),
        }
    }

    /// Compare each pool's free count against its allocation
    pub fn conservation(&self) -> ConservationReport {
        ConservationReport {
            pools: self
                .pools
                .iter()
                .map(|pool| PoolBalance {
                    pool: pool.id(),
                    name: pool.name().to_string(),
                    allocated: pool.allocated(),
                    recovered: pool.available(),
                })
                .collect(),
        }
    }
}

/// Scope guard over a borrowed buffer.
///
/// Dropping the guard returns the buffer to its home pool. Use
/// [`forward`](Self::forward) to hand it downstream instead.
#[derive(Debug)]
pub struct BufferGuard<'a> {
    registry: &'a PoolRegistry,
    buffer: Option<FrameBuffer>,
}

impl BufferGuard<'_> {
    /// Release ownership without recycling
    pub fn take(mut self) -> FrameBuffer {
        // Only `take`/`forward`/`Drop` empty the slot, and each consumes the guard.
        match self.buffer.take() {
            Some(buffer) => buffer,
            None => unreachable!("guard emptied before being consumed"),
        }
    }

    /// Push downstream, riding out backpressure until `cancel` fires.
    ///
    /// Returns `true` once queued. On cancellation the buffer is recycled to
    /// its home pool and `false` is returned.
    pub fn forward(self, queue: &ExchangeQueue, wait: Wait, cancel: &CancelToken) -> bool {
        let registry = self.registry;
        match queue.push_with_backpressure(self.take(), wait, cancel) {
            Ok(()) => true,
            Err(err) => {
                let (reason, buffer) = err.into_parts();
                if reason != QueueFailure::Cancelled {
                    tracing::warn!(queue = queue.name(), "Forward failed: {:?}", reason);
                }
                registry.recycle_all([buffer]);
                false
            }
        }
    }
}

impl Deref for BufferGuard<'_> {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        match &self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("guard emptied before being consumed"),
        }
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut FrameBuffer {
        match &mut self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("guard emptied before being consumed"),
        }
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.registry.recycle_all([buffer]);
        }
    }
}

/// Free vs allocated count of one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolBalance {
    pub pool: PoolId,
    pub name: String,
    pub allocated: usize,
    pub recovered: usize,
}

/// Buffer accounting taken after teardown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConservationReport {
    pub pools: Vec<PoolBalance>,
}

impl ConservationReport {
    /// Every pool got back exactly what it allocated
    pub fn is_balanced(&self) -> bool {
        self.pools.iter().all(|p| p.allocated == p.recovered)
    }

    pub fn missing(&self) -> impl Iterator<Item = &PoolBalance> {
        self.pools.iter().filter(|p| p.allocated != p.recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SurfaceFormat;

    fn meta() -> FrameMeta {
        FrameMeta::new(4, 4, SurfaceFormat::Raw8)
    }

    #[test]
    fn test_pool_allocates_into_free_queue() {
        let mut registry = PoolRegistry::new();
        let id = registry.create_pool("capture0", 5, meta()).unwrap();
        let pool = registry.pool(id).unwrap();
        assert_eq!(pool.allocated(), 5);
        assert_eq!(pool.available(), 5);
        assert!(registry.conservation().is_balanced());
    }

    #[test]
    fn test_zero_sized_pool_rejected() {
        let mut registry = PoolRegistry::new();
        assert!(registry.create_pool("empty", 0, meta()).is_err());
    }

    #[test]
    fn test_guard_returns_buffer_on_drop() {
        let mut registry = PoolRegistry::new();
        let id = registry.create_pool("p", 2, meta()).unwrap();
        let buffer = registry.pool(id).unwrap().acquire(Wait::Immediate, None).unwrap();
        assert_eq!(registry.pool(id).unwrap().available(), 1);
        {
            let mut guard = registry.guard(buffer);
            guard.set_sequence(9);
        }
        assert_eq!(registry.pool(id).unwrap().available(), 2);
    }

    #[test]
    fn test_guard_returns_buffer_on_error_path() {
        fn failing_step(registry: &PoolRegistry, buffer: FrameBuffer) -> Result<()> {
            let _guard = registry.guard(buffer);
            Err(PipelineError::device("blit", "engine fault"))
        }

        let mut registry = PoolRegistry::new();
        let id = registry.create_pool("p", 1, meta()).unwrap();
        let buffer = registry.pool(id).unwrap().acquire(Wait::Immediate, None).unwrap();
        assert!(failing_step(&registry, buffer).is_err());
        assert!(registry.conservation().is_balanced());
    }

    #[test]
    fn test_recycle_goes_to_origin_not_sender() {
        let mut registry = PoolRegistry::new();
        let capture = registry.create_pool("capture", 2, meta()).unwrap();
        let composite = registry.create_pool("composite", 2, meta()).unwrap();

        let buffer = registry.pool(capture).unwrap().acquire(Wait::Immediate, None).unwrap();
        // Handed through a queue owned by another stage, then recycled there.
        let hop = ExchangeQueue::new("hop", 1);
        hop.push(buffer, Wait::Immediate, None).unwrap();
        let buffer = hop.pop(Wait::Immediate, None).unwrap();
        registry.recycle(buffer).unwrap();

        assert_eq!(registry.pool(capture).unwrap().available(), 2);
        assert_eq!(registry.pool(composite).unwrap().available(), 2);
    }

    #[test]
    fn test_foreign_recycle_rejected() {
        let mut registry = PoolRegistry::new();
        let a = registry.create_pool("a", 1, meta()).unwrap();
        let b = registry.create_pool("b", 1, meta()).unwrap();
        let buffer = registry.pool(a).unwrap().acquire(Wait::Immediate, None).unwrap();
        let err = registry.pool(b).unwrap().recycle(buffer).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhausted(_)));
    }

    #[test]
    fn test_forward_moves_buffer_downstream() {
        let mut registry = PoolRegistry::new();
        let id = registry.create_pool("p", 1, meta()).unwrap();
        let queue = ExchangeQueue::new("out", 1);
        let token = CancelToken::new();

        let buffer = registry.pool(id).unwrap().acquire(Wait::Immediate, None).unwrap();
        assert!(registry.guard(buffer).forward(&queue, Wait::Immediate, &token));
        assert_eq!(queue.len(), 1);
        assert!(!registry.conservation().is_balanced());

        registry.recycle_all(queue.drain());
        assert!(registry.conservation().is_balanced());
    }

    #[test]
    fn test_cancelled_forward_recycles() {
        let mut registry = PoolRegistry::new();
        let id = registry.create_pool("p", 2, meta()).unwrap();
        let queue = ExchangeQueue::new("out", 1);
        let token = CancelToken::new();
        let pool = registry.pool(id).unwrap();

        queue
            .push(pool.acquire(Wait::Immediate, None).unwrap(), Wait::Immediate, None)
            .unwrap();
        token.cancel();
        let buffer = pool.acquire(Wait::Immediate, None).unwrap();
        assert!(!registry.guard(buffer).forward(&queue, Wait::Immediate, &token));
        assert_eq!(pool.available(), 1);
    }
}
