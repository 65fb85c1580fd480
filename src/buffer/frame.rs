//! Frame buffer handle

use crate::types::{FrameMeta, PoolId};
use std::fmt;

/// Stable identity of a buffer: its pool and its slot in that pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    pub pool: PoolId,
    pub index: u32,
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.index)
    }
}

/// An image allocation plus the metadata that travels with it.
///
/// Only [`BufferPool`](super::BufferPool) creates these, and they are never
/// cloned, so each one exists in exactly one place.
#[derive(Debug)]
#[must_use = "a frame buffer must be forwarded or returned to its home pool"]
pub struct FrameBuffer {
    id: BufferId,
    meta: FrameMeta,
    data: Vec<u8>,
}

impl FrameBuffer {
    pub(crate) fn allocate(id: BufferId, meta: FrameMeta) -> Self {
        Self {
            id,
            meta,
            data: vec![0; meta.frame_size()],
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Pool this buffer was allocated into; fixed for its lifetime
    pub fn home(&self) -> PoolId {
        self.id.pool
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// Mutable metadata. Geometry and format are fixed by the pool, only
    /// the per-frame fields change.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.meta.sequence = sequence;
    }

    pub fn set_channel(&mut self, channel: Option<u32>) {
        self.meta.channel = channel;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes per row of the backing allocation
    pub fn stride(&self) -> usize {
        self.meta.width as usize * self.meta.format.bytes_per_pixel()
    }
}
