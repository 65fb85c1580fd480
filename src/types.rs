//! Core data types shared across the pipeline
//!
//! # Main Types
//!
//! - [`SurfaceFormat`] - Pixel layout of a frame buffer
//! - [`FrameMeta`] - Geometry, format and sequence number carried with each buffer
//! - [`Rect`] - Destination/source rectangles for blit and display
//! - [`PoolId`] - Identifier of a buffer's home pool
//! - [`StageState`] - Lifecycle of a pipeline stage worker
//! - [`StageStats`] - Per-stage counters

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel layout of an image surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceFormat {
    /// 8-bit bayer
    Raw8,
    /// 10-bit bayer in 16-bit containers
    Raw10,
    /// 12-bit bayer in 16-bit containers
    #[default]
    Raw12,
    /// Packed YUV 4:2:2
    Yuv422,
    /// 8-bit RGBA
    Rgba,
}

impl SurfaceFormat {
    /// Bytes used per pixel in the backing allocation
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            SurfaceFormat::Raw8 => 1,
            SurfaceFormat::Raw10 | SurfaceFormat::Raw12 | SurfaceFormat::Yuv422 => 2,
            SurfaceFormat::Rgba => 4,
        }
    }

    /// Whether frames in this format need conversion before display
    pub fn is_raw(&self) -> bool {
        matches!(
            self,
            SurfaceFormat::Raw8 | SurfaceFormat::Raw10 | SurfaceFormat::Raw12
        )
    }

    /// Size in bytes of a `width` x `height` surface
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

impl fmt::Display for SurfaceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceFormat::Raw8 => write!(f, "raw8"),
            SurfaceFormat::Raw10 => write!(f, "raw10"),
            SurfaceFormat::Raw12 => write!(f, "raw12"),
            SurfaceFormat::Yuv422 => write!(f, "yuv422"),
            SurfaceFormat::Rgba => write!(f, "rgba"),
        }
    }
}

/// Metadata that travels with a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub format: SurfaceFormat,
    /// Admitted-frame sequence number, reset by every capture
    pub sequence: u64,
    /// Capture channel that last filled the buffer
    pub channel: Option<u32>,
}

impl FrameMeta {
    /// Metadata for a freshly allocated, never-filled buffer
    pub fn new(width: u32, height: u32, format: SurfaceFormat) -> Self {
        Self {
            width,
            height,
            format,
            sequence: 0,
            channel: None,
        }
    }

    /// Bytes needed to hold one frame with this geometry
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

/// Axis-aligned rectangle, `x1`/`y1` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Rectangle anchored at the origin
    pub fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }
}

/// Identifier of a buffer pool inside a [`PoolRegistry`](crate::buffer::PoolRegistry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(pub u32);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// Lifecycle of a stage worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum StageState {
    /// Constructed, thread not yet running
    #[default]
    Idle = 0,
    /// Processing frames
    Running = 1,
    /// Returning held buffers to their home pools
    Draining = 2,
    /// Exited; no buffers held
    Stopped = 3,
}

impl StageState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => StageState::Running,
            2 => StageState::Draining,
            3 => StageState::Stopped,
            _ => StageState::Idle,
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Idle => write!(f, "Idle"),
            StageState::Running => write!(f, "Running"),
            StageState::Draining => write!(f, "Draining"),
            StageState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Snapshot of a stage's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    /// Buffers successfully handed downstream (or written, for terminal stages)
    pub processed: u64,
    /// Buffers recycled without being forwarded
    pub dropped: u64,
    /// Expected timeouts absorbed by the loop
    pub timeouts: u64,
    /// Hard failures reported by the collaborator
    pub failures: u64,
}
