//! Interfaces to the external collaborators each stage drives.
//!
//! The pipeline never talks to hardware directly. Capture engines, blitters,
//! display engines, format converters and file writers sit behind the traits
//! below; [`sim`] provides in-process implementations used by the binary and
//! the tests, and [`file`] provides the on-disk frame writer.
//!
//! Traits that take ownership of buffers (`feed`, `flip`) hand them back
//! through [`DeviceFault::reclaimed`] on failure so the calling stage can
//! return them to their home pools.

pub mod file;
pub mod sim;

use crate::buffer::FrameBuffer;
use crate::error::PipelineError;
use crate::types::{Rect, SurfaceFormat};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub use file::RawFileWriter;
pub use sim::{
    RecordingWriter, SimBlitter, SimCaptureDevice, SimConverter, SimDisplay, SimDisplayProbe,
};

/// Failure from a collaborator that owned buffers at the time
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct DeviceFault {
    pub error: PipelineError,
    /// Buffers the device gives back
    pub reclaimed: Vec<FrameBuffer>,
}

impl DeviceFault {
    pub fn new(error: PipelineError, reclaimed: Vec<FrameBuffer>) -> Self {
        Self { error, reclaimed }
    }
}

/// Outcome of asking the capture engine for a filled frame
#[derive(Debug)]
pub enum Retrieved {
    Frame(FrameBuffer),
    /// No frame completed within the timeout
    Timeout,
    /// The engine has no empty buffers to capture into
    InsufficientBuffering,
}

/// Hardware capture engine for one channel
pub trait CaptureDevice: Send {
    /// Hand an empty buffer to the engine to capture into
    fn feed(&mut self, buffer: FrameBuffer, timeout: Duration) -> Result<(), DeviceFault>;

    /// Wait up to `timeout` for the next filled buffer
    fn retrieve(&mut self, timeout: Duration) -> crate::Result<Retrieved>;

    /// Give back one fed-but-unretrieved buffer; `None` once empty
    fn release(&mut self) -> Option<FrameBuffer>;

    /// Stop capturing
    fn stop(&mut self);
}

/// Scaling filter used by the blitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlitFilter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlitParams {
    /// Source region; whole surface when absent
    pub src_rect: Option<Rect>,
    pub filter: BlitFilter,
}

/// 2D copy engine
pub trait BlitEngine: Send {
    fn blit(
        &mut self,
        dst: &mut FrameBuffer,
        dst_rect: Rect,
        src: &FrameBuffer,
        params: &BlitParams,
    ) -> crate::Result<()>;
}

/// Display flip engine.
///
/// The engine keeps the flipped image on screen until a later flip replaces
/// it; buffers it no longer needs come back in the returned list.
pub trait DisplayEngine: Send {
    /// Show `image` (or flush with `None`) and return released buffers
    fn flip(
        &mut self,
        image: Option<FrameBuffer>,
        rect: Option<Rect>,
    ) -> Result<Vec<FrameBuffer>, DeviceFault>;
}

/// Bayer pattern of raw input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PixelOrder {
    #[default]
    Grbg,
    Rggb,
    Bggr,
    Gbrg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayoutParams {
    pub pixel_order: PixelOrder,
    /// Output format the converter writes
    pub output: SurfaceFormat,
}

/// Pixel format converter (e.g. raw to RGBA)
pub trait FormatConverter: Send {
    fn convert(
        &mut self,
        src: &FrameBuffer,
        dst: &mut FrameBuffer,
        layout: &LayoutParams,
    ) -> crate::Result<()>;
}

/// Metadata persisted alongside a saved frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub channel: u32,
    /// Saved-frame counter of the channel
    pub frame: u64,
    /// Admitted-frame sequence number
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: SurfaceFormat,
    pub settings_tag: String,
    pub saved_at: DateTime<Utc>,
}

impl FrameRecord {
    pub fn for_buffer(buffer: &FrameBuffer, channel: u32, frame: u64, tag: &str) -> Self {
        let meta = buffer.meta();
        Self {
            channel,
            frame,
            sequence: meta.sequence,
            width: meta.width,
            height: meta.height,
            format: meta.format,
            settings_tag: tag.to_string(),
            saved_at: Utc::now(),
        }
    }
}

/// Persists frames to storage
pub trait FileWriter: Send {
    fn write(&mut self, path: &Path, buffer: &FrameBuffer, record: &FrameRecord) -> crate::Result<()>;
}
