//! Simulated collaborators.
//!
//! These stand in for the capture engine, blitter, display and converter so
//! the full pipeline runs in-process. Each one can be told to fail, which is
//! how the tests drive the fatal-error paths.

use super::{
    BlitEngine, BlitParams, CaptureDevice, DeviceFault, DisplayEngine, FileWriter, FormatConverter,
    FrameRecord, LayoutParams, Retrieved,
};
use crate::buffer::FrameBuffer;
use crate::error::{PipelineError, Result};
use crate::types::Rect;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Capture engine that fills fed buffers with a per-frame pattern
#[derive(Debug)]
pub struct SimCaptureDevice {
    channel: u32,
    fed: VecDeque<FrameBuffer>,
    frame_interval: Duration,
    produced: u64,
    fail_after: Option<u64>,
    stalled: bool,
    stopped: bool,
}

impl SimCaptureDevice {
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            fed: VecDeque::new(),
            frame_interval: Duration::from_millis(1),
            produced: 0,
            fail_after: None,
            stalled: false,
            stopped: false,
        }
    }

    /// Time spent "exposing" each frame
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Report a link failure once `frames` frames have been produced
    pub fn with_failure_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Never complete a frame; every retrieve times out
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    pub fn fed(&self) -> usize {
        self.fed.len()
    }
}

impl CaptureDevice for SimCaptureDevice {
    fn feed(&mut self, buffer: FrameBuffer, _timeout: Duration) -> std::result::Result<(), DeviceFault> {
        if self.stopped {
            return Err(DeviceFault::new(
                PipelineError::device("capture", "feed after stop"),
                vec![buffer],
            ));
        }
        self.fed.push_back(buffer);
        Ok(())
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<Retrieved> {
        if self.stopped {
            return Err(PipelineError::device("capture", "retrieve after stop"));
        }
        if self.stalled {
            thread::sleep(timeout);
            return Ok(Retrieved::Timeout);
        }
        if self.fail_after == Some(self.produced) {
            return Err(PipelineError::device(
                "capture",
                format!("channel {} link lost", self.channel),
            ));
        }
        let Some(mut buffer) = self.fed.pop_front() else {
            // a real engine waits out the timeout for a buffer to arrive
            thread::sleep(timeout);
            return Ok(Retrieved::InsufficientBuffering);
        };

        thread::sleep(self.frame_interval.min(timeout));
        let pattern = (self.produced as u8).wrapping_add((self.channel as u8).wrapping_mul(64));
        buffer.data_mut().fill(pattern);
        self.produced += 1;
        Ok(Retrieved::Frame(buffer))
    }

    fn release(&mut self) -> Option<FrameBuffer> {
        self.fed.pop_front()
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

/// Row-copying blitter
#[derive(Debug, Default)]
pub struct SimBlitter {
    failing: bool,
    blits: u64,
}

impl SimBlitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            blits: 0,
        }
    }

    pub fn blits(&self) -> u64 {
        self.blits
    }
}

impl BlitEngine for SimBlitter {
    fn blit(
        &mut self,
        dst: &mut FrameBuffer,
        dst_rect: Rect,
        src: &FrameBuffer,
        params: &BlitParams,
    ) -> Result<()> {
        if self.failing {
            return Err(PipelineError::device("blit", "engine fault"));
        }
        let dst_meta = *dst.meta();
        if dst_rect.x1 > dst_meta.width || dst_rect.y1 > dst_meta.height {
            return Err(PipelineError::device(
                "blit",
                format!("destination {:?} outside {}x{}", dst_rect, dst_meta.width, dst_meta.height),
            ));
        }

        let src_meta = src.meta();
        let src_rect = params
            .src_rect
            .unwrap_or_else(|| Rect::sized(src_meta.width, src_meta.height));
        let bpp = dst_meta.format.bytes_per_pixel();
        let src_bpp = src_meta.format.bytes_per_pixel();
        let rows = src_rect.height().min(dst_rect.height()) as usize;
        let cols = src_rect.width().min(dst_rect.width()) as usize;
        let row_bytes = cols * bpp.min(src_bpp);
        let (src_stride, dst_stride) = (src.stride(), dst.stride());

        for row in 0..rows {
            let s = (src_rect.y0 as usize + row) * src_stride + src_rect.x0 as usize * src_bpp;
            let d = (dst_rect.y0 as usize + row) * dst_stride + dst_rect.x0 as usize * bpp;
            dst.data_mut()[d..d + row_bytes].copy_from_slice(&src.data()[s..s + row_bytes]);
        }
        self.blits += 1;
        Ok(())
    }
}

/// Shared view of a [`SimDisplay`]'s activity
#[derive(Debug, Clone, Default)]
pub struct SimDisplayProbe {
    flips: Arc<AtomicU64>,
}

impl SimDisplayProbe {
    pub fn flips(&self) -> u64 {
        self.flips.load(Ordering::SeqCst)
    }
}

/// Display that keeps the last flipped image on screen
#[derive(Debug, Default)]
pub struct SimDisplay {
    on_screen: Option<FrameBuffer>,
    probe: SimDisplayProbe,
    fail_after: Option<u64>,
}

impl SimDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the flip after `flips` successful ones
    pub fn with_failure_after(mut self, flips: u64) -> Self {
        self.fail_after = Some(flips);
        self
    }

    pub fn probe(&self) -> SimDisplayProbe {
        self.probe.clone()
    }
}

impl DisplayEngine for SimDisplay {
    fn flip(
        &mut self,
        image: Option<FrameBuffer>,
        _rect: Option<Rect>,
    ) -> std::result::Result<Vec<FrameBuffer>, DeviceFault> {
        if image.is_some() && self.fail_after == Some(self.probe.flips()) {
            return Err(DeviceFault::new(
                PipelineError::device("display", "flip rejected"),
                image.into_iter().collect(),
            ));
        }
        let released: Vec<FrameBuffer> = self.on_screen.take().into_iter().collect();
        if image.is_some() {
            self.probe.flips.fetch_add(1, Ordering::SeqCst);
        }
        self.on_screen = image;
        Ok(released)
    }
}

/// Raw to RGBA converter that halves each dimension
#[derive(Debug, Default)]
pub struct SimConverter {
    failing: bool,
}

impl SimConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { failing: true }
    }
}

impl FormatConverter for SimConverter {
    fn convert(&mut self, src: &FrameBuffer, dst: &mut FrameBuffer, layout: &LayoutParams) -> Result<()> {
        if self.failing {
            return Err(PipelineError::device("convert", "converter fault"));
        }
        let (src_meta, dst_meta) = (*src.meta(), *dst.meta());
        if dst_meta.format != layout.output {
            return Err(PipelineError::device(
                "convert",
                format!("destination is {}, expected {}", dst_meta.format, layout.output),
            ));
        }
        if dst_meta.width * 2 > src_meta.width || dst_meta.height * 2 > src_meta.height {
            return Err(PipelineError::device(
                "convert",
                format!(
                    "{}x{} does not fit a half-size {}x{} output",
                    src_meta.width, src_meta.height, dst_meta.width, dst_meta.height
                ),
            ));
        }

        let src_bpp = src_meta.format.bytes_per_pixel();
        let dst_bpp = dst_meta.format.bytes_per_pixel();
        let (src_stride, dst_stride) = (src.stride(), dst.stride());
        for y in 0..dst_meta.height as usize {
            for x in 0..dst_meta.width as usize {
                let value = src.data()[2 * y * src_stride + 2 * x * src_bpp];
                let d = y * dst_stride + x * dst_bpp;
                let pixel = &mut dst.data_mut()[d..d + dst_bpp];
                pixel.fill(value);
                if let Some(alpha) = pixel.get_mut(3) {
                    *alpha = u8::MAX;
                }
            }
        }
        Ok(())
    }
}

/// File writer that only records what it was asked to write
#[derive(Debug, Clone, Default)]
pub struct RecordingWriter {
    records: Arc<Mutex<Vec<(PathBuf, FrameRecord)>>>,
    failing: bool,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Everything written so far, across clones
    pub fn records(&self) -> Vec<(PathBuf, FrameRecord)> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl FileWriter for RecordingWriter {
    fn write(&mut self, path: &Path, _buffer: &FrameBuffer, record: &FrameRecord) -> Result<()> {
        if self.failing {
            return Err(PipelineError::device("writer", "disk full"));
        }
        let mut records = self
            .records
            .lock()
            .map_err(|_| PipelineError::device("writer", "record log poisoned"))?;
        records.push((path.to_path_buf(), record.clone()));
        Ok(())
    }
}
