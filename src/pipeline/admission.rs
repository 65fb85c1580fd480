//! Capture admission policy.
//!
//! Decides per retrieved frame whether it enters the pipeline:
//!
//! - frames before `skip` are dropped while the sensor settles;
//! - with `wait == 0` everything after that is admitted;
//! - otherwise frames come in cycles of `burst + wait`, the first `burst`
//!   of each cycle admitted and the rest dropped.
//!
//! The decision depends only on its arguments, so a restarted capture with
//! the same configuration makes exactly the same choices.

use crate::error::{PipelineError, Result};

/// Pure admission decision for `frame_index`.
///
/// A `burst` of zero never admits once `wait > 0`; [`AdmissionPolicy::new`]
/// rejects that configuration before it can reach a stage.
pub fn admit(frame_index: u64, skip: u64, wait: u64, burst: u64) -> bool {
    if frame_index < skip {
        return false;
    }
    if wait == 0 {
        return true;
    }
    let offset = frame_index - skip;
    let cycle = burst.saturating_add(wait);
    offset % cycle < burst
}

/// Validated skip/wait/burst parameters of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    skip: u64,
    wait: u64,
    burst: u64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            skip: 0,
            wait: 0,
            burst: 1,
        }
    }
}

impl AdmissionPolicy {
    pub fn new(skip: u64, wait: u64, burst: u64) -> Result<Self> {
        if burst == 0 {
            return Err(PipelineError::Config(
                "burst length must be at least 1".into(),
            ));
        }
        Ok(Self { skip, wait, burst })
    }

    pub fn admit(&self, frame_index: u64) -> bool {
        admit(frame_index, self.skip, self.wait, self.burst)
    }

    /// Sequence number stamped on an admitted frame
    pub fn sequence_of(&self, frame_index: u64) -> u64 {
        frame_index.saturating_sub(self.skip)
    }

    pub fn skip(&self) -> u64 {
        self.skip
    }

    pub fn wait(&self) -> u64 {
        self.wait
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }
}
