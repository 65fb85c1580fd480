//! Output filenames.
//!
//! `{prefix}{tag}_vc{channel}_{frame:02}.{ext}`, where the tag comes from the
//! active runtime setting, else the sensor's filename tag.

use crate::config::RawFileFormat;
use std::path::PathBuf;

pub fn output_file_name(prefix: &str, tag: &str, channel: u32, frame: u64, format: RawFileFormat) -> String {
    format!("{prefix}{tag}_vc{channel}_{frame:02}.{}", format.extension())
}

/// Like [`output_file_name`], as a path; the prefix may contain directories
pub fn output_path(prefix: &str, tag: &str, channel: u32, frame: u64, format: RawFileFormat) -> PathBuf {
    PathBuf::from(output_file_name(prefix, tag, channel, frame, format))
}
