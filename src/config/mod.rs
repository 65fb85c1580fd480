//! Configuration for the capture pipeline
//!
//! The pipeline is configured once at startup from a TOML file and is
//! immutable afterwards. Every field has a default so a partial file (or
//! none at all) yields a runnable simulated setup.
//!
//! # Location
//!
//! When no explicit path is given, the configuration is read from the
//! platform config directory:
//!
//! - **Linux**: `~/.config/multicap/pipeline.toml`
//! - **macOS**: `~/Library/Application Support/multicap/pipeline.toml`
//! - **Windows**: `%APPDATA%\multicap\pipeline.toml`
//!
//! # Timeouts
//!
//! Queue timeouts are fixed per stage purpose: sub-second for steady-state
//! dequeue, longer for initial buffer priming. They live in
//! [`TimeoutConfig`] and default to the `*_MS` constants below.

pub mod runtime;

use crate::error::{PipelineError, Result};
use crate::pipeline::admission::AdmissionPolicy;
use crate::sensor::{CalibrationParameters, SensorProperties};
use crate::types::{Rect, SurfaceFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use runtime::{RuntimeSchedule, RuntimeSetting};

/// Directory name under the platform config dir
pub const APP_DIR: &str = "multicap";

/// Config filename
pub const CONFIG_FILE: &str = "pipeline.toml";

/// Minimum number of buffers in a capture pool
pub const MIN_CAPTURE_POOL_SIZE: usize = 5;

/// Maximum number of buffers a capture pool may hold
pub const MAX_CAPTURE_POOL_SIZE: usize = 64;

/// Capacity of the save stage input queue
pub const SAVE_QUEUE_SIZE: usize = 3;

/// Capacity of each composite input queue and the composite pool
pub const COMPOSITE_QUEUE_SIZE: usize = 3;

/// Capacity of the display input queue
pub const DISPLAY_QUEUE_SIZE: usize = 3;

/// Number of conversion buffers per channel
pub const CONVERSION_POOL_SIZE: usize = 5;

pub const CAPTURE_DEQUEUE_TIMEOUT_MS: u64 = 1000;
pub const CAPTURE_ENQUEUE_TIMEOUT_MS: u64 = 100;
pub const CAPTURE_FEED_TIMEOUT_MS: u64 = 100;
pub const CAPTURE_GET_FRAME_TIMEOUT_MS: u64 = 500;

/// Consecutive retrieve timeouts tolerated before the capture stage gives up
pub const CAPTURE_MAX_RETRY: u32 = 10;

pub const SAVE_DEQUEUE_TIMEOUT_MS: u64 = 1000;
pub const SAVE_ENQUEUE_TIMEOUT_MS: u64 = 100;
pub const COMPOSITE_DEQUEUE_TIMEOUT_MS: u64 = 1000;
pub const COMPOSITE_ENQUEUE_TIMEOUT_MS: u64 = 100;
pub const DISPLAY_DEQUEUE_TIMEOUT_MS: u64 = 1000;

/// Longest wait for a pool buffer before declaring the pool exhausted
pub const PRIMING_TIMEOUT_MS: u64 = 2000;

/// Default pause after each bus write, in microseconds
pub const DEFAULT_WRITE_SETTLE_US: u64 = 5;

/// Get the default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
}

/// Cadence parameters for one capture channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Frames dropped at start while the sensor settles
    #[serde(default)]
    pub frames_to_skip: u64,

    /// Frames dropped between bursts (0 = admit every frame)
    #[serde(default)]
    pub frames_to_wait: u64,

    /// Frames admitted per burst
    #[serde(default = "default_burst_length")]
    pub burst_length: u64,

    /// Stop after this many admitted frames
    #[serde(default)]
    pub frame_limit: Option<u64>,
}

fn default_burst_length() -> u64 {
    1
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            frames_to_skip: 0,
            frames_to_wait: 0,
            burst_length: default_burst_length(),
            frame_limit: None,
        }
    }
}

impl CadenceConfig {
    /// Build the validated admission policy for this channel
    pub fn policy(&self) -> Result<AdmissionPolicy> {
        AdmissionPolicy::new(self.frames_to_skip, self.frames_to_wait, self.burst_length)
    }
}

/// Geometry and cadence of one capture channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default)]
    pub format: SurfaceFormat,

    /// Buffers allocated into this channel's capture pool
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    #[serde(default)]
    pub cadence: CadenceConfig,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    800
}

fn default_buffer_count() -> usize {
    MIN_CAPTURE_POOL_SIZE
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            format: SurfaceFormat::default(),
            buffer_count: default_buffer_count(),
            cadence: CadenceConfig::default(),
        }
    }
}

/// On-disk format of saved frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RawFileFormat {
    /// Plain pixel dump, `.raw`
    #[default]
    Raw,
    /// Structured raw with embedded metadata, `.nvraw`
    NvRaw,
}

impl RawFileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RawFileFormat::Raw => "raw",
            RawFileFormat::NvRaw => "nvraw",
        }
    }
}

/// Frame saving options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Prefix prepended to every output filename (may include directories)
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    #[serde(default)]
    pub format: RawFileFormat,

    /// Write a JSON metadata file next to each frame
    #[serde(default = "default_true")]
    pub sidecar: bool,
}

fn default_file_prefix() -> String {
    "out".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_prefix: default_file_prefix(),
            format: RawFileFormat::default(),
            sidecar: true,
        }
    }
}

/// Display output options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub display_id: u32,

    #[serde(default)]
    pub window_id: u32,

    /// Buffers in the composite pool
    #[serde(default = "default_composite_buffers")]
    pub composite_buffers: usize,

    /// Destination rectangle on screen; full surface when absent
    #[serde(default)]
    pub position: Option<Rect>,
}

fn default_composite_buffers() -> usize {
    COMPOSITE_QUEUE_SIZE
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            display_id: 0,
            window_id: 0,
            composite_buffers: default_composite_buffers(),
            position: None,
        }
    }
}

/// Queue and device timeouts in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub capture_enqueue_ms: u64,
    pub capture_feed_ms: u64,
    pub capture_get_frame_ms: u64,
    pub capture_max_retry: u32,
    pub save_dequeue_ms: u64,
    pub save_enqueue_ms: u64,
    pub composite_dequeue_ms: u64,
    pub composite_enqueue_ms: u64,
    pub display_dequeue_ms: u64,
    pub priming_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            capture_enqueue_ms: CAPTURE_ENQUEUE_TIMEOUT_MS,
            capture_feed_ms: CAPTURE_FEED_TIMEOUT_MS,
            capture_get_frame_ms: CAPTURE_GET_FRAME_TIMEOUT_MS,
            capture_max_retry: CAPTURE_MAX_RETRY,
            save_dequeue_ms: SAVE_DEQUEUE_TIMEOUT_MS,
            save_enqueue_ms: SAVE_ENQUEUE_TIMEOUT_MS,
            composite_dequeue_ms: COMPOSITE_DEQUEUE_TIMEOUT_MS,
            composite_enqueue_ms: COMPOSITE_ENQUEUE_TIMEOUT_MS,
            display_dequeue_ms: DISPLAY_DEQUEUE_TIMEOUT_MS,
            priming_ms: PRIMING_TIMEOUT_MS,
        }
    }
}

impl TimeoutConfig {
    pub fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    /// Every timeout set to `ms`; handy for tests
    pub fn uniform(ms: u64) -> Self {
        Self {
            capture_enqueue_ms: ms,
            capture_feed_ms: ms,
            capture_get_frame_ms: ms,
            capture_max_retry: CAPTURE_MAX_RETRY,
            save_dequeue_ms: ms,
            save_enqueue_ms: ms,
            composite_dequeue_ms: ms,
            composite_enqueue_ms: ms,
            display_dequeue_ms: ms,
            priming_ms: ms * 4,
        }
    }
}

/// Serial bus and register script options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus device opened when a script has no explicit DeviceSelect
    #[serde(default)]
    pub device: u32,

    /// Register script run at bring-up
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Write a register dump here before shutdown
    #[serde(default)]
    pub dump_on_exit: Option<PathBuf>,

    /// Read back and compare every register write
    #[serde(default)]
    pub verify_writes: bool,

    #[serde(default = "default_write_settle_us")]
    pub write_settle_us: u64,
}

fn default_write_settle_us() -> u64 {
    DEFAULT_WRITE_SETTLE_US
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: 0,
            script: None,
            dump_on_exit: None,
            verify_writes: false,
            write_settle_us: default_write_settle_us(),
        }
    }
}

/// Sensor selection and calibration inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Sensor name, matched by prefix (e.g. "ov10640", "ar0231-rccb")
    pub name: String,

    #[serde(default)]
    pub properties: SensorProperties,

    #[serde(default)]
    pub calibration: CalibrationParameters,
}

/// One entry of the runtime settings schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettingConfig {
    /// Frames this setting stays active for
    pub frames: u32,

    /// Register script applied when the setting becomes active
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Tag embedded in output filenames while active
    #[serde(default)]
    pub tag: String,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory for rolling log files; console only when absent
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub save: SaveConfig,

    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub sensor: Option<SensorConfig>,

    #[serde(default)]
    pub runtime_settings: Vec<RuntimeSettingConfig>,
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![ChannelConfig::default()]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            channels: default_channels(),
            save: SaveConfig::default(),
            display: DisplayConfig::default(),
            timeouts: TimeoutConfig::default(),
            bus: BusConfig::default(),
            sensor: None,
            runtime_settings: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|e| {
            PipelineError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Load from the default location, falling back to defaults
    pub fn load_or_default() -> Self {
        let Some(path) = default_config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load pipeline config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| PipelineError::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(PipelineError::Config(
                "at least one capture channel is required".into(),
            ));
        }

        for (index, channel) in self.channels.iter().enumerate() {
            if channel.width == 0 || channel.height == 0 {
                return Err(PipelineError::Config(format!(
                    "channel {index}: zero-sized geometry {}x{}",
                    channel.width, channel.height
                )));
            }
            if !(MIN_CAPTURE_POOL_SIZE..=MAX_CAPTURE_POOL_SIZE).contains(&channel.buffer_count) {
                return Err(PipelineError::Config(format!(
                    "channel {index}: buffer count {} outside {}..={}",
                    channel.buffer_count, MIN_CAPTURE_POOL_SIZE, MAX_CAPTURE_POOL_SIZE
                )));
            }
            channel
                .cadence
                .policy()
                .map_err(|e| e.with_context(format!("channel {index}")))?;
        }

        if self.display.enabled {
            let format = self.channels[0].format;
            if self.channels.iter().any(|c| c.format != format) {
                return Err(PipelineError::Config(
                    "display requires every channel to share one format".into(),
                ));
            }
            if format.is_raw() && self.channels.iter().any(|c| c.width < 2 || c.height < 2) {
                return Err(PipelineError::Config(
                    "raw channels need at least 2x2 pixels to convert for display".into(),
                ));
            }
            if self.display.composite_buffers == 0 {
                return Err(PipelineError::Config(
                    "composite pool needs at least one buffer".into(),
                ));
            }
        }

        if let Some(setting) = self.runtime_settings.iter().find(|s| s.frames == 0) {
            return Err(PipelineError::Config(format!(
                "runtime setting `{}` covers zero frames",
                setting.tag
            )));
        }

        Ok(())
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }
}
