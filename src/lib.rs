//! # multicap-rs: Multi-Channel Capture Pipeline
//!
//! Captures frames from several camera channels concurrently, saves them,
//! composites them side by side for display, and configures the sensors by
//! replaying register scripts over a serial bus.
//!
//! ## Architecture
//!
//! - **Buffers**: fixed pools of frame buffers that circulate through bounded
//!   queues; every buffer always returns to the pool it came from
//! - **Pipeline**: one thread per stage (capture and save per channel, one
//!   composite, one display) with run-wide cooperative cancellation
//! - **Bus**: a register-script interpreter, owned by a single worker thread
//!   after bring-up
//! - **Devices**: traits for the capture, blit, display, conversion and file
//!   collaborators, with in-process simulations
//!
//! ## Configuration
//!
//! The pipeline is configured from `pipeline.toml` in the platform config
//! directory under `multicap`:
//!
//! - **Linux**: `~/.config/multicap/pipeline.toml`
//! - **macOS**: `~/Library/Application Support/multicap/pipeline.toml`
//! - **Windows**: `%APPDATA%\multicap\pipeline.toml`
//!
//! ## Example
//!
//! ```ignore
//! use multicap_rs::config::PipelineConfig;
//! use multicap_rs::pipeline::{DeviceSet, PipelineBuilder};
//!
//! let config = PipelineConfig::load_or_default();
//! let devices = DeviceSet::simulated(&config);
//! let mut pipeline = PipelineBuilder::new(config).build(devices)?;
//! pipeline.start()?;
//! pipeline.wait();
//! let summary = pipeline.shutdown();
//! assert!(summary.conservation.is_balanced());
//! ```

pub mod buffer;
pub mod bus;
pub mod config;
pub mod devices;
pub mod error;
pub mod pipeline;
pub mod sensor;
pub mod types;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineBuilder};
