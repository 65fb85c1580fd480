//! Multi-channel capture pipeline.
//!
//! Every stage runs on its own thread and talks to its neighbours only
//! through bounded [`ExchangeQueue`](crate::buffer::ExchangeQueue)s:
//!
//! ```text
//! [capture-0] ──► [save-0] ──┐
//! [capture-1] ──► [save-1] ──┼──► [composite] ──► [display]
//! [capture-n] ──► [save-n] ──┘
//! ```
//!
//! # Components
//!
//! - [`CancelToken`] - run-wide cancellation that wakes blocked queue calls
//! - [`admission`] - skip/wait/burst frame cadence
//! - [`stage`] - the worker trait and thread lifecycle shared by all stages
//! - [`CaptureStage`], [`SaveStage`], [`CompositeStage`], [`DisplayStage`]
//! - [`PipelineBuilder`] / [`Pipeline`] - wiring, run control and teardown
//! - [`naming`] - output filenames
//!
//! # Shutdown
//!
//! A fatal error in any stage cancels the shared token; a save stage that
//! reaches its frame limit does the same. Every blocked queue call returns
//! promptly, each stage drains what it holds back to the home pools, and
//! [`Pipeline::shutdown`] checks that no buffer went missing.

pub mod admission;
pub mod builder;
pub mod cancel;
pub mod capture;
pub mod composite;
pub mod display;
pub mod naming;
pub mod save;
pub mod stage;

pub use admission::{admit, AdmissionPolicy};
pub use builder::{DeviceSet, Pipeline, PipelineBuilder, RunSummary, StageRole, StageSummary};
pub use cancel::CancelToken;
pub use capture::CaptureStage;
pub use composite::{composite_layout, CompositeStage};
pub use display::DisplayStage;
pub use save::{Conversion, SaveStage};
pub use stage::{spawn_stage, Flow, StageContext, StageHandle, StageStatus, StageWorker};
