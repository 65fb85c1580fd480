//! Error handling for the capture pipeline
//!
//! This module defines the error taxonomy shared by every stage, the bus
//! interpreter and the configuration layer, plus a Result alias.
//!
//! Recoverable conditions (timeouts, backpressure, empty queues) are absorbed
//! inside worker loops; everything else is fatal for the run and trips the
//! shared cancel token.

use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A bounded wait elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Queue stayed full for the whole timeout
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Queue stayed empty for the whole timeout
    #[error("Queue empty: {0}")]
    QueueEmpty(String),

    /// The shared cancel token fired while waiting
    #[error("Operation cancelled")]
    Cancelled,

    /// Serial bus transaction failed
    #[error("Bus error during {op}: {message}")]
    Bus { op: String, message: String },

    /// Invalid configuration, detected at setup
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fixed-size pool could not supply a buffer
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An external collaborator (capture, blit, display, converter) failed
    #[error("{device} failure: {message}")]
    Device { device: String, message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Register script parse errors
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipelineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a bus failure
    pub fn bus(op: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Bus {
            op: op.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a collaborator failure
    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Device {
            device: device.into(),
            message: message.into(),
        }
    }

    /// The innermost error, with all context layers peeled off
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Expected steady-state conditions that a worker loop retries
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            PipelineError::Timeout(_)
                | PipelineError::QueueFull(_)
                | PipelineError::QueueEmpty(_)
                | PipelineError::Cancelled
        )
    }

    /// Whether the error only reports that shutdown was requested
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), PipelineError::Cancelled)
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| PipelineError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PipelineError::from(e).with_context(f()))
    }
}
