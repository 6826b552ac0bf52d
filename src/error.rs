//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DaqError`, shared by the schema engine,
//! the channel state machine, the technique runner and the job server. Using the
//! `thiserror` crate, it provides one consistent vocabulary for everything that can go
//! wrong between a client job and the instrument.
//!
//! ## Error Hierarchy
//!
//! - **`Precondition`**: the channel cannot accept the request right now (not plugged,
//!   busy, unsupported technique, kernel not loaded, invalid channel number).
//! - **`Validation`**: every parameter problem of every technique in a job, aggregated
//!   into one error so a client sees the full list at once.
//! - **`HardwareLimit`**: a technique asks for a current range or bandwidth the channel
//!   cannot provide.
//! - **`RuntimeFrame`**: a raw data frame could not be decoded.
//! - **`ChannelCancelled`**: another actor stopped the channel while a consumer was
//!   pulling data. This is an expected outcome, see [`DaqError::is_cancellation`].
//! - **`Transport`** / **`Protocol`**: wire failures between client and server.
//! - **`Connection`** / **`Instrument`**: failures reported by the instrument driver.
//! - **`Remote`**: an `error` message received by a job client.
//!
//! By using `#[from]`, `DaqError` can be created from I/O, JSON and configuration
//! errors with the `?` operator.

use crate::schema::ValidationError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// A validation error tagged with the position of its technique in a job.
#[derive(Debug, Clone, PartialEq)]
pub struct TechniqueValidationError {
    /// Index of the technique in the submitted sequence.
    pub tech_index: usize,
    /// The parameter error itself.
    pub error: ValidationError,
}

impl fmt::Display for TechniqueValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "technique {}: {}", self.tech_index, self.error)
    }
}

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid technique parameters: {}", join_validation(.0))]
    Validation(Vec<TechniqueValidationError>),

    #[error("Hardware limit exceeded: {0}")]
    HardwareLimit(String),

    #[error("Invalid data frame: {0}")]
    RuntimeFrame(String),

    #[error("Channel {0} was stopped while data was being read")]
    ChannelCancelled(u8),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Cannot convert '{field}': {message}")]
    Conversion { field: String, message: String },

    #[error("Parameter '{0}' is read-only")]
    ReadOnlyParameter(String),

    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("Unknown technique '{0}'")]
    UnknownTechnique(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server reported an error: {message}")]
    Remote { message: String, traceback: String },
}

fn join_validation(errors: &[TechniqueValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DaqError {
    /// Builds a conversion error for `field`.
    pub fn conversion(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conversion {
            field: field.into(),
            message: message.into(),
        }
    }

    /// True when the error only signals that another actor stopped the channel.
    ///
    /// Consumers treat this as a clean end of the data stream.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::ChannelCancelled(_))
    }

    /// Short category name, used as the first line of [`DaqError::traceback`].
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "PreconditionFailure",
            Self::Validation(_) => "ValidationFailure",
            Self::HardwareLimit(_) => "HardwareLimitFailure",
            Self::RuntimeFrame(_) => "RuntimeFrameError",
            Self::ChannelCancelled(_) => "ChannelCancelled",
            Self::Transport(_) => "TransportFailure",
            Self::Protocol(_) => "ProtocolError",
            Self::Connection(_) => "ConnectionFailure",
            Self::Instrument(_) => "InstrumentError",
            Self::Conversion { .. } => "ConversionError",
            Self::ReadOnlyParameter(_) => "ReadOnlyParameter",
            Self::UnknownParameter(_) => "UnknownParameter",
            Self::UnknownTechnique(_) => "UnknownTechnique",
            Self::Config(_) => "ConfigError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
            Self::Remote { .. } => "RemoteError",
        }
    }

    /// Detailed multi-line report: category, message, every validation entry and
    /// the chain of underlying causes.
    pub fn traceback(&self) -> String {
        let mut report = format!("{}: {}", self.kind(), self);
        if let Self::Validation(errors) = self {
            for error in errors {
                report.push_str(&format!("\n  - {error}"));
            }
        }
        if let Self::Remote { traceback, .. } = self {
            report.push_str(&format!("\n\nRemote traceback:\n{traceback}"));
        }
        let mut source = std::error::Error::source(self);
        let mut depth = 0;
        while let Some(cause) = source {
            if depth == 0 {
                report.push_str("\n\nCaused by:");
            }
            report.push_str(&format!("\n    {depth}: {cause}"));
            depth += 1;
            source = cause.source();
        }
        report
    }
}

// Errors captured by a runner are handed out again later, so they must be cloneable.
impl Clone for DaqError {
    fn clone(&self) -> Self {
        match self {
            Self::Precondition(m) => Self::Precondition(m.clone()),
            Self::Validation(v) => Self::Validation(v.clone()),
            Self::HardwareLimit(m) => Self::HardwareLimit(m.clone()),
            Self::RuntimeFrame(m) => Self::RuntimeFrame(m.clone()),
            Self::ChannelCancelled(c) => Self::ChannelCancelled(*c),
            Self::Transport(m) => Self::Transport(m.clone()),
            Self::Protocol(m) => Self::Protocol(m.clone()),
            Self::Connection(m) => Self::Connection(m.clone()),
            Self::Instrument(m) => Self::Instrument(m.clone()),
            Self::Conversion { field, message } => Self::Conversion {
                field: field.clone(),
                message: message.clone(),
            },
            Self::ReadOnlyParameter(m) => Self::ReadOnlyParameter(m.clone()),
            Self::UnknownParameter(m) => Self::UnknownParameter(m.clone()),
            Self::UnknownTechnique(m) => Self::UnknownTechnique(m.clone()),
            Self::Config(e) => Self::Config(e.clone()),
            Self::Configuration(m) => Self::Configuration(m.clone()),
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Json(e) => Self::Json(<serde_json::Error as serde::de::Error>::custom(e)),
            Self::Remote { message, traceback } => Self::Remote {
                message: message.clone(),
                traceback: traceback.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_technique_and_parameter() {
        let err = DaqError::Validation(vec![TechniqueValidationError {
            tech_index: 1,
            error: ValidationError::new("record_every_dT", "value not in range: >= 0"),
        }]);
        let text = err.to_string();
        assert!(text.contains("technique 1"));
        assert!(text.contains("record_every_dT"));
        assert!(err.traceback().starts_with("ValidationFailure"));
    }

    #[test]
    fn cancellation_is_distinct() {
        assert!(DaqError::ChannelCancelled(2).is_cancellation());
        assert!(!DaqError::Instrument("boom".into()).is_cancellation());
    }

    #[test]
    fn clone_preserves_io_kind() {
        let err = DaqError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        match err.clone() {
            DaqError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected clone {other:?}"),
        }
    }
}
