//! Error types for model construction, configuration and weight I/O.
//!
//! ```text
//! ModelError (top-level)
//! ├── ConfigError  (config validation / file loading)
//! └── TchError     (libtorch failures during save/load)
//! ```
//!
//! Forward passes do not return errors: tensor shape violations surface as
//! libtorch panics, the same as any other `tch` module.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ScanVariant;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Single-token stepping only exists for the forward-direction recurrence.
    #[error("Mixer with scan variant {scan:?} cannot be stepped one token at a time")]
    StreamingUnsupported { scan: ScanVariant },
}

/// Errors produced when loading or validating a model configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Bidirectional scanning consumes blocks in forward/backward pairs.
    #[error("Bidirectional scanning needs an even block count, got depth {depth}")]
    OddBidirectionalDepth { depth: usize },

    #[error("Unknown pooling policy `{0}` (expected none, mean, max or all)")]
    UnknownPoolType(String),

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: i64,
        actual: i64,
    },

    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }

    pub fn dimension_mismatch(what: &'static str, expected: i64, actual: i64) -> Self {
        ConfigError::DimensionMismatch {
            what,
            expected,
            actual,
        }
    }
}
