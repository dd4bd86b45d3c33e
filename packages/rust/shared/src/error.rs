//! Error types for the egressos pipeline.
//!
//! Library crates use [`EgressosError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum EgressosError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transient network/HTTP failure. Retried inside the fetcher.
    #[error("network error: {0}")]
    Network(String),

    /// The requested remote resource does not exist (HTTP 404, unknown month).
    #[error("not found: {0}")]
    NotFound(String),

    /// Too many malformed registry rows for the run to be trusted.
    #[error(
        "data quality error: {malformed} of {total} rows malformed (threshold {pct:.2}%)",
        pct = .threshold * 100.0
    )]
    DataQuality {
        malformed: usize,
        total: usize,
        threshold: f64,
    },

    /// Input roster columns do not match what the pipeline understands.
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Textual parsing error (listing HTML, dates, archive contents).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Columnar storage (Arrow/Parquet) error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invalid argument, inconsistent manifest, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A pipeline stage failed; wraps the underlying cause with progress info.
    #[error("{stage} stage failed after {processed} records: {source}")]
    Stage {
        stage: String,
        processed: usize,
        #[source]
        source: Box<EgressosError>,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, EgressosError>;

impl EgressosError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a schema error from any displayable message.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach the failing stage and the number of records processed so far.
    pub fn at_stage(self, stage: impl Into<String>, processed: usize) -> Self {
        Self::Stage {
            stage: stage.into(),
            processed,
            source: Box::new(self),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}
