//! Error types for Foundation
//!
//! Two families matter to callers: "missing" errors (upstream rows not yet
//! populated) are retried on a later populate pass, everything else aborts
//! the row being made.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Foundation error types
#[derive(Error, Debug)]
pub enum Error {
    /// Required upstream rows have not been populated yet
    #[error("Missing upstream: {0}\nPopulate the upstream table first; the key is left for a later pass")]
    MissingUpstream(String),

    /// A requested subset is not part of its parent
    #[error("Restriction error: {0}")]
    Restriction(String),

    /// Violated precondition on arrays, specs or parameter bounds
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Array lengths diverge beyond the allowed tolerance
    #[error("Length mismatch: lengths {lengths:?} differ by more than {tolerance}")]
    LengthMismatch {
        /// Observed lengths
        lengths: Vec<usize>,
        /// Allowed difference
        tolerance: usize,
    },

    /// Training plan needs more devices than the host offers
    #[error("Insufficient devices: plan requires {required}, found {available}")]
    InsufficientDevices {
        /// Devices required by the plan
        required: usize,
        /// Devices available on this host
        available: usize,
    },

    /// Ranks of one model disagree on their checkpoint state
    #[error("Inconsistent checkpoints: {0}\nThe model must be reconciled manually")]
    InconsistentCheckpoints(String),

    /// A link variant has no compute binding in this build
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// A row with the same key but different attributes already exists
    #[error("Duplicate key in `{table}`: {key}")]
    DuplicateKey {
        /// Table name
        table: String,
        /// Rendered key
        key: String,
    },

    /// Another worker holds the job reservation for this key
    #[error("Job reserved: `{table}` {key} is held by another worker")]
    Reserved {
        /// Table name
        table: String,
        /// Rendered key
        key: String,
    },

    /// Trial is not valid for the requested trace
    #[error("Invalid trial: {0}")]
    InvalidTrial(String),

    /// A dataset column is missing samples for a trial
    #[error("Missing trial: {0}")]
    MissingTrial(String),

    /// Blob store or catalog persistence error
    #[error("Storage error: {0}")]
    StorageError(String),

    /// A collective operation failed or the process group was aborted
    #[error("Process group error: {0}")]
    Collective(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary payload (de)serialization error
    #[error("Encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    /// CSV writer error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// ZIP archive error
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors meaning "upstream not ready"; populate leaves such keys for later.
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::MissingUpstream(_))
    }

    /// True when another worker already holds the key.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }
}
