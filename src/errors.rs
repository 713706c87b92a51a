//! Centralized error handling for coreduce
//!
//! Every fallible operation in the crate returns [`Result`], whose error type is
//! [`CoReduceError`]. The first four variants form the run-level taxonomy; the rest
//! wrap backend and environment failures.

use crate::environment::DetectionError;
use thiserror::Error;

/// Main error type for coreduce operations
#[derive(Debug, Error)]
pub enum CoReduceError {
    /// The requested dataset is absent from the store
    #[error("dataset '{name}' not found in store {store}")]
    DatasetNotFound { name: String, store: String },

    /// The name resolves to something that is not an array
    #[error("'{name}' is not a dataset")]
    NotADataset { name: String },

    /// The dataset has the wrong number of dimensions
    #[error("dataset '{name}' has {actual} dimensions, expected {expected} (shape {shape:?})")]
    RankMismatch {
        name: String,
        expected: usize,
        actual: usize,
        shape: Vec<usize>,
    },

    /// An output dataset of a different shape already exists
    #[error("dataset '{name}' already exists with shape {existing:?}, expected {expected:?}")]
    OutputShapeConflict {
        name: String,
        existing: Vec<usize>,
        expected: Vec<usize>,
    },

    /// The cooperative execution context is misconfigured
    #[error("cooperative environment misconfigured: {0}")]
    Detection(#[from] DetectionError),

    /// The store does not exist and the open mode does not create it
    #[error("store {0} does not exist")]
    StoreNotFound(String),

    /// The store backend cannot be opened by several workers at once
    #[error("{backend} stores cannot be opened collectively")]
    CollectiveUnsupported { backend: &'static str },

    /// Workers reached a collective call with different arguments
    #[error("collective call '{label}' diverged between workers: {details}")]
    CollectiveMismatch { label: String, details: String },

    /// A collective round already holds this worker's entry: another live run
    /// shares the session name
    #[error("collective session at {path} is used by another run; pick another session name")]
    StaleSession { path: String },

    /// Another worker reported a failure in an agreement round
    #[error("worker {rank} failed during '{label}': {kind}")]
    PeerFailed {
        rank: usize,
        label: String,
        kind: String,
    },

    /// The store was opened read-only
    #[error("store {0} was opened read-only")]
    ReadOnlyStore(String),

    /// Element type other than a float
    #[error("dataset '{name}' has unsupported data type '{dtype}'")]
    UnsupportedDataType { name: String, dtype: String },

    /// Dataset name that cannot be mapped onto the store layout
    #[error("invalid dataset name '{0}'")]
    InvalidDatasetName(String),

    /// Store metadata that cannot be interpreted
    #[error("corrupt metadata at {path}: {message}")]
    CorruptMetadata { path: String, message: String },

    /// Chunk compressor or filter this crate cannot decode
    #[error("array at {path} uses unsupported codec '{codec}'")]
    UnsupportedCodec { path: String, codec: String },

    /// Zlib stream that failed to inflate
    #[error("failed to decompress chunk")]
    Decompression(#[from] zune_inflate::errors::InflateDecodeErrors),

    /// I/O operation errors
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialisation errors
    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    /// NetCDF file operation errors
    #[error("NetCDF error")]
    NetCDF(#[from] netcdf::Error),

    /// Array shape or dimension error
    #[error("array error")]
    Shape(#[from] ndarray::ShapeError),
}

impl CoReduceError {
    /// Stable tag for the error variant.
    ///
    /// Agreement rounds exchange this tag so that every worker can compare
    /// outcomes without depending on message text.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DatasetNotFound { .. } => "DatasetNotFound",
            Self::NotADataset { .. } => "NotADataset",
            Self::RankMismatch { .. } => "RankMismatch",
            Self::OutputShapeConflict { .. } => "OutputShapeConflict",
            Self::Detection(_) => "Detection",
            Self::StoreNotFound(_) => "StoreNotFound",
            Self::CollectiveUnsupported { .. } => "CollectiveUnsupported",
            Self::CollectiveMismatch { .. } => "CollectiveMismatch",
            Self::StaleSession { .. } => "StaleSession",
            Self::PeerFailed { .. } => "PeerFailed",
            Self::ReadOnlyStore(_) => "ReadOnlyStore",
            Self::UnsupportedDataType { .. } => "UnsupportedDataType",
            Self::InvalidDatasetName(_) => "InvalidDatasetName",
            Self::CorruptMetadata { .. } => "CorruptMetadata",
            Self::UnsupportedCodec { .. } => "UnsupportedCodec",
            Self::Decompression(_) => "Decompression",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
            Self::NetCDF(_) => "NetCDF",
            Self::Shape(_) => "Shape",
        }
    }
}

/// Result type alias for coreduce operations
pub type Result<T> = std::result::Result<T, CoReduceError>;
