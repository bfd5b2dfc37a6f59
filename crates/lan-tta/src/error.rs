//! Error types for the test-time adaptation pipeline.
//!
//! Every module that produces an error imports its error type from here
//! rather than defining it inline, keeping the hierarchy in one place.
//!
//! ## Hierarchy
//!
//! ```text
//! TtaError (top-level)
//! ├── ConfigError   (config validation / file loading / unknown choices)
//! ├── DatasetError  (image discovery, decoding, pairing)
//! └── TchError      (tensor backend failures, propagated as-is)
//! ```
//!
//! Checkpoint problems are deliberately absent from the loading path: the
//! model factory recovers from them with a warning. [`TtaError::Checkpoint`]
//! only covers explicit saves.

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TtaResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type TtaResult<T> = Result<T, TtaError>;

// ---------------------------------------------------------------------------
// TtaError: top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for the adaptation pipeline.
///
/// Orchestration-level functions (e.g. [`crate::adaptation::AdaptationLoop`]
/// and [`crate::experiment::Experiment`]) return `TtaResult<T>`. Lower-level
/// functions in [`crate::config`] and [`crate::dataset`] return their own
/// module-specific error types which coerce into `TtaError` via [`From`].
#[derive(Debug, Error)]
pub enum TtaError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A dataset loading or access error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// A failure inside the tensor backend (device, memory, shape checks).
    #[error("Tensor backend error: {0}")]
    Tensor(#[from] tch::TchError),

    /// Writing the result table failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Plain I/O error without further path context.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A shape mismatch was detected between two tensors.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<i64>,
        /// Actual shape.
        actual: Vec<i64>,
    },

    /// A checkpoint could not be written.
    #[error("Checkpoint error: {message} (path: {path:?})")]
    Checkpoint {
        /// Human-readable description.
        message: String,
        /// Path that was being accessed.
        path: PathBuf,
    },
}

impl TtaError {
    /// Construct a [`TtaError::Checkpoint`].
    pub fn checkpoint<S: Into<String>>(msg: S, path: impl Into<PathBuf>) -> Self {
        TtaError::Checkpoint { message: msg.into(), path: path.into() }
    }

    /// Construct a [`TtaError::ShapeMismatch`].
    pub fn shape_mismatch(expected: Vec<i64>, actual: Vec<i64>) -> Self {
        TtaError::ShapeMismatch { expected, actual }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating an [`AdaptConfig`].
///
/// All of these are fatal at startup: no sample is processed once one of
/// them has been raised.
///
/// [`AdaptConfig`]: crate::config::AdaptConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read from disk.
    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The requested self-supervised loss strategy does not exist.
    #[error("Unsupported self-supervised loss `{name}` (expected one of: nbr2nbr, zsn2n)")]
    UnknownLoss {
        /// The name that was requested.
        name: String,
    },

    /// The requested adaptation method does not exist.
    #[error("Unsupported adaptation method `{name}` (expected one of: finetune, lan)")]
    UnknownMethod {
        /// The name that was requested.
        name: String,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Errors produced while discovering or loading image pairs.
///
/// Discovery errors (missing directories) abort the run. Per-sample errors
/// (undecodable image, mismatched shapes) are reported by
/// [`crate::dataset::SampleIter`] and the sample is skipped.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The data directory does not exist.
    #[error("Directory not found: {path}")]
    DirectoryNotFound {
        /// The path that was not found.
        path: PathBuf,
    },

    /// A required image file was not found on disk.
    #[error("Data not found at `{path}`: {message}")]
    DataNotFound {
        /// Path that was expected to contain data.
        path: PathBuf,
        /// Additional context.
        message: String,
    },

    /// An image file could not be decoded.
    #[error("Cannot decode image `{path}`: {source}")]
    ImageDecode {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying decoder error.
        #[source]
        source: image::ImageError,
    },

    /// The low-quality and ground-truth images of a pair differ in shape.
    #[error("Shape mismatch for pair `{name}`: lq {lq:?} vs gt {gt:?}")]
    ShapeMismatch {
        /// Name of the pair (file stem).
        name: String,
        /// Low-quality image shape `[C, H, W]`.
        lq: Vec<usize>,
        /// Ground-truth image shape `[C, H, W]`.
        gt: Vec<usize>,
    },

    /// An image is too small for the pair sub-samplers.
    #[error("Image `{name}` is {height}x{width}; both sides must be at least {min_side}")]
    TooSmall {
        /// Name of the pair.
        name: String,
        /// Image height.
        height: usize,
        /// Image width.
        width: usize,
        /// Smallest accepted side length.
        min_side: usize,
    },

    /// A sample index is out of bounds.
    #[error("Index {idx} out of bounds (dataset has {len} samples)")]
    IndexOutOfBounds {
        /// The requested index.
        idx: usize,
        /// Total length of the dataset.
        len: usize,
    },

    /// An I/O error that carries no path context.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatasetError {
    /// Construct a [`DatasetError::DataNotFound`].
    pub fn not_found<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::DataNotFound { path: path.into(), message: msg.into() }
    }

    /// Construct a [`DatasetError::ImageDecode`].
    pub fn image_decode(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        DatasetError::ImageDecode { path: path.into(), source }
    }
}
