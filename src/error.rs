//! Error types for cgals

use std::path::PathBuf;

use thiserror::Error;

use crate::solver::Axis;

/// Result type alias using cgals' Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the solver and its device layer.
///
/// Every variant is fatal for the call that produced it: nothing is retried
/// and no partially processed batch is left behind.
#[derive(Error, Debug)]
pub enum Error {
    /// The options file could not be read
    #[error("failed to read options file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The options document is not valid JSON for `AlsOptions`
    #[error("malformed options: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// An option holds a value the solver cannot work with
    #[error("invalid option '{name}': {reason}")]
    InvalidOption { name: &'static str, reason: String },

    /// The device pool could not be started
    #[error("failed to start device workers: {0}")]
    DeviceStart(#[from] rayon::ThreadPoolBuildError),

    /// Device allocation failed
    #[error("out of device memory: failed to allocate {bytes} bytes")]
    OutOfMemory { bytes: usize },

    /// Host and device buffers disagree on size
    #[error(
        "transfer size mismatch for {what}: device holds {expected} elements, host holds {got}"
    )]
    TransferMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// An input array does not have the expected shape
    #[error("shape mismatch for {what}: expected {expected} elements, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// `partial_update` was called with an empty or out-of-range row window
    #[error("invalid row range [{start}, {next}) for {rows} rows")]
    InvalidRange {
        start: usize,
        next: usize,
        rows: usize,
    },

    /// The interaction batch is not a valid CSR block for the row window
    #[error("invalid interaction batch: {0}")]
    InvalidBatch(String),

    /// A lifecycle call was made before `initialize_model`
    #[error("model is not initialized")]
    ModelNotInitialized,

    /// The Gram matrix was not precomputed for the axis being solved
    #[error("gram matrix is not precomputed for the {0:?} axis")]
    GramNotReady(Axis),
}
