//! Error types shared across Mirrorspace crates.

use thiserror::Error;

/// Top-level error type for engine operations.
///
/// Component crates define their own precise error enums and convert
/// into this aggregate at the engine boundary.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Request rejected synchronously (bad radius, wrong-region caller,
    /// transition attempted before the build is complete). Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The asynchronous enumeration of a source volume failed and the
    /// whole session was aborted.
    #[error("scan aborted: {0}")]
    ScanAborted(String),

    /// Durable state could not be saved or loaded.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// World content could not be read or written.
    #[error("world error: {0}")]
    World(String),

    /// Persisted location state disagrees with the live world; resolved
    /// in favor of the persisted flag, but the caller is told.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),
}

/// Result type alias for engine operations.
pub type MirrorResult<T> = Result<T, MirrorError>;
