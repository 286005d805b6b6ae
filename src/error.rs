use std::io;
use thiserror::Error;

/// Error type for pool construction and configuration.
#[derive(Error, Debug)]
pub enum PoolError {
    /// A configuration value is invalid on its own (e.g., a zero bound).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A configuration value falls outside its permitted range
    /// (e.g., `min_threads` exceeding `max_threads`).
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The operating system refused to create a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
