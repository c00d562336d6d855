//! Error types for aperture.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias using aperture's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for aperture operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Buffer pool is exhausted (no free slot available).
    ///
    /// This is an expected condition used for backpressure, not a fault;
    /// stages translate it into a drop-and-continue.
    #[error("buffer pool exhausted: no free slot available")]
    PoolExhausted,

    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Startup configuration was rejected.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// An input window did not have the expected length.
    #[error("short input window: expected {expected} elements, got {got}")]
    ShortWindow {
        /// Expected element count for one gulp.
        expected: usize,
        /// Element count actually received.
        got: usize,
    },

    /// A device or one of its execution streams failed.
    ///
    /// Fatal to the affected device; independent devices continue.
    #[error("device {device} fault: {reason}")]
    DeviceFault {
        /// Device id the fault occurred on.
        device: u32,
        /// Human-readable fault description.
        reason: String,
    },

    /// A pipeline channel closed while a stage still needed it.
    #[error("pipeline channel closed: {0}")]
    ChannelClosed(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
