//! Typed errors for configuration mistakes.
//!
//! Only synchronous configuration errors get their own types; runtime
//! failures flow through `anyhow` and the propagation policy documented
//! on each subsystem.

use std::time::Duration;
use thiserror::Error;

/// Minimum allowed identity rotation interval.
pub const MIN_ROTATION_INTERVAL: Duration = Duration::from_secs(60);

/// Errors raised by identity pool configuration.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Requested a pool slot that does not exist.
    #[error("identity index {index} out of range (pool size {pool_size})")]
    InvalidIndex { index: usize, pool_size: usize },

    /// Rotation interval below the supported minimum.
    #[error("rotation interval {0:?} below minimum of 60s")]
    InvalidInterval(Duration),
}
