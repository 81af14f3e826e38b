//! Error types shared across the segstore engine crates.
//!
//! The cleaner's error policy is deliberately narrow: transient transaction
//! conflicts are retried by the caller, device faults propagate, and
//! mount-time decode problems surface as [`StoreError::Corrupt`]. Invariant
//! violations (double-allocate, accounting drift, tail regression) are not
//! representable here: they are fatal and abort via assertion, because no
//! safe continuation exists once the space accounting is wrong.

use thiserror::Error;

/// Primary error type for segstore operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Device-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The addressed entity does not exist on the device.
    ///
    /// Surfaced by header reads during mount for segments that were never
    /// written; the mount loop skips these.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The entity exists but holds no decodable payload.
    ///
    /// Surfaced by tail reads for segments closed before their tail was
    /// written; the mount loop falls back to scanning record headers.
    #[error("no data: {what}")]
    NoData { what: String },

    /// An on-disk structure failed validation.
    #[error("corrupt on-disk state: {detail}")]
    Corrupt { detail: String },

    /// A cleaner transaction raced with a foreground mutator.
    ///
    /// Always retryable: the cycle re-runs with the same cursor.
    #[error("transient transaction conflict")]
    TransientConflict,
}

impl StoreError {
    /// Whether this error is resolved by retrying the whole operation.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::TransientConflict)
    }
}

/// Result alias used across the segstore crates.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

// ===========================================================================
// Tests
// ===========================================================================
