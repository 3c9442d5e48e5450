//! Error types for circle operations.
//!
//! Every store implementation reports failures through [`CircleError`], so
//! callers see the same taxonomy regardless of the active backend. A missing
//! circle on lookup is not an error: lookups return `Ok(None)`.

use thiserror::Error;

/// Error type for circle operations.
#[derive(Error, Debug)]
pub enum CircleError {
    /// Input has the wrong shape (phone format, invite code, name length).
    #[error("Invalid input: {0}")]
    Validation(String),

    /// A non-owner attempted an owner-only action.
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// The owner attempted to remove their own member row.
    #[error("The circle owner cannot be removed")]
    SelfRemoval,

    /// The circle already holds the maximum number of members.
    #[error("Circle is full (max {max} members)")]
    CapacityReached {
        /// The membership cap that was hit.
        max: usize,
    },

    /// A member with the same normalised phone number already exists.
    #[error("A member with phone {0} is already in the circle")]
    DuplicatePhone(String),

    /// Network or backend failure; the caller decides whether to retry.
    #[error("Backend unavailable: {0}")]
    Transient(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error from `SQLite`.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Persisted data could not be decoded.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Configuration does not describe a usable store.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CircleError {
    /// Returns whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result type alias for circle operations.
pub type Result<T> = std::result::Result<T, CircleError>;
