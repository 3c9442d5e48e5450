//! Error types for sign-in and sign-up.

use thiserror::Error;

use crate::circle::CircleError;

/// Error type for identity operations.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Input has the wrong shape (e-mail, password, phone, name).
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Unknown e-mail or wrong password. The two are not distinguished.
    #[error("Incorrect e-mail or password")]
    InvalidCredentials,

    /// Too many failed attempts; sign-in is blocked for a while.
    #[error("Too many attempts. Try again in {retry_after_secs} seconds")]
    LockedOut {
        /// Whole seconds until the lockout ends, rounded up.
        retry_after_secs: u64,
    },

    /// An account with this e-mail already exists.
    #[error("This e-mail is already registered")]
    EmailTaken,

    /// Profile storage failed.
    #[error("Profile storage failed: {0}")]
    Store(#[from] CircleError),

    /// Internal failure (lock poisoning, hashing).
    #[error("Identity provider error: {0}")]
    Internal(String),
}

/// Result type alias for identity operations.
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockout_display_names_seconds() {
        let err = AuthError::LockedOut {
            retry_after_secs: 42,
        };
        assert_eq!(err.to_string(), "Too many attempts. Try again in 42 seconds");
    }

    #[test]
    fn store_error_converts() {
        let err: AuthError = CircleError::Transient("offline".to_string()).into();
        assert!(matches!(err, AuthError::Store(CircleError::Transient(_))));
    }
}
