//! Sign-in, sign-up and sign-in rate limiting.
//!
//! The app talks to an [`IdentityProvider`]. [`LocalIdentityProvider`]
//! keeps accounts on the device and stores profiles in the active circle
//! store; hosted providers implement the same trait. Every provider shares
//! the same [`RateLimiter`] rule: five consecutive failures lock sign-in
//! for sixty seconds.

mod error;
mod password;
mod provider;
mod rate_limit;

pub use error::{AuthError, Result};
pub use password::{hash_password, verify_password};
pub use provider::{Identity, IdentityProvider, LocalIdentityProvider, SignUpRequest, LOCAL_USER_PREFIX};
pub use rate_limit::{RateLimiter, LOCKOUT_SECONDS, MAX_LOGIN_ATTEMPTS};
