//! Sign-in attempt limiting.
//!
//! After [`MAX_LOGIN_ATTEMPTS`] consecutive failures the limiter refuses
//! further attempts for [`LOCKOUT_SECONDS`]. A successful sign-in resets the
//! count; so does the first check after a lockout has expired.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use log::warn;

use super::error::{AuthError, Result};
use crate::clock::Clock;

/// Consecutive failures that trigger a lockout.
pub const MAX_LOGIN_ATTEMPTS: u32 = 5;

/// How long a lockout lasts, in seconds.
pub const LOCKOUT_SECONDS: i64 = 60;

#[derive(Debug, Default, Clone, Copy)]
struct Attempts {
    failures: u32,
    locked_until: Option<DateTime<Utc>>,
}

/// Per-client failed sign-in counter.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    state: Mutex<Attempts>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates a limiter measuring time with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(Attempts::default()),
        }
    }

    /// Fails if sign-in is currently locked.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::LockedOut`] with the remaining seconds, rounded
    /// up, while a lockout is active.
    pub fn check(&self) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        match state.locked_until {
            Some(until) if until > now => {
                let millis = (until - now).num_milliseconds();
                let secs = u64::try_from((millis + 999) / 1000).unwrap_or(0);
                Err(AuthError::LockedOut {
                    retry_after_secs: secs,
                })
            }
            Some(_) => {
                *state = Attempts::default();
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Records a failed attempt, locking once the limit is reached.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Internal`] if the state lock is poisoned.
    pub fn record_failure(&self) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.failures += 1;
        if state.failures >= MAX_LOGIN_ATTEMPTS {
            state.locked_until = Some(now + Duration::seconds(LOCKOUT_SECONDS));
            warn!(
                "Sign-in locked for {LOCKOUT_SECONDS}s after {} failed attempts",
                state.failures
            );
        }
        Ok(())
    }

    /// Clears the failure count and any lockout.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Internal`] if the state lock is poisoned.
    pub fn reset(&self) -> Result<()> {
        *self.lock()? = Attempts::default();
        Ok(())
    }

    /// Returns the number of consecutive failures recorded.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.state.lock().map(|s| s.failures).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Attempts>> {
        self.state
            .lock()
            .map_err(|e| AuthError::Internal(format!("Failed to acquire limiter lock: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch_2024());
        (RateLimiter::new(clock.clone()), clock)
    }

    #[test]
    fn four_failures_do_not_lock() {
        let (limiter, _) = limiter();
        for _ in 0..4 {
            limiter.check().unwrap();
            limiter.record_failure().unwrap();
        }
        assert!(limiter.check().is_ok());
    }

    #[test]
    fn fifth_failure_locks_for_sixty_seconds() {
        let (limiter, clock) = limiter();
        for _ in 0..5 {
            limiter.record_failure().unwrap();
        }
        assert!(matches!(
            limiter.check(),
            Err(AuthError::LockedOut {
                retry_after_secs: 60
            })
        ));

        clock.advance(Duration::milliseconds(59_500));
        assert!(matches!(
            limiter.check(),
            Err(AuthError::LockedOut {
                retry_after_secs: 1
            })
        ));

        clock.advance(Duration::milliseconds(500));
        assert!(limiter.check().is_ok());
        assert_eq!(limiter.failures(), 0);
    }

    #[test]
    fn reset_clears_failures() {
        let (limiter, _) = limiter();
        for _ in 0..3 {
            limiter.record_failure().unwrap();
        }
        limiter.reset().unwrap();
        assert_eq!(limiter.failures(), 0);
        for _ in 0..4 {
            limiter.record_failure().unwrap();
        }
        assert!(limiter.check().is_ok());
    }
}
