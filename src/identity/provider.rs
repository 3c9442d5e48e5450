//! Identity provider contract and the device-local implementation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::error::{AuthError, Result};
use super::password::{hash_password, verify_password};
use super::rate_limit::RateLimiter;
use crate::circle::{CircleStore, LocalAccount, ProfileUpdate, UserProfile};
use crate::clock::Clock;
use crate::validation::{
    normalize_phone, sanitize_text, validate_address, validate_city, validate_display_name,
    validate_email, validate_location, validate_password, validate_phone, Validation,
};

/// Prefix of user ids issued by [`LocalIdentityProvider`].
pub const LOCAL_USER_PREFIX: &str = "demo_";

/// A signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable user id.
    pub user_id: String,
    /// E-mail as entered at sign-in.
    pub email: String,
    /// Profile loaded at sign-in.
    pub profile: UserProfile,
}

/// Input of a sign-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignUpRequest {
    /// E-mail address.
    pub email: String,
    /// Password.
    pub password: String,
    /// Display name; defaults to the local part of the e-mail when blank.
    pub display_name: String,
    /// Optional phone number.
    pub phone: Option<String>,
    /// Optional city.
    pub city: Option<String>,
    /// Optional location.
    pub location: Option<String>,
    /// Optional address.
    pub address: Option<String>,
}

impl SignUpRequest {
    /// Creates a request with the required fields.
    #[must_use]
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Sets the phone number.
    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Sets the city.
    #[must_use]
    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    /// Sets the location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Sets the address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// Credential flows consumed by the app.
///
/// Implementations must refuse sign-in for 60 seconds after 5 consecutive
/// failures and reset the count on success.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Signs in with e-mail and password.
    ///
    /// # Errors
    ///
    /// - [`AuthError::LockedOut`] while locked
    /// - [`AuthError::Validation`] for a malformed e-mail (not counted)
    /// - [`AuthError::InvalidCredentials`] for an unknown e-mail or wrong
    ///   password (counted)
    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity>;

    /// Registers a new account and signs it in.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Validation`] for malformed input
    /// - [`AuthError::EmailTaken`] if the e-mail is registered
    async fn sign_up(&self, request: SignUpRequest) -> Result<Identity>;

    /// Signs out the current user.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be cleared.
    async fn sign_out(&self) -> Result<()>;

    /// Returns the signed-in user, if any.
    fn current(&self) -> Option<Identity>;
}

/// E-mail and password accounts kept in the circle store alongside profiles.
///
/// Accounts live as long as the store does, so a provider built over a
/// reopened database signs in the users registered before.
pub struct LocalIdentityProvider {
    store: Arc<dyn CircleStore>,
    limiter: RateLimiter,
    current: Mutex<Option<Identity>>,
}

impl std::fmt::Debug for LocalIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentityProvider")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl LocalIdentityProvider {
    /// Creates a provider writing profiles to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CircleStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            limiter: RateLimiter::new(clock),
            current: Mutex::new(None),
        }
    }

    /// Returns the sign-in rate limiter.
    #[must_use]
    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn set_current(&self, identity: Option<Identity>) -> Result<()> {
        *self
            .current
            .lock()
            .map_err(|e| AuthError::Internal(format!("Failed to acquire session lock: {e}")))? =
            identity;
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity> {
        self.limiter.check()?;
        check(validate_email(email))?;

        let verified = self
            .store
            .account(&email_key(email))
            .await?
            .filter(|account| verify_password(password, &account.password_hash));
        let Some(account) = verified else {
            self.limiter.record_failure()?;
            return Err(AuthError::InvalidCredentials);
        };
        self.limiter.reset()?;

        let profile = self
            .store
            .profile(&account.user_id)
            .await?
            .unwrap_or_else(|| UserProfile {
                display_name: account.display_name.clone(),
                ..UserProfile::default()
            });
        let identity = Identity {
            user_id: account.user_id,
            email: email.trim().to_string(),
            profile,
        };
        self.set_current(Some(identity.clone()))?;
        debug!("Signed in {}", identity.user_id);
        Ok(identity)
    }

    async fn sign_up(&self, request: SignUpRequest) -> Result<Identity> {
        check(validate_email(&request.email))?;
        check(validate_password(&request.password))?;

        let email = email_key(&request.email);
        let display_name = match sanitize_text(&request.display_name) {
            name if name.is_empty() => email.split('@').next().unwrap_or_default().to_string(),
            name => name,
        };
        check(validate_display_name(&display_name))?;

        let phone = request.phone.as_deref().unwrap_or_default();
        if !phone.is_empty() {
            check(validate_phone(phone))?;
        }
        let profile = UserProfile {
            display_name: display_name.clone(),
            phone: normalize_phone(phone),
            city: clean(request.city.as_deref(), validate_city)?,
            location: clean(request.location.as_deref(), validate_location)?,
            address: clean(request.address.as_deref(), validate_address)?,
        };

        let user_id = new_user_id();
        let account = LocalAccount {
            email: email.clone(),
            user_id: user_id.clone(),
            password_hash: hash_password(&request.password),
            display_name,
        };
        if !self.store.create_account(&account).await? {
            return Err(AuthError::EmailTaken);
        }

        let written = self
            .store
            .ensure_user(&user_id, Some(&email), &ProfileUpdate::from(profile.clone()))
            .await;
        if let Err(e) = written {
            if let Err(rollback) = self.store.delete_account(&email).await {
                warn!("Failed to roll back account {email}: {rollback}");
            }
            return Err(e.into());
        }

        let identity = Identity {
            user_id,
            email,
            profile,
        };
        self.set_current(Some(identity.clone()))?;
        info!("Registered local account {}", identity.user_id);
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<()> {
        self.set_current(None)
    }

    fn current(&self) -> Option<Identity> {
        self.current.lock().ok().and_then(|current| current.clone())
    }
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

fn new_user_id() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{LOCAL_USER_PREFIX}{}", hex::encode(bytes))
}

fn check(result: Validation) -> Result<()> {
    result.map_err(AuthError::Validation)
}

fn clean(value: Option<&str>, validate: fn(&str) -> Validation) -> Result<String> {
    let value = sanitize_text(value.unwrap_or_default());
    check(validate(&value))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circle::LocalStore;
    use crate::clock::ManualClock;

    fn provider() -> LocalIdentityProvider {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        LocalIdentityProvider::new(store, Arc::new(ManualClock::at_epoch_2024()))
    }

    #[test]
    fn user_ids_have_local_prefix() {
        let id = new_user_id();
        assert!(id.starts_with(LOCAL_USER_PREFIX));
        assert_eq!(id.len(), LOCAL_USER_PREFIX.len() + 20);
        assert!(id[LOCAL_USER_PREFIX.len()..]
            .bytes()
            .all(|b| b.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn sign_up_then_sign_in_loads_profile() {
        let provider = provider();
        let created = provider
            .sign_up(
                SignUpRequest::new(" Dana@Example.com ", "hunter22", "Dana")
                    .with_phone("050-123-4567")
                    .with_city("Haifa"),
            )
            .await
            .unwrap();
        assert_eq!(created.email, "dana@example.com");
        assert_eq!(created.profile.phone, "0501234567");

        provider.sign_out().await.unwrap();
        assert!(provider.current().is_none());

        let identity = provider.sign_in("dana@example.com", "hunter22").await.unwrap();
        assert_eq!(identity.user_id, created.user_id);
        assert_eq!(identity.profile.city, "Haifa");
        assert_eq!(provider.current(), Some(identity));
    }

    #[tokio::test]
    async fn blank_name_defaults_to_email_local_part() {
        let provider = provider();
        let identity = provider
            .sign_up(SignUpRequest::new("noa@example.com", "secret1", "  "))
            .await
            .unwrap();
        assert_eq!(identity.profile.display_name, "noa");
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let provider = provider();
        provider
            .sign_up(SignUpRequest::new("dana@example.com", "hunter22", "Dana"))
            .await
            .unwrap();
        let err = provider
            .sign_up(SignUpRequest::new("DANA@example.com", "other22", "Other"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailTaken));
    }

    #[tokio::test]
    async fn malformed_email_is_not_counted() {
        let provider = provider();
        for _ in 0..10 {
            let err = provider.sign_in("not-an-email", "whatever").await.unwrap_err();
            assert!(matches!(err, AuthError::Validation(_)));
        }
        assert_eq!(provider.limiter().failures(), 0);
    }

    #[tokio::test]
    async fn wrong_password_is_counted() {
        let provider = provider();
        provider
            .sign_up(SignUpRequest::new("dana@example.com", "hunter22", "Dana"))
            .await
            .unwrap();
        let err = provider.sign_in("dana@example.com", "wrong-pass").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(provider.limiter().failures(), 1);

        provider.sign_in("dana@example.com", "hunter22").await.unwrap();
        assert_eq!(provider.limiter().failures(), 0);
    }

    #[tokio::test]
    async fn accounts_survive_reopening_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("circles.db");
        let clock = Arc::new(ManualClock::at_epoch_2024());

        let created = {
            let store = Arc::new(LocalStore::open(&path).unwrap());
            let provider = LocalIdentityProvider::new(store, clock.clone());
            let request =
                SignUpRequest::new("dana@example.com", "hunter22", "Dana").with_city("Haifa");
            provider.sign_up(request).await.unwrap()
        };

        let store = Arc::new(LocalStore::open(&path).unwrap());
        let provider = LocalIdentityProvider::new(store, clock);
        let identity = provider.sign_in("Dana@Example.com", "hunter22").await.unwrap();
        assert_eq!(identity.user_id, created.user_id);
        assert_eq!(identity.profile.city, "Haifa");

        let err = provider
            .sign_up(SignUpRequest::new("dana@example.com", "other22", "Other"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailTaken));
    }

    #[tokio::test]
    async fn invalid_sign_up_fields_are_rejected() {
        let provider = provider();
        let short_password = provider
            .sign_up(SignUpRequest::new("dana@example.com", "123", "Dana"))
            .await;
        assert!(matches!(short_password, Err(AuthError::Validation(_))));

        let bad_phone = provider
            .sign_up(SignUpRequest::new("dana@example.com", "hunter22", "Dana").with_phone("12"))
            .await;
        assert!(matches!(bad_phone, Err(AuthError::Validation(_))));

        // Nothing was registered by the failed attempts.
        provider
            .sign_up(SignUpRequest::new("dana@example.com", "hunter22", "Dana"))
            .await
            .unwrap();
    }
}
