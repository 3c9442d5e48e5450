//! Sign-in attempt limiting and account storage through the identity provider.

mod helpers;

use std::sync::Arc;

use helpers::both_backends;
use safe_circle_core::circle::CircleStore;
use safe_circle_core::identity::{
    AuthError, IdentityProvider, LocalIdentityProvider, SignUpRequest, LOCKOUT_SECONDS,
    MAX_LOGIN_ATTEMPTS,
};

const EMAIL: &str = "dana@example.com";
const PASSWORD: &str = "correct-horse";

async fn registered(fx: &helpers::Fixture) -> LocalIdentityProvider {
    let provider = LocalIdentityProvider::new(Arc::clone(&fx.store), fx.clock.clone());
    provider
        .sign_up(SignUpRequest::new(EMAIL, PASSWORD, "Dana"))
        .await
        .unwrap();
    provider.sign_out().await.unwrap();
    provider
}

#[tokio::test]
async fn fifth_failure_locks_even_the_right_password() {
    for fx in both_backends() {
        let provider = registered(&fx).await;

        for _ in 0..MAX_LOGIN_ATTEMPTS {
            let err = provider.sign_in(EMAIL, "wrong-pass").await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials), "{}: {err}", fx.name);
        }

        let err = provider.sign_in(EMAIL, PASSWORD).await.unwrap_err();
        match err {
            AuthError::LockedOut { retry_after_secs } => {
                assert_eq!(retry_after_secs, 60, "{}", fx.name);
            }
            other => panic!("{}: expected lockout, got {other}", fx.name),
        }
        assert!(provider.current().is_none());

        fx.clock.advance(chrono::Duration::seconds(LOCKOUT_SECONDS / 2));
        let err = provider.sign_in(EMAIL, PASSWORD).await.unwrap_err();
        assert!(matches!(err, AuthError::LockedOut { retry_after_secs: 30 }));

        fx.clock.advance(chrono::Duration::seconds(LOCKOUT_SECONDS / 2));
        let identity = provider.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert_eq!(identity.email, EMAIL);
        assert_eq!(provider.limiter().failures(), 0);
    }
}

#[tokio::test]
async fn malformed_email_is_not_counted() {
    for fx in both_backends() {
        let provider = registered(&fx).await;

        for _ in 0..10 {
            let err = provider.sign_in("not-an-email", PASSWORD).await.unwrap_err();
            assert!(matches!(err, AuthError::Validation(_)), "{}", fx.name);
        }
        assert_eq!(provider.limiter().failures(), 0);
        provider.sign_in(EMAIL, PASSWORD).await.unwrap();
    }
}

#[tokio::test]
async fn success_resets_the_count() {
    for fx in both_backends() {
        let provider = registered(&fx).await;

        for _ in 0..MAX_LOGIN_ATTEMPTS - 1 {
            provider.sign_in(EMAIL, "wrong-pass").await.unwrap_err();
        }
        provider.sign_in(EMAIL, PASSWORD).await.unwrap();

        for _ in 0..MAX_LOGIN_ATTEMPTS - 1 {
            provider.sign_in(EMAIL, "wrong-pass").await.unwrap_err();
        }
        provider.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert_eq!(provider.limiter().failures(), 0, "{}", fx.name);
    }
}

#[tokio::test]
async fn unknown_account_counts_as_failure() {
    for fx in both_backends() {
        let provider = registered(&fx).await;
        let err = provider.sign_in("nobody@example.com", PASSWORD).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(provider.limiter().failures(), 1, "{}", fx.name);
    }
}

#[tokio::test]
async fn accounts_outlive_the_provider() {
    for fx in both_backends() {
        let created = registered(&fx).await;
        drop(created);

        let fresh = LocalIdentityProvider::new(Arc::clone(&fx.store), fx.clock.clone());
        let identity = fresh.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert_eq!(identity.profile.display_name, "Dana", "{}", fx.name);

        let account = fx.store.account(EMAIL).await.unwrap().unwrap();
        assert_eq!(account.user_id, identity.user_id);
        assert_ne!(account.password_hash, PASSWORD);
    }
}
