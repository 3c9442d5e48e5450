//! Salted password digests for device-local accounts.
//!
//! Stored form: `<iterations>$<base64 salt>$<base64 digest>`, where the
//! digest is SHA-256 iterated over `salt || password`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Digest rounds for new hashes.
pub const DEFAULT_ITERATIONS: u32 = 10_000;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// Hashes `password` with a fresh random salt.
#[must_use]
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = derive(password, &salt, DEFAULT_ITERATIONS);
    format!(
        "{DEFAULT_ITERATIONS}${}${}",
        STANDARD.encode(salt),
        STANDARD.encode(digest.as_slice())
    )
}

/// Checks `password` against a stored hash in constant time.
///
/// Malformed stored values never verify.
#[must_use]
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(iterations), Some(salt), Some(expected)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (STANDARD.decode(salt), STANDARD.decode(expected)) else {
        return false;
    };
    if iterations == 0 {
        return false;
    }

    let actual = derive(password, &salt, iterations);
    actual.as_slice().ct_eq(&expected).into()
}

fn derive(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut digest = Zeroizing::new([0u8; 32]);
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    digest.copy_from_slice(&hasher.finalize());

    for _ in 1..iterations {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(digest.as_slice());
        digest.copy_from_slice(&hasher.finalize());
    }
    digest
}
