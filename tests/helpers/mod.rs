//! Reusable fixtures for circle integration tests.
//!
//! Every fixture pins the clock and the invite codes so scenarios are
//! deterministic, and each builds a fresh store: an in-memory document
//! backend for the remote store, an on-disk database in a temporary
//! directory for the local store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use safe_circle_core::circle::{
    CircleStore, CircleSyncEngine, InMemoryBackend, LocalStore, RemoteStore,
    SequenceCodeGenerator,
};
use safe_circle_core::clock::ManualClock;
use tempfile::TempDir;

/// Invite code handed out for the first circle of every fixture.
pub const FIRST_CODE: &str = "AB3K7Q";

/// Invite code handed out for the second circle of every fixture.
pub const SECOND_CODE: &str = "CD4M8R";

/// Polling interval of local fixtures.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// A store, the engine over it, and the handles tests poke at.
pub struct Fixture {
    pub name: &'static str,
    pub store: Arc<dyn CircleStore>,
    pub engine: CircleSyncEngine,
    pub clock: Arc<ManualClock>,
    /// Present for the remote fixture only.
    pub backend: Option<Arc<InMemoryBackend>>,
    _dir: Option<TempDir>,
}

fn codes() -> Arc<SequenceCodeGenerator> {
    Arc::new(SequenceCodeGenerator::new([FIRST_CODE, SECOND_CODE]))
}

/// Remote store over a fresh in-memory backend.
pub fn remote_fixture() -> Fixture {
    let clock = Arc::new(ManualClock::at_epoch_2024());
    let backend = Arc::new(InMemoryBackend::new());
    let store: Arc<dyn CircleStore> = Arc::new(
        RemoteStore::new(backend.clone())
            .with_clock(clock.clone())
            .with_code_generator(codes()),
    );
    Fixture {
        name: "remote",
        engine: CircleSyncEngine::new(store.clone()),
        store,
        clock,
        backend: Some(backend),
        _dir: None,
    }
}

/// Local store in a fresh temporary directory.
pub fn local_fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let clock = Arc::new(ManualClock::at_epoch_2024());
    let store: Arc<dyn CircleStore> = Arc::new(
        LocalStore::open(&dir.path().join("circles.db"))
            .expect("open local store")
            .with_clock(clock.clone())
            .with_code_generator(codes())
            .with_poll_interval(POLL_INTERVAL),
    );
    Fixture {
        name: "local",
        engine: CircleSyncEngine::new(store.clone()),
        store,
        clock,
        backend: None,
        _dir: Some(dir),
    }
}

/// One fixture per backend.
pub fn both_backends() -> Vec<Fixture> {
    vec![remote_fixture(), local_fixture()]
}

/// A valid 10-digit phone number unique per `n`.
pub fn phone(n: usize) -> String {
    format!("05{n:08}")
}
