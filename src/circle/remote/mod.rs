//! Remote (push-based) circle store.
//!
//! [`RemoteStore`] writes documents through a pluggable [`DocumentBackend`]
//! and turns the backend's ordered change feed into live subscriptions.
//! [`InMemoryBackend`] is an authoritative in-process backend used for
//! tests and demos.

mod backend;
mod records;
mod store;

pub use backend::{
    BackendError, BackendResult, Document, DocumentBackend, DocumentChange, InMemoryBackend, Write,
    CHANGE_FEED_CAPACITY,
};
pub use store::RemoteStore;
