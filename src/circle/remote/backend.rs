//! Document backend abstraction for the remote store.
//!
//! A backend stores JSON documents under slash-separated paths
//! (`circles/AB3K7Q`, `circles/AB3K7Q/members/u1`) and announces every
//! committed write on a broadcast channel, tagged with a sequence number
//! assigned by the backend. Subscribers therefore observe writes in the
//! order the backend applied them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::circle::error::CircleError;

/// A stored document: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Capacity of the change feed before slow subscribers start lagging.
pub const CHANGE_FEED_CAPACITY: usize = 256;

/// Notification of a committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Backend-assigned, strictly increasing sequence number.
    pub seq: u64,
    /// Path of the written document.
    pub path: String,
}

/// Errors reported by a document backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A stored document does not have the expected shape.
    #[error("Malformed document at {path}: {reason}")]
    Malformed {
        /// Document path.
        path: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl From<BackendError> for CircleError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => Self::Transient(msg),
            malformed @ BackendError::Malformed { .. } => Self::InvalidData(malformed.to_string()),
        }
    }
}

/// Result type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// One write inside a [`DocumentBackend::commit`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Replaces the document.
    Set {
        /// Document path.
        path: String,
        /// New content.
        doc: Document,
    },
    /// Merges fields into an existing document; skipped if it is missing.
    Update {
        /// Document path.
        path: String,
        /// Fields to merge.
        fields: Document,
    },
    /// Appends to an array field unless the value is already present.
    ///
    /// Creates the document or the field if missing.
    ArrayUnion {
        /// Document path.
        path: String,
        /// Array field name.
        field: String,
        /// Value to append.
        value: Value,
    },
}

impl Write {
    /// Returns the path the write targets.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Set { path, .. } | Self::Update { path, .. } | Self::ArrayUnion { path, .. } => {
                path
            }
        }
    }
}

/// Storage primitives the remote store is written against.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Reads a document.
    async fn get(&self, path: &str) -> BackendResult<Option<Document>>;

    /// Writes a document, replacing any existing one.
    async fn set(&self, path: &str, doc: Document) -> BackendResult<()>;

    /// Merges `fields` into an existing document.
    ///
    /// Returns `false` without writing if the document does not exist.
    async fn update(&self, path: &str, fields: Document) -> BackendResult<bool>;

    /// Merges `fields` into a document, creating it if missing.
    async fn merge(&self, path: &str, fields: Document) -> BackendResult<()>;

    /// Applies a batch of writes atomically: either every write lands or
    /// none does. Changes are announced in batch order once the whole batch
    /// is applied.
    async fn commit(&self, writes: Vec<Write>) -> BackendResult<()>;

    /// Deletes a document. Deleting a missing document is not an error.
    async fn delete(&self, path: &str) -> BackendResult<()>;

    /// Lists the direct children of a collection, ordered by id.
    async fn list(&self, collection: &str) -> BackendResult<Vec<(String, Document)>>;

    /// Appends `value` to the array `field` unless already present.
    ///
    /// Creates the document or the field if missing.
    async fn array_union(&self, path: &str, field: &str, value: Value) -> BackendResult<()>;

    /// Removes every occurrence of `value` from the array `field`.
    ///
    /// Does nothing if the document or the field is missing.
    async fn array_remove(&self, path: &str, field: &str, value: &Value) -> BackendResult<()>;

    /// Subscribes to the change feed.
    fn watch(&self) -> broadcast::Receiver<DocumentChange>;
}

/// Returns the id of `path` if it is a direct child of `collection`.
pub(crate) fn child_id<'a>(collection: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(collection)?.strip_prefix('/')?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

#[derive(Debug, Default)]
struct State {
    docs: BTreeMap<String, Document>,
    seq: u64,
}

impl State {
    fn announce(&mut self, feed: &broadcast::Sender<DocumentChange>, path: &str) {
        self.seq += 1;
        // No receivers is fine; the write is still committed.
        let _ = feed.send(DocumentChange {
            seq: self.seq,
            path: path.to_string(),
        });
    }
}

/// Authoritative in-process backend.
///
/// Writes are serialized by a lock and announced while it is held, so the
/// change feed order equals the commit order. [`set_available`] simulates
/// network loss: while unavailable every call fails with
/// [`BackendError::Unavailable`] before touching any document.
///
/// [`set_available`]: InMemoryBackend::set_available
#[derive(Debug)]
pub struct InMemoryBackend {
    state: RwLock<State>,
    feed: broadcast::Sender<DocumentChange>,
    available: AtomicBool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            feed,
            available: AtomicBool::new(true),
        }
    }

    /// Turns simulated connectivity on or off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns the number of stored documents.
    pub async fn len(&self) -> usize {
        self.state.read().await.docs.len()
    }

    /// Returns whether no document is stored.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.docs.is_empty()
    }

    fn ensure_available(&self) -> BackendResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable(
                "in-memory backend is offline".to_string(),
            ))
        }
    }
}

fn array_field<'a>(doc: &'a mut Document, path: &str, field: &str) -> BackendResult<&'a mut Vec<Value>> {
    let slot = doc
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut().ok_or_else(|| BackendError::Malformed {
        path: path.to_string(),
        reason: format!("field {field} is not an array"),
    })
}

/// Computes a document after `write`, or `None` if the write changes nothing.
fn apply_write(current: Option<Document>, write: Write) -> BackendResult<Option<Document>> {
    match write {
        Write::Set { doc, .. } => Ok(Some(doc)),
        Write::Update { fields, .. } => Ok(current.map(|mut doc| {
            doc.extend(fields);
            doc
        })),
        Write::ArrayUnion { path, field, value } => {
            let mut doc = current.unwrap_or_default();
            let array = array_field(&mut doc, &path, &field)?;
            if array.contains(&value) {
                return Ok(None);
            }
            array.push(value);
            Ok(Some(doc))
        }
    }
}

#[async_trait]
impl DocumentBackend for InMemoryBackend {
    async fn get(&self, path: &str) -> BackendResult<Option<Document>> {
        self.ensure_available()?;
        Ok(self.state.read().await.docs.get(path).cloned())
    }

    async fn set(&self, path: &str, doc: Document) -> BackendResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        state.docs.insert(path.to_string(), doc);
        state.announce(&self.feed, path);
        Ok(())
    }

    async fn update(&self, path: &str, fields: Document) -> BackendResult<bool> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let Some(doc) = state.docs.get_mut(path) else {
            return Ok(false);
        };
        doc.extend(fields);
        state.announce(&self.feed, path);
        Ok(true)
    }

    async fn merge(&self, path: &str, fields: Document) -> BackendResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        state.docs.entry(path.to_string()).or_default().extend(fields);
        state.announce(&self.feed, path);
        Ok(())
    }

    async fn commit(&self, writes: Vec<Write>) -> BackendResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;

        // Stage every write first so a failing one leaves the store untouched.
        let mut staged: BTreeMap<String, Document> = BTreeMap::new();
        let mut changed = Vec::with_capacity(writes.len());
        for write in writes {
            let path = write.path().to_string();
            let current = staged.get(&path).or_else(|| state.docs.get(&path)).cloned();
            if let Some(next) = apply_write(current, write)? {
                staged.insert(path.clone(), next);
                changed.push(path);
            }
        }

        state.docs.extend(staged);
        for path in changed {
            state.announce(&self.feed, &path);
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> BackendResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        if state.docs.remove(path).is_some() {
            state.announce(&self.feed, path);
        }
        Ok(())
    }

    async fn list(&self, collection: &str) -> BackendResult<Vec<(String, Document)>> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let prefix = format!("{collection}/");
        Ok(state
            .docs
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, doc)| child_id(collection, path).map(|id| (id.to_string(), doc.clone())))
            .collect())
    }

    async fn array_union(&self, path: &str, field: &str, value: Value) -> BackendResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let doc = state.docs.entry(path.to_string()).or_default();
        let array = array_field(doc, path, field)?;
        if array.contains(&value) {
            return Ok(());
        }
        array.push(value);
        state.announce(&self.feed, path);
        Ok(())
    }

    async fn array_remove(&self, path: &str, field: &str, value: &Value) -> BackendResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let Some(doc) = state.docs.get_mut(path) else {
            return Ok(());
        };
        let Some(Value::Array(array)) = doc.get_mut(field) else {
            return Ok(());
        };
        let before = array.len();
        array.retain(|v| v != value);
        if array.len() != before {
            state.announce(&self.feed, path);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<DocumentChange> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn child_id_only_matches_direct_children() {
        assert_eq!(child_id("circles/A/members", "circles/A/members/u1"), Some("u1"));
        assert_eq!(child_id("circles/A/members", "circles/A/members/u1/x"), None);
        assert_eq!(child_id("circles/A/members", "circles/A/membersX/u1"), None);
        assert_eq!(child_id("circles/A/members", "circles/A"), None);
    }

    #[tokio::test]
    async fn update_merges_and_reports_missing() {
        let backend = InMemoryBackend::new();
        backend.set("users/u1", doc(json!({"a": 1, "b": 2}))).await.unwrap();

        assert!(backend.update("users/u1", doc(json!({"b": 3}))).await.unwrap());
        assert!(!backend.update("users/u2", doc(json!({"b": 3}))).await.unwrap());

        let stored = backend.get("users/u1").await.unwrap().unwrap();
        assert_eq!(Value::Object(stored), json!({"a": 1, "b": 3}));
        assert!(backend.get("users/u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_direct_children_in_order() {
        let backend = InMemoryBackend::new();
        backend.set("c/A/members/b", Document::new()).await.unwrap();
        backend.set("c/A/members/a", Document::new()).await.unwrap();
        backend.set("c/A/members/a/nested/x", Document::new()).await.unwrap();
        backend.set("c/AB/members/z", Document::new()).await.unwrap();

        let ids: Vec<_> = backend
            .list("c/A/members")
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn array_union_is_set_like() {
        let backend = InMemoryBackend::new();
        backend.array_union("users/u1", "ids", json!("A")).await.unwrap();
        backend.array_union("users/u1", "ids", json!("B")).await.unwrap();
        backend.array_union("users/u1", "ids", json!("A")).await.unwrap();

        let stored = backend.get("users/u1").await.unwrap().unwrap();
        assert_eq!(stored["ids"], json!(["A", "B"]));

        backend.array_remove("users/u1", "ids", &json!("A")).await.unwrap();
        let stored = backend.get("users/u1").await.unwrap().unwrap();
        assert_eq!(stored["ids"], json!(["B"]));
    }

    #[tokio::test]
    async fn array_union_rejects_non_array_field() {
        let backend = InMemoryBackend::new();
        backend.set("users/u1", doc(json!({"ids": 5}))).await.unwrap();
        let err = backend.array_union("users/u1", "ids", json!("A")).await.unwrap_err();
        assert!(matches!(err, BackendError::Malformed { .. }));
    }

    #[tokio::test]
    async fn changes_are_sequenced() {
        let backend = InMemoryBackend::new();
        let mut feed = backend.watch();
        backend.set("a", Document::new()).await.unwrap();
        backend.delete("a").await.unwrap();
        backend.delete("a").await.unwrap();
        backend.set("b", Document::new()).await.unwrap();

        let seqs: Vec<_> = (0..3).map(|_| feed.try_recv().unwrap()).collect();
        assert_eq!(
            seqs.iter().map(|c| c.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(seqs[2].path, "b");
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn commit_applies_batch_in_order() {
        let backend = InMemoryBackend::new();
        backend.set("c/A/members/u1", doc(json!({"s": "safe"}))).await.unwrap();
        let mut feed = backend.watch();

        backend
            .commit(vec![
                Write::Set {
                    path: "c/A".to_string(),
                    doc: doc(json!({"name": "Home"})),
                },
                Write::Update {
                    path: "c/A/members/u1".to_string(),
                    fields: doc(json!({"s": "unknown"})),
                },
                Write::Update {
                    path: "c/A/members/ghost".to_string(),
                    fields: doc(json!({"s": "unknown"})),
                },
                Write::ArrayUnion {
                    path: "u/u1".to_string(),
                    field: "ids".to_string(),
                    value: json!("A"),
                },
            ])
            .await
            .unwrap();

        let paths: Vec<_> = (0..3).map(|_| feed.try_recv().unwrap().path).collect();
        assert_eq!(paths, vec!["c/A", "c/A/members/u1", "u/u1"]);
        assert!(feed.try_recv().is_err());
        assert!(backend.get("c/A/members/ghost").await.unwrap().is_none());
        assert_eq!(backend.get("u/u1").await.unwrap().unwrap()["ids"], json!(["A"]));
    }

    #[tokio::test]
    async fn failing_write_discards_whole_batch() {
        let backend = InMemoryBackend::new();
        backend.set("u/u1", doc(json!({"ids": 5}))).await.unwrap();
        let mut feed = backend.watch();

        let err = backend
            .commit(vec![
                Write::Set {
                    path: "c/A".to_string(),
                    doc: Document::new(),
                },
                Write::ArrayUnion {
                    path: "u/u1".to_string(),
                    field: "ids".to_string(),
                    value: json!("A"),
                },
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::Malformed { .. }));
        assert!(backend.get("c/A").await.unwrap().is_none());
        assert_eq!(backend.len().await, 1);
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn unavailable_backend_writes_nothing() {
        let backend = InMemoryBackend::new();
        backend.set_available(false);

        let err = backend.set("a", Document::new()).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(CircleError::from(err).is_transient());

        backend.set_available(true);
        assert!(backend.is_empty().await);
    }
}
