//! High-level circle API consumed by the UI.
//!
//! [`CircleSyncEngine`] wraps the process's [`CircleStore`] and applies
//! input validation uniformly, whichever backend is active. Ownership is not
//! re-checked here: the store is the final authority on owner-only actions.
//!
//! A [`CircleSession`] binds the engine to the circle and user currently on
//! screen. It keeps a live member snapshot with derived counts and exposes
//! the status verbs, which do nothing when no user or circle is active.

use std::sync::Arc;

use futures::future::try_join_all;
use log::{debug, info};
use tokio::sync::watch;

use super::error::{CircleError, Result};
use super::local::LocalStore;
use super::remote::{DocumentBackend, RemoteStore};
use super::store::{CircleStore, Subscription};
use super::types::{
    Circle, CircleCreationResult, CircleSummary, Member, MemberStatus, MyCircleInfo,
    ProfileUpdate, UserProfile, DEFAULT_CIRCLE_NAME,
};
use super::view::MemberQuery;
use crate::config::{Backend, SyncConfig};
use crate::validation::{
    sanitize_text, validate_address, validate_city, validate_display_name, validate_invite_code,
    validate_location, validate_phone, Validation,
};

/// Entry point for circle operations.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use safe_circle_core::circle::{CircleSyncEngine, InMemoryBackend, RemoteStore};
///
/// # async fn demo() -> safe_circle_core::circle::Result<()> {
/// let store = RemoteStore::new(Arc::new(InMemoryBackend::new()));
/// let engine = CircleSyncEngine::new(Arc::new(store));
/// let created = engine.create_circle("u1", "Dana", Some("Family"), None).await?;
/// let session = engine.session(Some(&created.circle_id), Some("u1"))?;
/// session.mark_safe().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CircleSyncEngine {
    store: Arc<dyn CircleStore>,
}

impl std::fmt::Debug for CircleSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircleSyncEngine").finish_non_exhaustive()
    }
}

impl CircleSyncEngine {
    /// Creates an engine over an existing store.
    #[must_use]
    pub fn new(store: Arc<dyn CircleStore>) -> Self {
        Self { store }
    }

    /// Creates the engine for the backend named in `config`.
    ///
    /// The remote backend needs a document backend from the host; the local
    /// backend opens `<data_dir>/circles.db`, creating the directory.
    ///
    /// # Errors
    ///
    /// Returns [`CircleError::Config`] if the remote backend is selected
    /// without a document backend, or an error if the database cannot be
    /// opened.
    pub fn from_config(
        config: &SyncConfig,
        remote: Option<Arc<dyn DocumentBackend>>,
    ) -> Result<Self> {
        let store: Arc<dyn CircleStore> = match config.backend {
            Backend::Remote => {
                let backend = remote.ok_or_else(|| {
                    CircleError::Config(
                        "Remote backend selected but no document backend was supplied".to_string(),
                    )
                })?;
                Arc::new(RemoteStore::new(backend))
            }
            Backend::Local => {
                std::fs::create_dir_all(&config.data_dir).map_err(|e| {
                    CircleError::Storage(format!("Failed to create data directory: {e}"))
                })?;
                Arc::new(
                    LocalStore::open(&config.database_path())?
                        .with_poll_interval(config.poll_interval()),
                )
            }
        };
        info!("Circle engine using {} backend", config.backend.as_str());
        Ok(Self { store })
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CircleStore> {
        &self.store
    }

    // ==================== Circles ====================

    /// Creates a circle owned by `owner_id`.
    ///
    /// The name is sanitised; a blank name becomes `"My circle"`.
    ///
    /// # Errors
    ///
    /// Returns [`CircleError::Validation`] for a name over 50 characters or a
    /// malformed owner phone, or a store error.
    pub async fn create_circle(
        &self,
        owner_id: &str,
        owner_name: &str,
        name: Option<&str>,
        owner_phone: Option<&str>,
    ) -> Result<CircleCreationResult> {
        let name = sanitize_text(name.unwrap_or_default());
        let name = if name.is_empty() {
            DEFAULT_CIRCLE_NAME.to_string()
        } else {
            name
        };
        check(validate_display_name(&name))?;
        let owner_phone = optional_phone(owner_phone)?;

        self.store
            .create_circle(owner_id, &sanitize_text(owner_name), &name, owner_phone)
            .await
    }

    /// Joins a circle by invite code.
    ///
    /// Returns `Ok(None)` when no circle has that code.
    ///
    /// # Errors
    ///
    /// Returns [`CircleError::Validation`] for a malformed code, name or
    /// phone, or a store error.
    pub async fn join_circle(
        &self,
        invite_code: &str,
        user_id: &str,
        display_name: &str,
        phone: Option<&str>,
    ) -> Result<Option<String>> {
        check(validate_invite_code(invite_code))?;
        let display_name = sanitize_text(display_name);
        check(validate_display_name(&display_name))?;
        let phone = optional_phone(phone)?;

        self.store
            .join_circle(invite_code, user_id, &display_name, phone)
            .await
    }

    /// Removes a circle from the user's list; their member row stays.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn leave_circle(&self, user_id: &str, circle_id: &str) -> Result<()> {
        self.store.remove_circle_from_user(user_id, circle_id).await?;
        debug!("User left circle {circle_id}");
        Ok(())
    }

    /// Lists the user's circles.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn my_circles(&self, user_id: &str) -> Result<Vec<MyCircleInfo>> {
        self.store.my_circles(user_id).await
    }

    /// Looks up a circle by invite code.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn circle_by_code(&self, invite_code: &str) -> Result<Option<Circle>> {
        self.store.circle_by_code(invite_code).await
    }

    /// Returns the owner of a circle.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn circle_owner(&self, circle_id: &str) -> Result<Option<String>> {
        self.store.circle_owner(circle_id).await
    }

    /// Reads the member list once.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn members(&self, circle_id: &str) -> Result<Vec<Member>> {
        self.store.members(circle_id).await
    }

    /// Counts members by status.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn summary(&self, circle_id: &str) -> Result<CircleSummary> {
        self.store.summary(circle_id).await
    }

    // ==================== Profiles ====================

    /// Reads a profile.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.store.profile(user_id).await
    }

    /// Validates, sanitises and applies a partial profile update.
    ///
    /// # Errors
    ///
    /// Returns [`CircleError::Validation`] for an invalid field, or a store
    /// error.
    pub async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<()> {
        let update = clean_profile(update)?;
        self.store.update_profile(user_id, &update).await
    }

    // ==================== Sessions ====================

    /// Opens a session for the active circle and user.
    ///
    /// With a circle, the session subscribes to its members and starts out
    /// loading; without one, it holds an empty snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be started.
    pub fn session(&self, circle_id: Option<&str>, user_id: Option<&str>) -> Result<CircleSession> {
        let circle_id = circle_id.filter(|id| !id.is_empty()).map(str::to_string);
        let user_id = user_id.filter(|id| !id.is_empty()).map(str::to_string);

        let (tx, rx) = watch::channel(MembersSnapshot {
            loading: circle_id.is_some(),
            ..MembersSnapshot::default()
        });
        let subscription = match &circle_id {
            Some(id) => Some(self.store.subscribe_members(
                id,
                Box::new(move |members| {
                    tx.send_replace(MembersSnapshot::from_members(members));
                }),
            )?),
            None => None,
        };

        Ok(CircleSession {
            store: Arc::clone(&self.store),
            circle_id,
            user_id,
            snapshot: rx,
            subscription,
        })
    }
}

/// Latest member list of the session's circle with derived counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembersSnapshot {
    /// Members as last delivered by the store.
    pub members: Vec<Member>,
    /// Members whose `isSafe` flag is not set.
    pub not_safe_count: usize,
    /// Members in SOS.
    pub sos_count: usize,
    /// `true` until the first delivery.
    pub loading: bool,
}

impl MembersSnapshot {
    /// Derives the counts from a member list.
    #[must_use]
    pub fn from_members(members: Vec<Member>) -> Self {
        Self {
            not_safe_count: members.iter().filter(|m| !m.is_safe).count(),
            sos_count: members
                .iter()
                .filter(|m| m.status == MemberStatus::Sos)
                .count(),
            members,
            loading: false,
        }
    }

    /// Counts the snapshot the same way the store's summary does.
    #[must_use]
    pub fn summary(&self) -> CircleSummary {
        CircleSummary::from_members(&self.members)
    }
}

/// The circle and user currently on screen.
pub struct CircleSession {
    store: Arc<dyn CircleStore>,
    circle_id: Option<String>,
    user_id: Option<String>,
    snapshot: watch::Receiver<MembersSnapshot>,
    subscription: Option<Subscription>,
}

impl std::fmt::Debug for CircleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircleSession")
            .field("circle_id", &self.circle_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl CircleSession {
    /// Returns the active circle id.
    #[must_use]
    pub fn circle_id(&self) -> Option<&str> {
        self.circle_id.as_deref()
    }

    /// Returns the active user id.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Returns the latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MembersSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Returns a receiver for snapshot updates.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<MembersSnapshot> {
        self.snapshot.clone()
    }

    /// Waits for the next snapshot.
    ///
    /// Returns `None` once the subscription has ended.
    pub async fn next_snapshot(&mut self) -> Option<MembersSnapshot> {
        self.snapshot.changed().await.ok()?;
        Some(self.snapshot.borrow_and_update().clone())
    }

    /// Returns the active user's own row, if present.
    #[must_use]
    pub fn me(&self) -> Option<Member> {
        let user_id = self.user_id.as_deref()?;
        self.snapshot
            .borrow()
            .members
            .iter()
            .find(|m| m.is_user(user_id))
            .cloned()
    }

    /// Applies a display query, with the active user as viewer by default.
    #[must_use]
    pub fn view(&self, query: &MemberQuery) -> Vec<Member> {
        let mut query = query.clone();
        if query.viewer_id.is_none() {
            query.viewer_id.clone_from(&self.user_id);
        }
        query.apply(&self.snapshot.borrow().members)
    }

    /// Returns whether the active user owns the active circle.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn is_owner(&self) -> Result<bool> {
        let (Some(circle_id), Some(user_id)) = (&self.circle_id, &self.user_id) else {
            return Ok(false);
        };
        Ok(self.store.circle_owner(circle_id).await?.as_deref() == Some(user_id.as_str()))
    }

    // ==================== Status Verbs ====================

    /// Marks the user safe in every circle they belong to.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn mark_safe(&self) -> Result<()> {
        self.set_status_everywhere(MemberStatus::Safe).await
    }

    /// Clears the user's safe status in every circle they belong to.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn mark_unsafe(&self) -> Result<()> {
        self.set_status_everywhere(MemberStatus::Unknown).await
    }

    /// Raises SOS in the active circle.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn mark_sos(&self) -> Result<()> {
        let (Some(circle_id), Some(user_id)) = (&self.circle_id, &self.user_id) else {
            return Ok(());
        };
        info!("SOS raised in circle {circle_id}");
        self.store
            .set_status(circle_id, user_id, MemberStatus::Sos)
            .await
    }

    /// Resets every member of the active circle to unknown.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn reset_all(&self) -> Result<()> {
        let Some(circle_id) = &self.circle_id else {
            return Ok(());
        };
        self.store.reset_all_members(circle_id).await
    }

    async fn set_status_everywhere(&self, status: MemberStatus) -> Result<()> {
        let Some(user_id) = &self.user_id else {
            return Ok(());
        };
        let circle_ids = self.store.user_circle_ids(user_id).await?;
        let store = &self.store;
        try_join_all(
            circle_ids
                .iter()
                .map(|circle_id| store.set_status(circle_id, user_id, status)),
        )
        .await?;
        Ok(())
    }

    // ==================== Membership ====================

    /// Adds a phone-only member to the active circle.
    ///
    /// # Errors
    ///
    /// Returns [`CircleError::Validation`] for a blank or long name or a
    /// malformed phone, or the store's capacity and duplicate errors.
    pub async fn add_member_by_phone(&self, display_name: &str, phone: &str) -> Result<()> {
        let Some(circle_id) = &self.circle_id else {
            return Ok(());
        };
        let display_name = sanitize_text(display_name);
        if display_name.is_empty() {
            return Err(CircleError::Validation("Please enter a name".to_string()));
        }
        check(validate_display_name(&display_name))?;
        check(validate_phone(phone))?;

        self.store
            .add_member_by_phone(circle_id, &display_name, phone)
            .await
    }

    /// Removes a member from the active circle on behalf of the active user.
    ///
    /// # Errors
    ///
    /// Returns [`CircleError::Unauthorized`] without an active user or when
    /// the user does not own the circle, [`CircleError::SelfRemoval`] for the
    /// owner's own row, or a store error.
    pub async fn remove_member(&self, member_id: &str) -> Result<()> {
        let Some(circle_id) = &self.circle_id else {
            return Ok(());
        };
        let Some(user_id) = &self.user_id else {
            return Err(CircleError::Unauthorized(
                "Sign in to manage members".to_string(),
            ));
        };
        self.store.remove_member(circle_id, member_id, user_id).await
    }

    /// Stops the member subscription. Safe to call more than once.
    pub fn close(&self) {
        if let Some(subscription) = &self.subscription {
            subscription.cancel();
        }
    }
}

fn check(result: Validation) -> Result<()> {
    result.map_err(CircleError::Validation)
}

fn optional_phone(phone: Option<&str>) -> Result<Option<&str>> {
    match phone.filter(|p| !p.trim().is_empty()) {
        Some(p) => {
            check(validate_phone(p))?;
            Ok(Some(p))
        }
        None => Ok(None),
    }
}

fn clean_profile(update: &ProfileUpdate) -> Result<ProfileUpdate> {
    let clean = |value: &Option<String>| value.as_deref().map(sanitize_text);
    let cleaned = ProfileUpdate {
        display_name: clean(&update.display_name),
        phone: update.phone.as_deref().map(str::trim).map(str::to_string),
        city: clean(&update.city),
        location: clean(&update.location),
        address: clean(&update.address),
    };

    if let Some(name) = &cleaned.display_name {
        check(validate_display_name(name))?;
    }
    if let Some(phone) = cleaned.phone.as_deref().filter(|p| !p.is_empty()) {
        check(validate_phone(phone))?;
    }
    if let Some(city) = &cleaned.city {
        check(validate_city(city))?;
    }
    if let Some(location) = &cleaned.location {
        check(validate_location(location))?;
    }
    if let Some(address) = &cleaned.address {
        check(validate_address(address))?;
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circle::invite::SequenceCodeGenerator;
    use crate::circle::remote::InMemoryBackend;

    fn engine() -> CircleSyncEngine {
        let store = RemoteStore::new(Arc::new(InMemoryBackend::new()))
            .with_code_generator(Arc::new(SequenceCodeGenerator::new(["AB3K7Q", "CD4M8R"])));
        CircleSyncEngine::new(Arc::new(store))
    }

    #[tokio::test]
    async fn blank_name_becomes_default() {
        let engine = engine();
        let created = engine.create_circle("u1", "Dana", Some("  "), None).await.unwrap();
        let circle = engine.circle_by_code(&created.invite_code).await.unwrap().unwrap();
        assert_eq!(circle.name, DEFAULT_CIRCLE_NAME);
    }

    #[tokio::test]
    async fn long_name_is_rejected() {
        let engine = engine();
        let err = engine
            .create_circle("u1", "Dana", Some(&"x".repeat(51)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CircleError::Validation(_)));
    }

    #[tokio::test]
    async fn malformed_code_is_a_validation_error() {
        let engine = engine();
        let err = engine.join_circle("AB3", "u2", "Noa", None).await.unwrap_err();
        assert!(matches!(err, CircleError::Validation(_)));

        // Well-formed but unknown codes are not errors.
        assert_eq!(engine.join_circle("ZZZZZZ", "u2", "Noa", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn session_without_user_or_circle_is_inert() {
        let engine = engine();
        engine.create_circle("u1", "Dana", None, None).await.unwrap();

        let no_user = engine.session(Some("AB3K7Q"), None).unwrap();
        no_user.mark_safe().await.unwrap();
        no_user.mark_sos().await.unwrap();
        assert!(matches!(
            no_user.remove_member("u1").await,
            Err(CircleError::Unauthorized(_))
        ));

        let no_circle = engine.session(None, Some("u1")).unwrap();
        assert!(!no_circle.snapshot().loading);
        no_circle.mark_sos().await.unwrap();
        no_circle.reset_all().await.unwrap();
        no_circle.remove_member("u1").await.unwrap();

        assert_eq!(engine.summary("AB3K7Q").await.unwrap().safe, 0);
        assert_eq!(engine.summary("AB3K7Q").await.unwrap().sos, 0);
    }

    #[tokio::test]
    async fn mark_safe_applies_to_every_circle() {
        let engine = engine();
        engine.create_circle("u1", "Dana", Some("Home"), None).await.unwrap();
        engine.create_circle("u1", "Dana", Some("Work"), None).await.unwrap();

        let session = engine.session(Some("AB3K7Q"), Some("u1")).unwrap();
        session.mark_safe().await.unwrap();
        assert_eq!(engine.summary("AB3K7Q").await.unwrap().safe, 1);
        assert_eq!(engine.summary("CD4M8R").await.unwrap().safe, 1);

        session.mark_unsafe().await.unwrap();
        assert_eq!(engine.summary("CD4M8R").await.unwrap().safe, 0);
    }

    #[tokio::test]
    async fn snapshot_counts_follow_the_store() {
        let engine = engine();
        engine.create_circle("u1", "Dana", None, None).await.unwrap();
        engine.join_circle("AB3K7Q", "u2", "Noa", None).await.unwrap();

        let mut session = engine.session(Some("AB3K7Q"), Some("u1")).unwrap();
        assert!(session.snapshot().loading);
        let first = session.next_snapshot().await.unwrap();
        assert!(!first.loading);
        assert_eq!(first.not_safe_count, 2);

        session.mark_sos().await.unwrap();
        let next = session.next_snapshot().await.unwrap();
        assert_eq!(next.sos_count, 1);
        assert_eq!(session.me().unwrap().status, MemberStatus::Sos);
        assert!(session.is_owner().await.unwrap());
    }

    #[tokio::test]
    async fn profile_update_is_validated() {
        let engine = engine();
        let err = engine
            .update_profile("u1", &ProfileUpdate::new().with_city("x".repeat(81)))
            .await
            .unwrap_err();
        assert!(matches!(err, CircleError::Validation(_)));

        engine
            .update_profile("u1", &ProfileUpdate::new().with_city("  <Haifa>  "))
            .await
            .unwrap();
        assert_eq!(engine.profile("u1").await.unwrap().unwrap().city, "Haifa");
    }
}
