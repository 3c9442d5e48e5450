//! Push-based circle store over a [`DocumentBackend`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};

use super::backend::{child_id, DocumentBackend, DocumentChange, Write};
use super::records::{
    account_path, circle_path, decode, encode, member_path, members_path, profile_document,
    status_document, user_path, CircleRecord, MemberRecord, UserRecord, CIRCLE_INDEX_FIELD,
};
use crate::circle::error::{CircleError, Result};
use crate::circle::invite::{normalize_code, CodeGenerator, RandomCodeGenerator};
use crate::circle::status::StatusFields;
use crate::circle::store::{
    phone_member_id, CircleCallback, CircleStore, MembersCallback, Subscription,
};
use crate::circle::types::{
    Circle, CircleCreationResult, LocalAccount, Member, MemberStatus, MyCircleInfo, ProfileUpdate,
    UserProfile, FALLBACK_CIRCLE_NAME, MAX_CIRCLE_MEMBERS,
};
use crate::clock::{Clock, SystemClock};
use crate::validation::normalize_phone;

/// Circle store backed by a shared document backend.
///
/// Every write lands in the backend, which is the single source of truth;
/// concurrent writers on other devices are expected. Subscribers re-read
/// on every committed write that touches the watched documents.
pub struct RemoteStore {
    backend: Arc<dyn DocumentBackend>,
    clock: Arc<dyn Clock>,
    codes: Arc<dyn CodeGenerator>,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore").finish_non_exhaustive()
    }
}

impl RemoteStore {
    /// Creates a store over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            codes: Arc::new(RandomCodeGenerator),
        }
    }

    /// Uses the given clock for timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses the given generator for invite codes.
    #[must_use]
    pub fn with_code_generator(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.codes = codes;
        self
    }

    async fn write_member(&self, circle_id: &str, member: &Member) -> Result<()> {
        let write = member_write(circle_id, member)?;
        self.backend.commit(vec![write]).await?;
        Ok(())
    }

    async fn read_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let path = user_path(user_id);
        self.backend
            .get(&path)
            .await?
            .map(|doc| decode(&path, doc))
            .transpose()
    }
}

#[async_trait]
impl CircleStore for RemoteStore {
    // ==================== Circle Lifecycle ====================

    async fn create_circle(
        &self,
        owner_id: &str,
        owner_name: &str,
        name: &str,
        owner_phone: Option<&str>,
    ) -> Result<CircleCreationResult> {
        let invite_code = self.codes.generate();
        let now = self.clock.now();

        let path = circle_path(&invite_code);
        let record = CircleRecord {
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            invite_code: invite_code.clone(),
            created_at: now.timestamp_millis(),
        };
        let owner = Member::new(
            owner_id,
            Some(owner_id.to_string()),
            owner_name,
            owner_phone.map(str::to_string),
            now,
        );

        // Circle, owner row and index entry land together or not at all.
        self.backend
            .commit(vec![
                Write::Set {
                    doc: encode(&path, &record)?,
                    path,
                },
                member_write(&invite_code, &owner)?,
                index_write(owner_id, &invite_code),
            ])
            .await?;

        info!("Created circle {invite_code}");
        Ok(CircleCreationResult {
            circle_id: invite_code.clone(),
            invite_code,
        })
    }

    async fn join_circle(
        &self,
        invite_code: &str,
        user_id: &str,
        display_name: &str,
        phone: Option<&str>,
    ) -> Result<Option<String>> {
        let code = normalize_code(invite_code);
        if self.backend.get(&circle_path(&code)).await?.is_none() {
            return Ok(None);
        }

        let member = Member::new(
            user_id,
            Some(user_id.to_string()),
            display_name,
            phone.map(str::to_string),
            self.clock.now(),
        );
        self.backend
            .commit(vec![member_write(&code, &member)?, index_write(user_id, &code)])
            .await?;

        debug!("User joined circle {code}");
        Ok(Some(code))
    }

    async fn circle_by_code(&self, invite_code: &str) -> Result<Option<Circle>> {
        read_circle(&*self.backend, &normalize_code(invite_code)).await
    }

    async fn circle_owner(&self, circle_id: &str) -> Result<Option<String>> {
        Ok(read_circle(&*self.backend, circle_id)
            .await?
            .map(|c| c.owner_id))
    }

    // ==================== Member Management ====================

    async fn add_member_by_phone(
        &self,
        circle_id: &str,
        display_name: &str,
        phone: &str,
    ) -> Result<()> {
        let normalized = normalize_phone(phone);
        if normalized.is_empty() {
            return Err(CircleError::Validation(
                "Phone number has no digits".to_string(),
            ));
        }

        // Read-then-write without a transaction; see the module docs of `store`.
        let existing = read_members(&*self.backend, circle_id).await?;
        if existing.len() >= MAX_CIRCLE_MEMBERS {
            return Err(CircleError::CapacityReached {
                max: MAX_CIRCLE_MEMBERS,
            });
        }
        if existing
            .iter()
            .any(|m| normalize_phone(m.phone.as_deref().unwrap_or_default()) == normalized)
        {
            return Err(CircleError::DuplicatePhone(normalized));
        }

        let now = self.clock.now();
        let member = Member::new(
            phone_member_id(now.timestamp_millis()),
            None,
            display_name,
            Some(normalized),
            now,
        );
        self.write_member(circle_id, &member).await
    }

    async fn remove_member(
        &self,
        circle_id: &str,
        member_id: &str,
        requester_id: &str,
    ) -> Result<()> {
        let Some(circle) = read_circle(&*self.backend, circle_id).await? else {
            return Ok(());
        };
        if circle.owner_id != requester_id {
            return Err(CircleError::Unauthorized(
                "Only the circle owner can remove members".to_string(),
            ));
        }

        let path = member_path(circle_id, member_id);
        let Some(doc) = self.backend.get(&path).await? else {
            return Ok(());
        };
        let target: MemberRecord = decode(&path, doc)?;
        if target.user_id.as_deref() == Some(circle.owner_id.as_str()) {
            return Err(CircleError::SelfRemoval);
        }

        self.backend.delete(&path).await?;
        info!("Removed member {member_id} from circle {circle_id}");
        Ok(())
    }

    async fn members(&self, circle_id: &str) -> Result<Vec<Member>> {
        read_members(&*self.backend, circle_id).await
    }

    // ==================== Status ====================

    async fn set_status(&self, circle_id: &str, user_id: &str, status: MemberStatus) -> Result<()> {
        let fields = StatusFields::transition(status, self.clock.now());
        let path = member_path(circle_id, user_id);
        if !self.backend.update(&path, status_document(fields)).await? {
            debug!("No member row at {path}; status not written");
        }
        Ok(())
    }

    async fn reset_all_members(&self, circle_id: &str) -> Result<()> {
        let reset = status_document(StatusFields::reset());
        let writes = self
            .backend
            .list(&members_path(circle_id))
            .await?
            .into_iter()
            .map(|(id, _)| Write::Update {
                path: member_path(circle_id, &id),
                fields: reset.clone(),
            })
            .collect();
        self.backend.commit(writes).await?;
        Ok(())
    }

    // ==================== User Circle Index ====================

    async fn add_circle_to_user(&self, user_id: &str, circle_id: &str) -> Result<()> {
        self.backend.commit(vec![index_write(user_id, circle_id)]).await?;
        Ok(())
    }

    async fn remove_circle_from_user(&self, user_id: &str, circle_id: &str) -> Result<()> {
        self.backend
            .array_remove(&user_path(user_id), CIRCLE_INDEX_FIELD, &json!(circle_id))
            .await?;
        Ok(())
    }

    async fn user_circle_ids(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .read_user(user_id)
            .await?
            .map(|user| user.my_circle_ids)
            .unwrap_or_default())
    }

    async fn my_circles(&self, user_id: &str) -> Result<Vec<MyCircleInfo>> {
        let ids = self.user_circle_ids(user_id).await?;
        let backend = &*self.backend;
        let circles = try_join_all(ids.iter().map(|id| read_circle(backend, id))).await?;

        Ok(circles
            .into_iter()
            .flatten()
            .map(|circle| MyCircleInfo {
                name: if circle.name.is_empty() {
                    FALLBACK_CIRCLE_NAME.to_string()
                } else {
                    circle.name
                },
                circle_id: circle.id,
            })
            .collect())
    }

    // ==================== Profiles ====================

    async fn ensure_user(
        &self,
        user_id: &str,
        email: Option<&str>,
        profile: &ProfileUpdate,
    ) -> Result<()> {
        let path = user_path(user_id);
        if self.backend.get(&path).await?.is_some() {
            if !profile.is_empty() {
                self.backend.update(&path, profile_document(profile)).await?;
            }
            return Ok(());
        }

        let mut fresh = UserProfile::default();
        profile.apply_to(&mut fresh);
        let record = UserRecord {
            email: email.unwrap_or_default().to_string(),
            display_name: fresh.display_name,
            phone: fresh.phone,
            city: fresh.city,
            location: fresh.location,
            address: fresh.address,
            my_circle_ids: Vec::new(),
        };
        self.backend.set(&path, encode(&path, &record)?).await?;
        Ok(())
    }

    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.read_user(user_id).await?.map(|user| user.profile()))
    }

    async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.backend
            .merge(&user_path(user_id), profile_document(update))
            .await?;
        Ok(())
    }

    // ==================== Local Accounts ====================

    // Check-then-write: two devices registering the same e-mail at once can
    // both succeed, the later write winning.
    async fn create_account(&self, account: &LocalAccount) -> Result<bool> {
        let path = account_path(&account.email);
        if self.backend.get(&path).await?.is_some() {
            return Ok(false);
        }
        self.backend.set(&path, encode(&path, account)?).await?;
        Ok(true)
    }

    async fn account(&self, email: &str) -> Result<Option<LocalAccount>> {
        let path = account_path(email);
        self.backend
            .get(&path)
            .await?
            .map(|doc| decode(&path, doc))
            .transpose()
    }

    async fn delete_account(&self, email: &str) -> Result<()> {
        self.backend.delete(&account_path(email)).await?;
        Ok(())
    }

    // ==================== Subscriptions ====================

    fn subscribe_members(
        &self,
        circle_id: &str,
        on_members: MembersCallback,
    ) -> Result<Subscription> {
        let backend = Arc::clone(&self.backend);
        let circle_id = circle_id.to_string();
        Subscription::spawn(move |active| {
            follow(backend, active, circle_id, is_member_change, read_members, on_members)
        })
    }

    fn subscribe_circle(&self, circle_id: &str, on_circle: CircleCallback) -> Result<Subscription> {
        let backend = Arc::clone(&self.backend);
        let circle_id = circle_id.to_string();
        Subscription::spawn(move |active| {
            follow(backend, active, circle_id, is_circle_change, read_circle, on_circle)
        })
    }
}

// ==================== Writes ====================

fn member_write(circle_id: &str, member: &Member) -> Result<Write> {
    let path = member_path(circle_id, &member.id);
    Ok(Write::Set {
        doc: encode(&path, &MemberRecord::from_member(member))?,
        path,
    })
}

fn index_write(user_id: &str, circle_id: &str) -> Write {
    Write::ArrayUnion {
        path: user_path(user_id),
        field: CIRCLE_INDEX_FIELD.to_string(),
        value: json!(circle_id),
    }
}

// ==================== Reads ====================

fn read_circle<'a>(
    backend: &'a dyn DocumentBackend,
    circle_id: &'a str,
) -> BoxFuture<'a, Result<Option<Circle>>> {
    async move {
        let path = circle_path(circle_id);
        let Some(doc) = backend.get(&path).await? else {
            return Ok(None);
        };
        let record: CircleRecord = decode(&path, doc)?;
        record.into_circle(circle_id, &path).map(Some)
    }
    .boxed()
}

fn read_members<'a>(
    backend: &'a dyn DocumentBackend,
    circle_id: &'a str,
) -> BoxFuture<'a, Result<Vec<Member>>> {
    async move {
        let collection = members_path(circle_id);
        backend
            .list(&collection)
            .await?
            .into_iter()
            .map(|(id, doc)| {
                let path = format!("{collection}/{id}");
                let record: MemberRecord = decode(&path, doc)?;
                record.into_member(&id, &path)
            })
            .collect()
    }
    .boxed()
}

fn is_member_change(circle_id: &str, path: &str) -> bool {
    child_id(&members_path(circle_id), path).is_some()
}

fn is_circle_change(circle_id: &str, path: &str) -> bool {
    path == circle_path(circle_id)
}

// ==================== Subscription Loop ====================

/// Delivers `read` now and again after each matching change.
///
/// The feed is subscribed before the first read, so no write committed after
/// the subscription started can be missed. A lagging receiver resyncs with a
/// fresh read; a closed feed ends the subscription.
async fn follow<T, D>(
    backend: Arc<dyn DocumentBackend>,
    active: Arc<AtomicBool>,
    circle_id: String,
    matches: fn(&str, &str) -> bool,
    read: for<'a> fn(&'a dyn DocumentBackend, &'a str) -> BoxFuture<'a, Result<T>>,
    mut deliver: D,
) where
    D: FnMut(T) + Send,
{
    let mut feed = backend.watch();

    loop {
        match read(&*backend, &circle_id).await {
            Ok(value) => {
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                deliver(value);
            }
            Err(e) => warn!("Subscription read for circle {circle_id} failed: {e}"),
        }

        if !next_change(&mut feed, &circle_id, matches).await {
            break;
        }
    }
}

/// Waits for the next change touching the watched documents.
///
/// Returns `false` once the feed has closed.
async fn next_change(
    feed: &mut broadcast::Receiver<DocumentChange>,
    circle_id: &str,
    matches: fn(&str, &str) -> bool,
) -> bool {
    loop {
        match feed.recv().await {
            Ok(change) if matches(circle_id, &change.path) => return true,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Subscription for circle {circle_id} lagged by {skipped} changes; resyncing");
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}
