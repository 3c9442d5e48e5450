//! The persistence and live-subscription contract for circles.
//!
//! [`CircleStore`] is implemented by [`RemoteStore`] (push-based,
//! authoritative, many writers) and [`LocalStore`] (single device, polled).
//! Both must honour the same contract; the sync engine never branches on
//! which one is active.
//!
//! # Consistency
//!
//! Remote subscriptions observe every write in server order, including
//! writes from other devices. Local subscriptions re-read on a fixed
//! interval, so a write may stay invisible to a subscriber for up to one
//! polling interval.
//!
//! # Known races
//!
//! The capacity and duplicate-phone checks of
//! [`add_member_by_phone`](CircleStore::add_member_by_phone) are
//! read-then-write without a transaction. Two concurrent adds at the cap can
//! both pass and leave the circle above [`MAX_CIRCLE_MEMBERS`].
//!
//! [`RemoteStore`]: super::remote::RemoteStore
//! [`LocalStore`]: super::local::LocalStore
//! [`MAX_CIRCLE_MEMBERS`]: super::types::MAX_CIRCLE_MEMBERS

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::AbortHandle;

use super::error::{CircleError, Result};
use super::types::{
    Circle, CircleCreationResult, CircleSummary, LocalAccount, Member, MemberStatus, MyCircleInfo,
    ProfileUpdate, UserProfile,
};

/// Callback receiving the full member list of a circle.
pub type MembersCallback = Box<dyn FnMut(Vec<Member>) + Send + 'static>;

/// Callback receiving the circle record, or `None` if it does not exist.
pub type CircleCallback = Box<dyn FnMut(Option<Circle>) + Send + 'static>;

/// Persistence and live-subscription contract shared by every backend.
#[async_trait]
pub trait CircleStore: Send + Sync {
    // ==================== Circle Lifecycle ====================

    /// Creates a circle owned by `owner_id` and writes the owner as its first
    /// member.
    ///
    /// The invite code is not checked against existing circles; the circle
    /// record at that key is overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn create_circle(
        &self,
        owner_id: &str,
        owner_name: &str,
        name: &str,
        owner_phone: Option<&str>,
    ) -> Result<CircleCreationResult>;

    /// Joins the circle named by `invite_code` (case-insensitive).
    ///
    /// Returns `Ok(None)` when no such circle exists. Re-joining overwrites
    /// the user's previous row, resetting their status. The member cap is not
    /// enforced here.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read or write fails.
    async fn join_circle(
        &self,
        invite_code: &str,
        user_id: &str,
        display_name: &str,
        phone: Option<&str>,
    ) -> Result<Option<String>>;

    /// Looks up a circle by invite code (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn circle_by_code(&self, invite_code: &str) -> Result<Option<Circle>>;

    /// Returns the owner of a circle, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn circle_owner(&self, circle_id: &str) -> Result<Option<String>>;

    // ==================== Member Management ====================

    /// Adds a phone-only member (no account).
    ///
    /// # Errors
    ///
    /// - [`CircleError::CapacityReached`] if the circle already has 25 members
    /// - [`CircleError::DuplicatePhone`] if a member has the same phone digits
    /// - [`CircleError::Validation`] if the phone has no digits
    async fn add_member_by_phone(
        &self,
        circle_id: &str,
        display_name: &str,
        phone: &str,
    ) -> Result<()>;

    /// Removes a member row on behalf of `requester_id`.
    ///
    /// Does nothing if the circle or the member does not exist.
    ///
    /// # Errors
    ///
    /// - [`CircleError::Unauthorized`] unless the requester owns the circle
    /// - [`CircleError::SelfRemoval`] if the target is the owner's own row
    async fn remove_member(&self, circle_id: &str, member_id: &str, requester_id: &str)
        -> Result<()>;

    /// Reads the current member list, ordered by member id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn members(&self, circle_id: &str) -> Result<Vec<Member>>;

    // ==================== Status ====================

    /// Moves the user's row in the circle to `status`.
    ///
    /// Does nothing if the user has no row in the circle.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn set_status(&self, circle_id: &str, user_id: &str, status: MemberStatus) -> Result<()>;

    /// Resets every member of the circle to `Unknown`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn reset_all_members(&self, circle_id: &str) -> Result<()>;

    /// Counts members by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn summary(&self, circle_id: &str) -> Result<CircleSummary> {
        Ok(CircleSummary::from_members(&self.members(circle_id).await?))
    }

    // ==================== User Circle Index ====================

    /// Adds a circle to the user's index. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn add_circle_to_user(&self, user_id: &str, circle_id: &str) -> Result<()>;

    /// Removes a circle from the user's index ("leave").
    ///
    /// The member row stays in the circle until the owner removes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn remove_circle_from_user(&self, user_id: &str, circle_id: &str) -> Result<()>;

    /// Returns the ids in the user's index, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn user_circle_ids(&self, user_id: &str) -> Result<Vec<String>>;

    /// Lists the user's circles with their names.
    ///
    /// Indexed circles whose record no longer exists are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn my_circles(&self, user_id: &str) -> Result<Vec<MyCircleInfo>>;

    // ==================== Profiles ====================

    /// Creates the user record if missing, otherwise patches the given fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn ensure_user(&self, user_id: &str, email: Option<&str>, profile: &ProfileUpdate)
        -> Result<()>;

    /// Reads a user's profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    /// Applies a partial profile update, creating the record if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<()>;

    // ==================== Local Accounts ====================

    /// Stores a device-local account unless one exists for its e-mail.
    ///
    /// Returns `false` without writing if the e-mail is taken.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn create_account(&self, account: &LocalAccount) -> Result<bool>;

    /// Reads the account registered under a lower-cased e-mail.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn account(&self, email: &str) -> Result<Option<LocalAccount>>;

    /// Deletes the account registered under a lower-cased e-mail.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn delete_account(&self, email: &str) -> Result<()>;

    // ==================== Subscriptions ====================

    /// Delivers the circle's member list now and after every change.
    ///
    /// # Errors
    ///
    /// Returns [`CircleError::Storage`] when called outside a Tokio runtime.
    fn subscribe_members(&self, circle_id: &str, on_members: MembersCallback)
        -> Result<Subscription>;

    /// Delivers the circle record now and after every change.
    ///
    /// # Errors
    ///
    /// Returns [`CircleError::Storage`] when called outside a Tokio runtime.
    fn subscribe_circle(&self, circle_id: &str, on_circle: CircleCallback) -> Result<Subscription>;
}

/// Handle to a live subscription.
///
/// [`cancel`](Self::cancel) stops further callbacks and is idempotent.
/// Dropping the handle cancels the subscription.
#[must_use = "dropping a Subscription cancels it"]
#[derive(Debug)]
pub struct Subscription {
    active: Arc<AtomicBool>,
    task: AbortHandle,
}

impl Subscription {
    /// Spawns `task` on the current runtime as a subscription.
    ///
    /// The task receives a flag that turns `false` once the subscription is
    /// cancelled; it must check the flag before each callback.
    pub(crate) fn spawn<F, Fut>(task: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CircleError::Storage(format!("Subscriptions need a Tokio runtime: {e}")))?;
        let active = Arc::new(AtomicBool::new(true));
        let handle = runtime.spawn(task(Arc::clone(&active)));
        Ok(Self {
            active,
            task: handle.abort_handle(),
        })
    }

    /// Stops the subscription. Safe to call more than once.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.task.abort();
    }

    /// Returns whether the subscription is still delivering.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Generates the row key of a phone-only member: `phone_<millis>_<7 base36>`.
pub(crate) fn phone_member_id(now_millis: i64) -> String {
    const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..7)
        .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
        .collect();
    format!("phone_{now_millis}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_member_id_shape() {
        let id = phone_member_id(1_700_000_000_000);
        let parts: Vec<_> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "phone");
        assert_eq!(parts[1], "1700000000000");
        assert_eq!(parts[2].len(), 7);
        assert!(parts[2].bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn subscription_outside_runtime_fails() {
        let result = Subscription::spawn(|_active| async {});
        assert!(matches!(result, Err(CircleError::Storage(_))));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let subscription = Subscription::spawn(|_active| async {
            std::future::pending::<()>().await;
        })
        .unwrap();
        assert!(subscription.is_active());

        subscription.cancel();
        subscription.cancel();
        assert!(!subscription.is_active());
    }

    #[tokio::test]
    async fn cancel_flips_the_task_flag() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let subscription = Subscription::spawn(|active| async move {
            let _ = tx.send(active);
            std::future::pending::<()>().await;
        })
        .unwrap();

        let flag = rx.await.unwrap();
        assert!(flag.load(Ordering::SeqCst));
        drop(subscription);
        assert!(!flag.load(Ordering::SeqCst));
    }
}
