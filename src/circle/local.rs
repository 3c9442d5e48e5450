//! `SQLite` store for single-device use.
//!
//! [`LocalStore`] keeps circles, members and users in a local database and
//! has exactly one writer: this process. There is no push channel, so
//! subscriptions poll: each subscriber re-reads on a fixed interval
//! (3 seconds by default) starting immediately, and the callback fires on
//! the first tick and whenever the snapshot differs from the last one
//! delivered. Readers are therefore eventually consistent within one
//! polling interval.

// SQLite operations need to hold the lock for the duration of the operation.
// Dropping the guard earlier would require restructuring all methods.
#![allow(clippy::significant_drop_tightening)]

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::time::MissedTickBehavior;

use super::error::{CircleError, Result};
use super::invite::{normalize_code, CodeGenerator, RandomCodeGenerator};
use super::status::StatusFields;
use super::store::{phone_member_id, CircleCallback, CircleStore, MembersCallback, Subscription};
use super::types::{
    Circle, CircleCreationResult, LocalAccount, Member, MemberStatus, MyCircleInfo, ProfileUpdate,
    UserProfile, FALLBACK_CIRCLE_NAME, MAX_CIRCLE_MEMBERS,
};
use crate::clock::{Clock, SystemClock};
use crate::config::DEFAULT_POLL_INTERVAL;
use crate::validation::normalize_phone;

/// `SQLite`-backed circle store with polled subscriptions.
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    codes: Arc<dyn CodeGenerator>,
    poll_interval: Duration,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Opens (or creates) the store at the given path.
    ///
    /// Creates the database file and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
            codes: Arc::new(RandomCodeGenerator),
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        store.initialize_schema()?;
        Ok(store)
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

    /// Sets the polling interval of subscriptions.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Returns the polling interval of subscriptions.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Initializes the database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = lock(&self.conn)?;

        conn.execute_batch(
            r"
            -- Circles, keyed by invite code
            CREATE TABLE IF NOT EXISTS circles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                invite_code TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            -- Member rows (registered and phone-only)
            CREATE TABLE IF NOT EXISTS members (
                circle_id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                user_id TEXT,
                display_name TEXT NOT NULL,
                phone TEXT,
                is_safe INTEGER NOT NULL DEFAULT 0,
                status TEXT,
                last_safe_at INTEGER,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (circle_id, member_id)
            );

            -- Profiles and the per-user circle index
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL DEFAULT '',
                display_name TEXT NOT NULL DEFAULT '',
                phone TEXT NOT NULL DEFAULT '',
                city TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL DEFAULT '',
                address TEXT NOT NULL DEFAULT '',
                circle_ids TEXT NOT NULL DEFAULT '[]'
            );

            -- Device-local sign-in credentials
            CREATE TABLE IF NOT EXISTS accounts (
                email TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                display_name TEXT NOT NULL DEFAULT ''
            );
            ",
        )?;

        Ok(())
    }

    /// Spawns a poller that delivers `read`'s result now and on change.
    fn spawn_poller<T, R, D>(&self, read: R, mut deliver: D) -> Result<Subscription>
    where
        T: PartialEq + Clone + Send + 'static,
        R: Fn(&Connection) -> Result<T> + Send + 'static,
        D: FnMut(T) + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let period = self.poll_interval;

        Subscription::spawn(move |active| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<T> = None;

            loop {
                ticker.tick().await;
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                let snapshot = poll_once(&conn, &read);
                match snapshot {
                    Ok(value) => {
                        if last.as_ref() == Some(&value) {
                            continue;
                        }
                        last = Some(value.clone());
                        deliver(value);
                    }
                    Err(e) => warn!("Local poll failed, retrying next tick: {e}"),
                }
            }
        })
    }
}

#[async_trait]
impl CircleStore for LocalStore {
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

        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;

        // Unconditional write: an existing circle at this code is replaced.
        tx.execute(
            r"
            INSERT INTO circles (id, name, owner_id, invite_code, created_at)
            VALUES (?1, ?2, ?3, ?1, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                owner_id = excluded.owner_id,
                invite_code = excluded.invite_code,
                created_at = excluded.created_at
            ",
            params![&invite_code, name, owner_id, now.timestamp_millis()],
        )?;

        let owner = Member::new(
            owner_id,
            Some(owner_id.to_string()),
            owner_name,
            owner_phone.map(str::to_string),
            now,
        );
        write_member(&tx, &invite_code, &owner)?;
        index_add(&tx, owner_id, &invite_code)?;
        tx.commit()?;

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
        let now = self.clock.now();

        let mut conn = lock(&self.conn)?;
        if read_circle(&conn, &code)?.is_none() {
            return Ok(None);
        }

        let tx = conn.transaction()?;
        let member = Member::new(
            user_id,
            Some(user_id.to_string()),
            display_name,
            phone.map(str::to_string),
            now,
        );
        write_member(&tx, &code, &member)?;
        index_add(&tx, user_id, &code)?;
        tx.commit()?;

        debug!("User joined circle {code}");
        Ok(Some(code))
    }

    async fn circle_by_code(&self, invite_code: &str) -> Result<Option<Circle>> {
        let conn = lock(&self.conn)?;
        read_circle(&conn, &normalize_code(invite_code))
    }

    async fn circle_owner(&self, circle_id: &str) -> Result<Option<String>> {
        let conn = lock(&self.conn)?;
        Ok(read_circle(&conn, circle_id)?.map(|c| c.owner_id))
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
        let now = self.clock.now();

        let conn = lock(&self.conn)?;
        let existing = read_members(&conn, circle_id)?;
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

        let member = Member::new(
            phone_member_id(now.timestamp_millis()),
            None,
            display_name,
            Some(normalized),
            now,
        );
        write_member(&conn, circle_id, &member)?;
        Ok(())
    }

    async fn remove_member(
        &self,
        circle_id: &str,
        member_id: &str,
        requester_id: &str,
    ) -> Result<()> {
        let conn = lock(&self.conn)?;
        let Some(circle) = read_circle(&conn, circle_id)? else {
            return Ok(());
        };
        if circle.owner_id != requester_id {
            return Err(CircleError::Unauthorized(
                "Only the circle owner can remove members".to_string(),
            ));
        }

        let target: Option<Option<String>> = conn
            .query_row(
                "SELECT user_id FROM members WHERE circle_id = ?1 AND member_id = ?2",
                params![circle_id, member_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(target_user) = target else {
            return Ok(());
        };
        if target_user.as_deref() == Some(circle.owner_id.as_str()) {
            return Err(CircleError::SelfRemoval);
        }

        conn.execute(
            "DELETE FROM members WHERE circle_id = ?1 AND member_id = ?2",
            params![circle_id, member_id],
        )?;
        info!("Removed member {member_id} from circle {circle_id}");
        Ok(())
    }

    async fn members(&self, circle_id: &str) -> Result<Vec<Member>> {
        let conn = lock(&self.conn)?;
        read_members(&conn, circle_id)
    }

    // ==================== Status ====================

    async fn set_status(&self, circle_id: &str, user_id: &str, status: MemberStatus) -> Result<()> {
        let fields = StatusFields::transition(status, self.clock.now());
        let conn = lock(&self.conn)?;
        let updated = conn.execute(
            r"
            UPDATE members SET status = ?3, is_safe = ?4, last_safe_at = ?5
            WHERE circle_id = ?1 AND member_id = ?2
            ",
            params![
                circle_id,
                user_id,
                fields.status.as_str(),
                fields.is_safe,
                fields.last_safe_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        if updated == 0 {
            debug!("No member row for {user_id} in {circle_id}; status not written");
        }
        Ok(())
    }

    async fn reset_all_members(&self, circle_id: &str) -> Result<()> {
        let fields = StatusFields::reset();
        let conn = lock(&self.conn)?;
        conn.execute(
            r"
            UPDATE members SET status = ?2, is_safe = ?3, last_safe_at = NULL
            WHERE circle_id = ?1
            ",
            params![circle_id, fields.status.as_str(), fields.is_safe],
        )?;
        Ok(())
    }

    // ==================== User Circle Index ====================

    async fn add_circle_to_user(&self, user_id: &str, circle_id: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        index_add(&conn, user_id, circle_id)
    }

    async fn remove_circle_from_user(&self, user_id: &str, circle_id: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        let Some(ids) = read_index(&conn, user_id)? else {
            return Ok(());
        };
        let next: Vec<String> = ids.iter().filter(|id| *id != circle_id).cloned().collect();
        if next.len() == ids.len() {
            return Ok(());
        }
        write_index(&conn, user_id, &next)
    }

    async fn user_circle_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = lock(&self.conn)?;
        Ok(read_index(&conn, user_id)?.unwrap_or_default())
    }

    async fn my_circles(&self, user_id: &str) -> Result<Vec<MyCircleInfo>> {
        let conn = lock(&self.conn)?;
        let ids = read_index(&conn, user_id)?.unwrap_or_default();

        let mut result = Vec::with_capacity(ids.len());
        for circle_id in ids {
            if let Some(circle) = read_circle(&conn, &circle_id)? {
                let name = if circle.name.is_empty() {
                    FALLBACK_CIRCLE_NAME.to_string()
                } else {
                    circle.name
                };
                result.push(MyCircleInfo { circle_id, name });
            }
        }
        Ok(result)
    }

    // ==================== Profiles ====================

    async fn ensure_user(
        &self,
        user_id: &str,
        email: Option<&str>,
        profile: &ProfileUpdate,
    ) -> Result<()> {
        let conn = lock(&self.conn)?;
        let mut current = match read_profile(&conn, user_id)? {
            Some(current) => current,
            None => {
                conn.execute(
                    "INSERT INTO users (user_id, email) VALUES (?1, ?2)",
                    params![user_id, email.unwrap_or_default()],
                )?;
                UserProfile::default()
            }
        };
        if profile.is_empty() {
            return Ok(());
        }
        profile.apply_to(&mut current);
        write_profile(&conn, user_id, &current)
    }

    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let conn = lock(&self.conn)?;
        read_profile(&conn, user_id)
    }

    async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<()> {
        let conn = lock(&self.conn)?;
        let mut current = read_profile(&conn, user_id)?.unwrap_or_default();
        update.apply_to(&mut current);
        write_profile(&conn, user_id, &current)
    }

    // ==================== Local Accounts ====================

    async fn create_account(&self, account: &LocalAccount) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let inserted = conn.execute(
            r"
            INSERT INTO accounts (email, user_id, password_hash, display_name)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(email) DO NOTHING
            ",
            params![
                &account.email,
                &account.user_id,
                &account.password_hash,
                &account.display_name,
            ],
        )?;
        Ok(inserted == 1)
    }

    async fn account(&self, email: &str) -> Result<Option<LocalAccount>> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                r"
                SELECT email, user_id, password_hash, display_name
                FROM accounts
                WHERE email = ?1
                ",
                params![email],
                |row| {
                    Ok(LocalAccount {
                        email: row.get(0)?,
                        user_id: row.get(1)?,
                        password_hash: row.get(2)?,
                        display_name: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    async fn delete_account(&self, email: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute("DELETE FROM accounts WHERE email = ?1", params![email])?;
        Ok(())
    }

    // ==================== Subscriptions ====================

    fn subscribe_members(
        &self,
        circle_id: &str,
        on_members: MembersCallback,
    ) -> Result<Subscription> {
        let circle_id = circle_id.to_string();
        self.spawn_poller(move |conn| read_members(conn, &circle_id), on_members)
    }

    fn subscribe_circle(&self, circle_id: &str, on_circle: CircleCallback) -> Result<Subscription> {
        let circle_id = circle_id.to_string();
        self.spawn_poller(move |conn| read_circle(conn, &circle_id), on_circle)
    }
}

// ==================== Row Helpers ====================

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| CircleError::Storage(format!("Failed to acquire database lock: {e}")))
}

fn poll_once<T, R>(conn: &Mutex<Connection>, read: &R) -> Result<T>
where
    R: Fn(&Connection) -> Result<T>,
{
    let conn = lock(conn)?;
    read(&conn)
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| CircleError::InvalidData(format!("Invalid timestamp: {millis}")))
}

fn read_circle(conn: &Connection, circle_id: &str) -> Result<Option<Circle>> {
    let row = conn
        .query_row(
            r"
            SELECT id, name, owner_id, invite_code, created_at
            FROM circles
            WHERE id = ?1
            ",
            params![circle_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    row.map(|(id, name, owner_id, invite_code, created_at)| {
        Ok(Circle {
            id,
            name,
            owner_id,
            invite_code,
            created_at: from_millis(created_at)?,
        })
    })
    .transpose()
}

fn read_members(conn: &Connection, circle_id: &str) -> Result<Vec<Member>> {
    let mut stmt = conn.prepare(
        r"
        SELECT member_id, user_id, display_name, phone, is_safe, status, last_safe_at, added_at
        FROM members
        WHERE circle_id = ?1
        ORDER BY member_id
        ",
    )?;

    let rows = stmt
        .query_map(params![circle_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(id, user_id, display_name, phone, is_safe, status, last_safe_at, added_at)| {
                Ok(Member {
                    id,
                    user_id,
                    display_name,
                    phone,
                    is_safe,
                    status: MemberStatus::from_stored(status.as_deref(), is_safe),
                    last_safe_at: last_safe_at.map(from_millis).transpose()?,
                    added_at: from_millis(added_at)?,
                })
            },
        )
        .collect()
}

/// Inserts or overwrites a member row.
fn write_member(conn: &Connection, circle_id: &str, member: &Member) -> Result<()> {
    conn.execute(
        r"
        INSERT OR REPLACE INTO members
            (circle_id, member_id, user_id, display_name, phone, is_safe, status, last_safe_at, added_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ",
        params![
            circle_id,
            &member.id,
            &member.user_id,
            &member.display_name,
            &member.phone,
            member.is_safe,
            member.status.as_str(),
            member.last_safe_at.map(|t| t.timestamp_millis()),
            member.added_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

/// Returns the user's circle ids, or `None` if the user has no record.
fn read_index(conn: &Connection, user_id: &str) -> Result<Option<Vec<String>>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT circle_ids FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;

    json.map(|json| {
        serde_json::from_str(&json)
            .map_err(|e| CircleError::InvalidData(format!("Invalid circle index JSON: {e}")))
    })
    .transpose()
}

fn write_index(conn: &Connection, user_id: &str, ids: &[String]) -> Result<()> {
    let json = serde_json::to_string(ids)
        .map_err(|e| CircleError::Storage(format!("Failed to serialize circle index: {e}")))?;
    conn.execute(
        r"
        INSERT INTO users (user_id, circle_ids) VALUES (?1, ?2)
        ON CONFLICT(user_id) DO UPDATE SET circle_ids = excluded.circle_ids
        ",
        params![user_id, &json],
    )?;
    Ok(())
}

fn index_add(conn: &Connection, user_id: &str, circle_id: &str) -> Result<()> {
    let mut ids = read_index(conn, user_id)?.unwrap_or_default();
    if ids.iter().any(|id| id == circle_id) {
        return Ok(());
    }
    ids.push(circle_id.to_string());
    write_index(conn, user_id, &ids)
}

fn read_profile(conn: &Connection, user_id: &str) -> Result<Option<UserProfile>> {
    Ok(conn
        .query_row(
            r"
            SELECT display_name, phone, city, location, address
            FROM users
            WHERE user_id = ?1
            ",
            params![user_id],
            |row| {
                Ok(UserProfile {
                    display_name: row.get(0)?,
                    phone: row.get(1)?,
                    city: row.get(2)?,
                    location: row.get(3)?,
                    address: row.get(4)?,
                })
            },
        )
        .optional()?)
}

fn write_profile(conn: &Connection, user_id: &str, profile: &UserProfile) -> Result<()> {
    conn.execute(
        r"
        INSERT INTO users (user_id, display_name, phone, city, location, address)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(user_id) DO UPDATE SET
            display_name = excluded.display_name,
            phone = excluded.phone,
            city = excluded.city,
            location = excluded.location,
            address = excluded.address
        ",
        params![
            user_id,
            &profile.display_name,
            &profile.phone,
            &profile.city,
            &profile.location,
            &profile.address,
        ],
    )?;
    Ok(())
}
