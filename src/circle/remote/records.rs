//! Persisted document layouts and their conversion to domain types.
//!
//! Timestamps are stored as Unix milliseconds. Member documents written by
//! older clients may lack `status`; those resolve through `isSafe`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::backend::{BackendError, Document};
use crate::circle::error::Result;
use crate::circle::status::StatusFields;
use crate::circle::types::{Circle, Member, MemberStatus, ProfileUpdate, UserProfile};

pub(crate) const CIRCLES: &str = "circles";
pub(crate) const MEMBERS: &str = "members";
pub(crate) const USERS: &str = "users";
pub(crate) const ACCOUNTS: &str = "accounts";

/// Field holding a user's circle index.
pub(crate) const CIRCLE_INDEX_FIELD: &str = "myCircleIds";

pub(crate) fn circle_path(circle_id: &str) -> String {
    format!("{CIRCLES}/{circle_id}")
}

pub(crate) fn members_path(circle_id: &str) -> String {
    format!("{CIRCLES}/{circle_id}/{MEMBERS}")
}

pub(crate) fn member_path(circle_id: &str, member_id: &str) -> String {
    format!("{CIRCLES}/{circle_id}/{MEMBERS}/{member_id}")
}

pub(crate) fn user_path(user_id: &str) -> String {
    format!("{USERS}/{user_id}")
}

pub(crate) fn account_path(email: &str) -> String {
    format!("{ACCOUNTS}/{email}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CircleRecord {
    #[serde(default)]
    pub name: String,
    pub owner_id: String,
    #[serde(default)]
    pub invite_code: String,
    #[serde(default)]
    pub created_at: i64,
}

impl CircleRecord {
    pub fn into_circle(self, id: &str, path: &str) -> Result<Circle> {
        Ok(Circle {
            id: id.to_string(),
            name: self.name,
            owner_id: self.owner_id,
            invite_code: self.invite_code,
            created_at: from_millis(path, self.created_at)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MemberRecord {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub is_safe: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_safe_at: Option<i64>,
    #[serde(default)]
    pub added_at: i64,
}

impl MemberRecord {
    pub fn from_member(member: &Member) -> Self {
        Self {
            user_id: member.user_id.clone(),
            display_name: member.display_name.clone(),
            phone: member.phone.clone(),
            is_safe: member.is_safe,
            status: Some(member.status.as_str().to_string()),
            last_safe_at: member.last_safe_at.map(|t| t.timestamp_millis()),
            added_at: member.added_at.timestamp_millis(),
        }
    }

    pub fn into_member(self, id: &str, path: &str) -> Result<Member> {
        Ok(Member {
            id: id.to_string(),
            status: MemberStatus::from_stored(self.status.as_deref(), self.is_safe),
            user_id: self.user_id,
            display_name: self.display_name,
            phone: self.phone,
            is_safe: self.is_safe,
            last_safe_at: self
                .last_safe_at
                .map(|ms| from_millis(path, ms))
                .transpose()?,
            added_at: from_millis(path, self.added_at)?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct UserRecord {
    pub email: String,
    pub display_name: String,
    pub phone: String,
    pub city: String,
    pub location: String,
    pub address: String,
    pub my_circle_ids: Vec<String>,
}

impl UserRecord {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            display_name: self.display_name.clone(),
            phone: self.phone.clone(),
            city: self.city.clone(),
            location: self.location.clone(),
            address: self.address.clone(),
        }
    }
}

/// Fields written by a status transition.
pub(crate) fn status_document(fields: StatusFields) -> Document {
    object(json!({
        "status": fields.status.as_str(),
        "isSafe": fields.is_safe,
        "lastSafeAt": fields.last_safe_at.map(|t| t.timestamp_millis()),
    }))
}

/// Only the fields set in `update`.
pub(crate) fn profile_document(update: &ProfileUpdate) -> Document {
    [
        ("displayName", &update.display_name),
        ("phone", &update.phone),
        ("city", &update.city),
        ("location", &update.location),
        ("address", &update.address),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.clone().map(|v| (key.to_string(), Value::String(v))))
    .collect()
}

pub(crate) fn encode<T: Serialize>(path: &str, record: &T) -> Result<Document> {
    match serde_json::to_value(record) {
        Ok(Value::Object(doc)) => Ok(doc),
        Ok(_) => Err(malformed(path, "record is not an object").into()),
        Err(e) => Err(malformed(path, &e.to_string()).into()),
    }
}

pub(crate) fn decode<T: DeserializeOwned>(path: &str, doc: Document) -> Result<T> {
    serde_json::from_value(Value::Object(doc)).map_err(|e| malformed(path, &e.to_string()).into())
}

fn object(value: Value) -> Document {
    match value {
        Value::Object(doc) => doc,
        _ => Document::new(),
    }
}

fn from_millis(path: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| malformed(path, &format!("invalid timestamp {millis}")).into())
}

fn malformed(path: &str, reason: &str) -> BackendError {
    BackendError::Malformed {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
