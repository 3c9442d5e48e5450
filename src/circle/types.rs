//! Core types for circle management.
//!
//! This module defines circles (groups of people sharing their safety
//! status), members (registered or phone-only), per-circle summaries and
//! user profiles. Field names serialise in the persisted camelCase layout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of members accepted through add-by-phone.
///
/// The join path does not enforce this cap.
pub const MAX_CIRCLE_MEMBERS: usize = 25;

/// Name given to circles created without one.
pub const DEFAULT_CIRCLE_NAME: &str = "My circle";

/// Name shown for an indexed circle whose record has an empty name.
pub const FALLBACK_CIRCLE_NAME: &str = "Circle";

/// A member's safety status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// No report since joining or since the last reset.
    #[default]
    Unknown,
    /// The member reported they are safe.
    Safe,
    /// The member asked for help.
    Sos,
}

impl MemberStatus {
    /// Converts to string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Safe => "safe",
            Self::Sos => "sos",
        }
    }

    /// Parses from string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "safe" => Some(Self::Safe),
            "sos" => Some(Self::Sos),
            _ => None,
        }
    }

    /// Resolves the status of a stored row.
    ///
    /// Rows written before `status` existed only carry `isSafe`; for those the
    /// status is derived from the flag. Unrecognised values read as `Unknown`.
    #[must_use]
    pub fn from_stored(status: Option<&str>, is_safe: bool) -> Self {
        match status.filter(|s| !s.is_empty()) {
            Some(s) => Self::parse(s).unwrap_or_default(),
            None if is_safe => Self::Safe,
            None => Self::Unknown,
        }
    }
}

/// A circle (group of people who share their safety status).
///
/// The id doubles as the invite code and as the storage key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Circle {
    /// Storage key, equal to the invite code.
    pub id: String,
    /// User-facing name.
    pub name: String,
    /// User id of the creator; authorizes destructive operations.
    pub owner_id: String,
    /// Six-character invite code.
    pub invite_code: String,
    /// When the circle was created.
    pub created_at: DateTime<Utc>,
}

/// A member row inside a circle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Row key: the user id for registered members, a generated id for
    /// phone-only members.
    pub id: String,
    /// Account id, `None` for members added by phone.
    pub user_id: Option<String>,
    /// Display name.
    pub display_name: String,
    /// Phone number, if known.
    pub phone: Option<String>,
    /// Kept equal to `status == Safe` for older readers.
    pub is_safe: bool,
    /// Current safety status.
    pub status: MemberStatus,
    /// Set when entering `Safe`, cleared otherwise.
    pub last_safe_at: Option<DateTime<Utc>>,
    /// When the row was created.
    pub added_at: DateTime<Utc>,
}

impl Member {
    /// Creates a fresh member row with `Unknown` status.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        user_id: Option<String>,
        display_name: impl Into<String>,
        phone: Option<String>,
        added_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id,
            display_name: display_name.into(),
            phone,
            is_safe: false,
            status: MemberStatus::Unknown,
            last_safe_at: None,
            added_at,
        }
    }

    /// Returns whether this member row belongs to the given user.
    #[must_use]
    pub fn is_user(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }
}

/// Per-circle status counts.
///
/// `safe` and `sos` never overlap, so `safe + sos <= total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircleSummary {
    /// Number of member rows.
    pub total: usize,
    /// Members who are safe (and not in SOS).
    pub safe: usize,
    /// Members in SOS.
    pub sos: usize,
}

impl CircleSummary {
    /// Counts a member snapshot.
    ///
    /// A member in SOS is counted as SOS even if a stale `isSafe` flag is set.
    #[must_use]
    pub fn from_members(members: &[Member]) -> Self {
        members.iter().fold(
            Self {
                total: members.len(),
                ..Self::default()
            },
            |mut summary, member| {
                if member.status == MemberStatus::Sos {
                    summary.sos += 1;
                } else if member.status == MemberStatus::Safe || member.is_safe {
                    summary.safe += 1;
                }
                summary
            },
        )
    }

    /// Members who have not reported safe and are not in SOS.
    #[must_use]
    pub const fn unknown(&self) -> usize {
        self.total - self.safe - self.sos
    }
}

/// Result of creating a circle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleCreationResult {
    /// Storage key of the new circle.
    pub circle_id: String,
    /// Code to share with people who should join.
    pub invite_code: String,
}

/// Entry of a user's circle list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MyCircleInfo {
    /// Circle id.
    pub circle_id: String,
    /// Circle name.
    pub name: String,
}

/// A user's profile, independent of circle membership.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Display name.
    pub display_name: String,
    /// Phone number.
    pub phone: String,
    /// City.
    pub city: String,
    /// Free-text location (neighbourhood, building).
    pub location: String,
    /// Street address.
    pub address: String,
}

/// Partial profile update; `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfileUpdate {
    /// New display name.
    pub display_name: Option<String>,
    /// New phone number.
    pub phone: Option<String>,
    /// New city.
    pub city: Option<String>,
    /// New location.
    pub location: Option<String>,
    /// New address.
    pub address: Option<String>,
}

impl ProfileUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Sets the phone number.
    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Sets the city.
    #[must_use]
    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    /// Sets the location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Sets the address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Returns whether no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.phone.is_none()
            && self.city.is_none()
            && self.location.is_none()
            && self.address.is_none()
    }

    /// Applies this update on top of an existing profile.
    pub fn apply_to(&self, profile: &mut UserProfile) {
        let fields = [
            (&self.display_name, &mut profile.display_name),
            (&self.phone, &mut profile.phone),
            (&self.city, &mut profile.city),
            (&self.location, &mut profile.location),
            (&self.address, &mut profile.address),
        ];
        for (update, field) in fields {
            if let Some(value) = update {
                field.clone_from(value);
            }
        }
    }
}

impl From<UserProfile> for ProfileUpdate {
    fn from(profile: UserProfile) -> Self {
        Self {
            display_name: Some(profile.display_name),
            phone: Some(profile.phone),
            city: Some(profile.city),
            location: Some(profile.location),
            address: Some(profile.address),
        }
    }
}

/// Credentials of an account kept by the device-local identity provider.
///
/// Keyed by the lower-cased e-mail. The password is only stored as a salted
/// digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalAccount {
    /// Lower-cased e-mail address.
    pub email: String,
    /// User id issued at sign-up.
    pub user_id: String,
    /// Salted password digest.
    pub password_hash: String,
    /// Display name chosen at sign-up.
    pub display_name: String,
}
