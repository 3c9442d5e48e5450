//! Member safety status transitions.
//!
//! Any status may move to any other; there is no terminal state. The
//! machine's only job is to keep `status`, `isSafe` and `lastSafeAt`
//! consistent: entering `Safe` sets the flag and stamps the time, every
//! other status clears both. Both store implementations write the fields
//! produced here.

use chrono::{DateTime, Utc};

use super::types::{Member, MemberStatus};

/// The three status fields written together on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFields {
    /// New status.
    pub status: MemberStatus,
    /// `true` exactly when `status` is `Safe`.
    pub is_safe: bool,
    /// Transition time when entering `Safe`, `None` otherwise.
    pub last_safe_at: Option<DateTime<Utc>>,
}

impl StatusFields {
    /// Computes the fields for a transition into `status` at `now`.
    #[must_use]
    pub const fn transition(status: MemberStatus, now: DateTime<Utc>) -> Self {
        match status {
            MemberStatus::Safe => Self {
                status,
                is_safe: true,
                last_safe_at: Some(now),
            },
            MemberStatus::Unknown | MemberStatus::Sos => Self {
                status,
                is_safe: false,
                last_safe_at: None,
            },
        }
    }

    /// Fields written by a circle-wide reset.
    #[must_use]
    pub const fn reset() -> Self {
        Self {
            status: MemberStatus::Unknown,
            is_safe: false,
            last_safe_at: None,
        }
    }

    /// Returns whether the three fields agree with each other.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        match self.status {
            MemberStatus::Safe => self.is_safe && self.last_safe_at.is_some(),
            MemberStatus::Unknown | MemberStatus::Sos => {
                !self.is_safe && self.last_safe_at.is_none()
            }
        }
    }
}

impl Member {
    /// Moves this member to `status`, updating the derived fields.
    pub fn apply_status(&mut self, status: MemberStatus, now: DateTime<Utc>) {
        self.apply_fields(StatusFields::transition(status, now));
    }

    /// Writes a precomputed set of status fields.
    pub fn apply_fields(&mut self, fields: StatusFields) {
        self.status = fields.status;
        self.is_safe = fields.is_safe;
        self.last_safe_at = fields.last_safe_at;
    }

    /// Returns the member's current status fields.
    #[must_use]
    pub const fn status_fields(&self) -> StatusFields {
        StatusFields {
            status: self.status,
            is_safe: self.is_safe,
            last_safe_at: self.last_safe_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn fresh() -> Member {
        Member::new("u1", Some("u1".to_string()), "Dana", None, at(0))
    }

    #[test]
    fn entering_safe_sets_flag_and_time() {
        let fields = StatusFields::transition(MemberStatus::Safe, at(100));
        assert!(fields.is_safe);
        assert_eq!(fields.last_safe_at, Some(at(100)));
        assert!(fields.is_consistent());
    }

    #[test]
    fn sos_and_unknown_clear_flag_and_time() {
        for status in [MemberStatus::Sos, MemberStatus::Unknown] {
            let fields = StatusFields::transition(status, at(100));
            assert_eq!(fields.status, status);
            assert!(!fields.is_safe);
            assert!(fields.last_safe_at.is_none());
            assert!(fields.is_consistent());
        }
    }

    #[test]
    fn every_transition_is_allowed() {
        let all = [MemberStatus::Unknown, MemberStatus::Safe, MemberStatus::Sos];
        for from in all {
            for to in all {
                let mut member = fresh();
                member.apply_status(from, at(1));
                member.apply_status(to, at(2));
                assert_eq!(member.status, to);
                assert!(member.status_fields().is_consistent());
            }
        }
    }

    #[test]
    fn safe_again_restamps_time() {
        let mut member = fresh();
        member.apply_status(MemberStatus::Safe, at(10));
        member.apply_status(MemberStatus::Safe, at(20));
        assert_eq!(member.last_safe_at, Some(at(20)));
    }

    #[test]
    fn reset_matches_unknown_transition() {
        assert_eq!(
            StatusFields::reset(),
            StatusFields::transition(MemberStatus::Unknown, at(5))
        );
    }

    #[test]
    fn inconsistent_fields_are_detected() {
        let fields = StatusFields {
            status: MemberStatus::Sos,
            is_safe: true,
            last_safe_at: None,
        };
        assert!(!fields.is_consistent());
    }
}
