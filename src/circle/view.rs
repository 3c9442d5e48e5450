//! Search, filter and sort of a member snapshot for display.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::types::{Member, MemberStatus};

/// Member list ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberSortMode {
    /// SOS first, then members not yet safe, then by name.
    #[default]
    Status,
    /// By display name.
    Name,
    /// Most recent `lastSafeAt` first; members never safe last.
    Time,
}

/// Member list filter, by the `isSafe` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberFilter {
    /// Everyone.
    #[default]
    All,
    /// Only members marked safe.
    Safe,
    /// Only members not marked safe.
    Unsafe,
}

impl MemberFilter {
    const fn accepts(self, member: &Member) -> bool {
        match self {
            Self::All => true,
            Self::Safe => member.is_safe,
            Self::Unsafe => !member.is_safe,
        }
    }
}

/// A display query over a member snapshot.
///
/// The viewing user's own row always sorts first when it passes the filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberQuery {
    /// Case-insensitive substring of the display name; blank matches all.
    pub search: String,
    /// Filter to apply.
    pub filter: MemberFilter,
    /// Ordering to apply.
    pub sort: MemberSortMode,
    /// User id of the viewer.
    pub viewer_id: Option<String>,
}

impl MemberQuery {
    /// Creates a query that lists everyone by status.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the search text.
    #[must_use]
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = search.into();
        self
    }

    /// Sets the filter.
    #[must_use]
    pub const fn with_filter(mut self, filter: MemberFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub const fn with_sort(mut self, sort: MemberSortMode) -> Self {
        self.sort = sort;
        self
    }

    /// Sets the viewing user.
    #[must_use]
    pub fn with_viewer(mut self, viewer_id: impl Into<String>) -> Self {
        self.viewer_id = Some(viewer_id.into());
        self
    }

    /// Applies the query to a snapshot.
    #[must_use]
    pub fn apply(&self, members: &[Member]) -> Vec<Member> {
        let needle = self.search.trim().to_lowercase();
        let mut result: Vec<Member> = members
            .iter()
            .filter(|m| needle.is_empty() || m.display_name.to_lowercase().contains(&needle))
            .filter(|m| self.filter.accepts(m))
            .cloned()
            .collect();

        let viewer = self.viewer_id.as_deref();
        let is_viewer = |m: &Member| viewer.is_some_and(|v| m.is_user(v));
        result.sort_by(|a, b| {
            is_viewer(b)
                .cmp(&is_viewer(a))
                .then_with(|| self.compare(a, b))
        });
        result
    }

    fn compare(&self, a: &Member, b: &Member) -> Ordering {
        match self.sort {
            MemberSortMode::Status => {
                let sos = |m: &Member| m.status == MemberStatus::Sos;
                sos(b)
                    .cmp(&sos(a))
                    .then_with(|| a.is_safe.cmp(&b.is_safe))
                    .then_with(|| compare_names(a, b))
            }
            MemberSortMode::Name => compare_names(a, b),
            MemberSortMode::Time => b.last_safe_at.cmp(&a.last_safe_at),
        }
    }
}

fn compare_names(a: &Member, b: &Member) -> Ordering {
    a.display_name
        .to_lowercase()
        .cmp(&b.display_name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn member(id: &str, name: &str, status: MemberStatus, safe_at: i64) -> Member {
        let mut m = Member::new(id, Some(id.to_string()), name, None, at(0));
        m.apply_status(status, at(safe_at));
        m
    }

    fn snapshot() -> Vec<Member> {
        vec![
            member("a", "Avi", MemberStatus::Safe, 10),
            member("b", "bella", MemberStatus::Unknown, 0),
            member("c", "Carmel", MemberStatus::Sos, 0),
            member("d", "Dana", MemberStatus::Safe, 30),
        ]
    }

    fn ids(members: &[Member]) -> Vec<&str> {
        members.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn status_sort_puts_sos_then_unsafe_then_name() {
        let result = MemberQuery::new().apply(&snapshot());
        assert_eq!(ids(&result), vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn viewer_is_always_first() {
        let result = MemberQuery::new().with_viewer("d").apply(&snapshot());
        assert_eq!(ids(&result), vec!["d", "c", "b", "a"]);
    }

    #[test]
    fn name_sort_is_case_insensitive() {
        let result = MemberQuery::new()
            .with_sort(MemberSortMode::Name)
            .apply(&snapshot());
        assert_eq!(ids(&result), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn time_sort_latest_safe_first() {
        let result = MemberQuery::new()
            .with_sort(MemberSortMode::Time)
            .apply(&snapshot());
        assert_eq!(&ids(&result)[..2], &["d", "a"]);
    }

    #[test]
    fn filters_by_safe_flag() {
        let safe = MemberQuery::new()
            .with_filter(MemberFilter::Safe)
            .apply(&snapshot());
        assert_eq!(ids(&safe), vec!["a", "d"]);

        let unsafe_members = MemberQuery::new()
            .with_filter(MemberFilter::Unsafe)
            .apply(&snapshot());
        assert_eq!(ids(&unsafe_members), vec!["c", "b"]);
    }

    #[test]
    fn search_matches_substring_ignoring_case() {
        let result = MemberQuery::new().with_search("  ARM ").apply(&snapshot());
        assert_eq!(ids(&result), vec!["c"]);

        let everyone = MemberQuery::new().with_search("   ").apply(&snapshot());
        assert_eq!(everyone.len(), 4);
    }
}
