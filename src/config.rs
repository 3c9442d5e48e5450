//! Process-wide configuration.
//!
//! The backend is chosen once at startup and never switched at runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circle::{CircleError, Result};

/// Default polling interval of local subscriptions.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// File name of the local database inside the data directory.
pub const DATABASE_FILE: &str = "circles.db";

/// Explicit backend selection (`remote` or `local`).
pub const ENV_BACKEND: &str = "SAFE_CIRCLE_BACKEND";
/// Remote API key; its presence selects the remote backend.
pub const ENV_REMOTE_API_KEY: &str = "SAFE_CIRCLE_REMOTE_API_KEY";
/// Data directory of the local backend.
pub const ENV_DATA_DIR: &str = "SAFE_CIRCLE_DATA_DIR";
/// Polling interval of local subscriptions, in milliseconds.
pub const ENV_POLL_INTERVAL_MS: &str = "SAFE_CIRCLE_POLL_INTERVAL_MS";

/// Which circle store backs the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Shared document backend with push subscriptions.
    Remote,
    /// Device-local `SQLite` database with polled subscriptions.
    #[default]
    Local,
}

impl Backend {
    /// Converts to string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }

    /// Parses from string representation (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" => Some(Self::Remote),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

/// Configuration of the circle sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Active backend.
    pub backend: Backend,
    /// Polling interval of local subscriptions, in milliseconds.
    pub poll_interval_ms: u64,
    /// Directory holding the local database.
    pub data_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            poll_interval_ms: 3_000,
            data_dir: PathBuf::from("safe-circle-data"),
        }
    }
}

impl SyncConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the backend.
    #[must_use]
    pub const fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Returns the polling interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the path of the local database.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`CircleError::Config`] if a variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, using defaults for unset keys.
    ///
    /// `SAFE_CIRCLE_BACKEND` wins over `SAFE_CIRCLE_REMOTE_API_KEY`; without
    /// either the local backend is used.
    ///
    /// # Errors
    ///
    /// Returns [`CircleError::Config`] if a variable holds an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.backend = match value(ENV_BACKEND) {
            Some(raw) => Backend::parse(&raw).ok_or_else(|| {
                CircleError::Config(format!("{ENV_BACKEND} must be remote or local, got {raw}"))
            })?,
            None if value(ENV_REMOTE_API_KEY).is_some() => Backend::Remote,
            None => Backend::Local,
        };

        if let Some(dir) = value(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(raw) = value(ENV_POLL_INTERVAL_MS) {
            config.poll_interval_ms = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| {
                    CircleError::Config(format!(
                        "{ENV_POLL_INTERVAL_MS} must be a positive integer, got {raw}"
                    ))
                })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.backend, Backend::Local);
        assert_eq!(config.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert!(config.database_path().ends_with(DATABASE_FILE));
    }

    #[test]
    fn config_builder() {
        let config = SyncConfig::new()
            .with_backend(Backend::Remote)
            .with_poll_interval(Duration::from_millis(250))
            .with_data_dir("/tmp/circles");
        assert_eq!(config.backend, Backend::Remote);
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/circles/circles.db"));
    }

    #[test]
    fn api_key_selects_remote() {
        let config = SyncConfig::from_lookup(lookup(&[(ENV_REMOTE_API_KEY, "k")])).unwrap();
        assert_eq!(config.backend, Backend::Remote);
    }

    #[test]
    fn explicit_backend_wins() {
        let config = SyncConfig::from_lookup(lookup(&[
            (ENV_REMOTE_API_KEY, "k"),
            (ENV_BACKEND, "Local"),
        ]))
        .unwrap();
        assert_eq!(config.backend, Backend::Local);
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = SyncConfig::from_lookup(lookup(&[(ENV_REMOTE_API_KEY, "  ")])).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_backend = SyncConfig::from_lookup(lookup(&[(ENV_BACKEND, "cloud")]));
        assert!(matches!(bad_backend, Err(CircleError::Config(_))));

        let bad_interval = SyncConfig::from_lookup(lookup(&[(ENV_POLL_INTERVAL_MS, "0")]));
        assert!(matches!(bad_interval, Err(CircleError::Config(_))));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"backend":"remote"}"#).unwrap();
        assert_eq!(config.backend, Backend::Remote);
        assert_eq!(config.poll_interval_ms, 3_000);
    }
}
