//! Synchronizer settings.
//!
//! Provides `SyncSettings`, loaded from a JSON file and overridable from the
//! environment, used by the synchronizer and the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::normalize_text_option;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_VERIFICATION_POLL_MS: u64 = 5000;

pub const ENV_QUEUE_CAPACITY: &str = "CARTSYNC_QUEUE_CAPACITY";
pub const ENV_VERIFICATION_POLL_MS: &str = "CARTSYNC_VERIFICATION_POLL_MS";
pub const ENV_DB_PATH: &str = "CARTSYNC_DB_PATH";

/// Runtime settings of a synchronizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SyncSettings {
    /// Capacity of each worker queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How often an unverified identity is re-checked
    #[serde(default = "default_verification_poll_ms")]
    pub verification_poll_interval_ms: u64,
    /// Local database file
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            verification_poll_interval_ms: DEFAULT_VERIFICATION_POLL_MS,
            database_path: None,
        }
    }
}

impl SyncSettings {
    /// Parse and validate settings from a JSON document.
    pub fn from_json(payload: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(payload)
            .map_err(|error| Error::Config(format!("invalid settings JSON: {error}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(payload) => Self::from_json(&payload),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Apply `CARTSYNC_*` environment overrides.
    pub fn apply_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = normalize_text_option(lookup(ENV_QUEUE_CAPACITY)) {
            self.queue_capacity = parse_env_number(ENV_QUEUE_CAPACITY, &raw)?;
        }
        if let Some(raw) = normalize_text_option(lookup(ENV_VERIFICATION_POLL_MS)) {
            self.verification_poll_interval_ms = parse_env_number(ENV_VERIFICATION_POLL_MS, &raw)?;
        }
        if let Some(raw) = normalize_text_option(lookup(ENV_DB_PATH)) {
            self.database_path = Some(PathBuf::from(raw));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be positive".to_string()));
        }
        if self.verification_poll_interval_ms == 0 {
            return Err(Error::Config(
                "verification_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn verification_poll_interval(&self) -> Duration {
        Duration::from_millis(self.verification_poll_interval_ms)
    }
}

const fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

const fn default_verification_poll_ms() -> u64 {
    DEFAULT_VERIFICATION_POLL_MS
}

fn parse_env_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got '{raw}'")))
}
