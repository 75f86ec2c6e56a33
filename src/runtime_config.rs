// =============================================================================
// Runtime Configuration — pipeline tunables with serde defaults
// =============================================================================
//
// Loaded from a JSON file, then overridden by environment variables. All
// fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file.
//
// Environment overrides:
//   COMMIT_EVERY_N_OBJECT       commit_every_n_events
//   DELAY_SECONDS_FROM_MINUTE   delay_seconds_from_minute
//   ALERT_IF_Q_SIZE_MORE_THAN   alert_if_queue_size_more_than
//   SQL_FILE_NAME               database_path
// =============================================================================

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::types::Resolution;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_commit_every_n_events() -> u64 {
    100
}

fn default_delay_seconds_from_minute() -> u32 {
    3
}

fn default_alert_if_queue_size_more_than() -> usize {
    1_000
}

fn default_resolutions() -> Vec<Resolution> {
    Resolution::defaults()
}

fn default_database_path() -> String {
    "candles.sqlite3".to_string()
}

fn default_idle_poll_ms() -> u64 {
    100
}

fn default_evict_after_secs() -> u64 {
    600
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Persistence ---------------------------------------------------------

    /// Flush dirty candles and new trades every N processed events.
    #[serde(default = "default_commit_every_n_events")]
    pub commit_every_n_events: u64,

    /// Flush as soon as a trade opens a new window.
    #[serde(default = "default_true")]
    pub flush_on_new_window: bool,

    /// SQLite file; `":memory:"` for a throwaway database.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Clean windows are dropped from memory this long after they close.
    #[serde(default = "default_evict_after_secs")]
    pub evict_after_secs: u64,

    // --- Queue ---------------------------------------------------------------

    /// Warn once the event backlog grows past this many events.
    #[serde(default = "default_alert_if_queue_size_more_than")]
    pub alert_if_queue_size_more_than: usize,

    /// How long the dispatcher waits on an empty queue before polling again.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    // --- Scheduling ----------------------------------------------------------

    /// Seconds after each minute boundary before snapshots are requested,
    /// giving the exchange time to settle its own candles.
    #[serde(default = "default_delay_seconds_from_minute")]
    pub delay_seconds_from_minute: u32,

    /// Request the currently open windows once at startup.
    #[serde(default = "default_true")]
    pub bootstrap_fetch: bool,

    /// Window resolutions in seconds.
    #[serde(default = "default_resolutions")]
    pub resolutions: Vec<Resolution>,

    // --- Feeds ---------------------------------------------------------------

    /// Pause before reconnecting a dropped trade stream.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            commit_every_n_events: default_commit_every_n_events(),
            flush_on_new_window: true,
            database_path: default_database_path(),
            evict_after_secs: default_evict_after_secs(),
            alert_if_queue_size_more_than: default_alert_if_queue_size_more_than(),
            idle_poll_ms: default_idle_poll_ms(),
            delay_seconds_from_minute: default_delay_seconds_from_minute(),
            bootstrap_fetch: true,
            resolutions: default_resolutions(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            resolutions = ?config.resolutions,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = parse_var(&lookup, "COMMIT_EVERY_N_OBJECT")? {
            self.commit_every_n_events = v;
        }
        if let Some(v) = parse_var(&lookup, "DELAY_SECONDS_FROM_MINUTE")? {
            self.delay_seconds_from_minute = v;
        }
        if let Some(v) = parse_var(&lookup, "ALERT_IF_Q_SIZE_MORE_THAN")? {
            self.alert_if_queue_size_more_than = v;
        }
        if let Some(path) = lookup("SQL_FILE_NAME").filter(|p| !p.trim().is_empty()) {
            self.database_path = path;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commit_every_n_events == 0 {
            return Err(ConfigError::ZeroCommitInterval);
        }
        if self.resolutions.is_empty() {
            return Err(ConfigError::NoResolutions);
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value: raw }),
    }
}
