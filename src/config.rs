//! Application configuration management.
//!
//! All externally tunable values live here: retry/backoff budgets for the
//! sync queue, the background drain interval, the session idle window, and
//! the proactive token refresh interval.
//!
//! Configuration is stored at `~/.config/spb-field/config.json`; every field
//! has a default so a missing or partial file still yields a usable config.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for the config directory path
const APP_NAME: &str = "spb-field";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL for the SPB backend.
    pub api_base_url: String,

    /// Connect/send/receive timeout for every remote call, in seconds.
    pub request_timeout_secs: u64,

    /// Maximum automatic resubmission attempts before a queued record is
    /// parked as permanently failed.
    pub max_sync_retries: u32,

    /// Base for the per-record retry delay, in milliseconds. The nth
    /// failure of a record waits `initial * 2^n` before its retry.
    pub initial_backoff_ms: u64,

    /// Cap on the per-record retry delay, in milliseconds.
    pub max_backoff_ms: u64,

    /// How often the background drain runs, in seconds.
    pub drain_interval_secs: u64,

    /// Idle window after which a session times out, in seconds.
    pub session_idle_window_secs: u64,

    /// How long before timeout the session is reported as expiring,
    /// in seconds. Gives the UI room to ask the user to continue.
    pub session_warning_margin_secs: u64,

    /// Interval of the periodic session state check, in seconds.
    pub session_check_interval_secs: u64,

    /// Interval of the proactive token refresh while a session is valid,
    /// in seconds. Fixed rather than derived from token claims so the
    /// staleness window is bounded even when the server omits an expiry.
    pub proactive_refresh_interval_secs: u64,

    /// Bounded retry attempts for a token refresh that fails with a
    /// network error.
    pub refresh_retry_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.spb-field.example.com".to_string(),
            request_timeout_secs: 30,
            max_sync_retries: 5,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 300_000,
            drain_interval_secs: 60,
            session_idle_window_secs: 1_800,
            session_warning_margin_secs: 300,
            session_check_interval_secs: 10,
            proactive_refresh_interval_secs: 600,
            refresh_retry_attempts: 3,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn session_idle_window(&self) -> Duration {
        Duration::from_secs(self.session_idle_window_secs)
    }

    pub fn session_warning_margin(&self) -> Duration {
        Duration::from_secs(self.session_warning_margin_secs)
    }

    pub fn session_check_interval(&self) -> Duration {
        Duration::from_secs(self.session_check_interval_secs)
    }

    pub fn proactive_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.proactive_refresh_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: Config = serde_json::from_str(r#"{"max_sync_retries": 2}"#)
            .expect("partial config should parse");
        assert_eq!(config.max_sync_retries, 2);
        assert_eq!(config.drain_interval_secs, Config::default().drain_interval_secs);
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::default();
        assert_eq!(config.initial_backoff(), Duration::from_millis(2_000));
        assert_eq!(config.session_idle_window(), Duration::from_secs(1_800));
    }
}
