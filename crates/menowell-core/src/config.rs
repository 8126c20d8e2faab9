//! Application configuration management.
//!
//! Configuration is stored at `~/.config/menowell/config.json`. Any field can
//! be overridden with a `MENOWELL_*` environment variable (for example
//! `MENOWELL_SUPABASE_URL`), which is how `.env` files feed in.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::SupabaseConfig;
use crate::auth::emergency::{DEFAULT_CREDENTIAL_TTL_HOURS, DEFAULT_OFFLINE_SESSION_MINUTES};
use crate::auth::CircuitBreaker;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "menowell";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_PREFIX: &str = "MENOWELL_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub last_email: Option<String>,

    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub half_open_max_calls: u32,

    pub max_restore_attempts: u32,
    pub retry_delay_ms: u64,

    pub credential_ttl_hours: i64,
    pub offline_session_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_anon_key: None,
            last_email: None,
            failure_threshold: 3,
            reset_timeout_secs: 30,
            half_open_max_calls: 1,
            max_restore_attempts: 3,
            retry_delay_ms: 500,
            credential_ttl_hours: DEFAULT_CREDENTIAL_TTL_HOURS,
            offline_session_minutes: DEFAULT_OFFLINE_SESSION_MINUTES,
        }
    }
}

impl Config {
    /// Load from disk (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok());
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// `lookup` receives the variable name without the `MENOWELL_` prefix.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SUPABASE_URL") {
            self.supabase_url = Some(v);
        }
        if let Some(v) = lookup("SUPABASE_ANON_KEY") {
            self.supabase_anon_key = Some(v);
        }
        override_number(&lookup, "FAILURE_THRESHOLD", &mut self.failure_threshold);
        override_number(&lookup, "RESET_TIMEOUT_SECS", &mut self.reset_timeout_secs);
        override_number(&lookup, "HALF_OPEN_MAX_CALLS", &mut self.half_open_max_calls);
        override_number(&lookup, "MAX_RESTORE_ATTEMPTS", &mut self.max_restore_attempts);
        override_number(&lookup, "RETRY_DELAY_MS", &mut self.retry_delay_ms);
        override_number(&lookup, "CREDENTIAL_TTL_HOURS", &mut self.credential_ttl_hours);
        override_number(&lookup, "OFFLINE_SESSION_MINUTES", &mut self.offline_session_minutes);
    }

    /// Backend connection settings, if both URL and key are configured.
    pub fn supabase_config(&self) -> Option<SupabaseConfig> {
        match (&self.supabase_url, &self.supabase_anon_key) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => {
                Some(SupabaseConfig::new(url.clone(), key.clone()))
            }
            _ => None,
        }
    }

    pub fn circuit_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.failure_threshold,
            Duration::from_secs(self.reset_timeout_secs),
            self.half_open_max_calls,
        )
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Falls back to the default for zero, negative or out-of-range values.
    pub fn credential_ttl(&self) -> chrono::Duration {
        positive_or_default(
            "credential_ttl_hours",
            chrono::Duration::try_hours(self.credential_ttl_hours),
            chrono::Duration::hours(DEFAULT_CREDENTIAL_TTL_HOURS),
        )
    }

    /// Falls back to the default for zero, negative or out-of-range values.
    pub fn offline_session_ttl(&self) -> chrono::Duration {
        positive_or_default(
            "offline_session_minutes",
            chrono::Duration::try_minutes(self.offline_session_minutes),
            chrono::Duration::minutes(DEFAULT_OFFLINE_SESSION_MINUTES),
        )
    }
}

fn override_number<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *target = v,
            Err(_) => warn!(variable = %format!("{}{}", ENV_PREFIX, key), value = %raw, "Ignoring invalid override"),
        }
    }
}

fn positive_or_default(field: &str, value: Option<chrono::Duration>, default: chrono::Duration) -> chrono::Duration {
    match value {
        Some(ttl) if ttl > chrono::Duration::zero() => ttl,
        _ => {
            warn!(field, default = %default, "Ignoring out-of-range TTL");
            default
        }
    }
}
