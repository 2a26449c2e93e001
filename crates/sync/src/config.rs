//! Engine configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the remote API, without a trailing slash.
    pub api_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Mirror database file; `{app_data_dir}/mercato/mirror.db` when unset.
    #[serde(default)]
    pub mirror_path: Option<PathBuf>,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_push_retries")]
    pub push_retries: u32,
    #[serde(default = "default_tombstone_retention_days")]
    pub tombstone_retention_days: i64,
    /// Offset used for report period boundaries.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_probe_interval_secs() -> u64 {
    15
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_push_retries() -> u32 {
    3
}

fn default_tombstone_retention_days() -> i64 {
    7
}

impl EngineConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
            mirror_path: None,
            sync_interval_secs: default_sync_interval_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            push_retries: default_push_retries(),
            tombstone_retention_days: default_tombstone_retention_days(),
            utc_offset_minutes: 0,
        }
    }

    /// Read `MERCATO_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup("MERCATO_API_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("MERCATO_API_URL"))?;

        let mut config = Self::new(api_url);
        config.auth_token = lookup("MERCATO_AUTH_TOKEN").filter(|v| !v.is_empty());
        config.mirror_path = lookup("MERCATO_MIRROR_PATH").map(PathBuf::from);

        if let Some(secs) = parse_var(&lookup, "MERCATO_SYNC_INTERVAL_SECS")? {
            config.sync_interval_secs = positive(secs, "MERCATO_SYNC_INTERVAL_SECS")?;
        }
        if let Some(secs) = parse_var(&lookup, "MERCATO_PROBE_INTERVAL_SECS")? {
            config.probe_interval_secs = positive(secs, "MERCATO_PROBE_INTERVAL_SECS")?;
        }
        if let Some(minutes) = parse_var::<i32>(&lookup, "MERCATO_UTC_OFFSET_MINUTES")? {
            if FixedOffset::east_opt(minutes.saturating_mul(60)).is_none() {
                return Err(ConfigError::Invalid {
                    var: "MERCATO_UTC_OFFSET_MINUTES",
                    value: minutes.to_string(),
                });
            }
            config.utc_offset_minutes = minutes;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that arrive unchecked through serde.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.trim().is_empty() {
            return Err(ConfigError::Missing("api_url"));
        }
        positive(self.sync_interval_secs, "sync_interval_secs")?;
        positive(self.probe_interval_secs, "probe_interval_secs")?;
        positive(self.request_timeout_secs, "request_timeout_secs")?;
        if self.tombstone_retention_days < 0 {
            return Err(ConfigError::Invalid {
                var: "tombstone_retention_days",
                value: self.tombstone_retention_days.to_string(),
            });
        }
        if FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).is_none() {
            return Err(ConfigError::Invalid {
                var: "utc_offset_minutes",
                value: self.utc_offset_minutes.to_string(),
            });
        }
        Ok(())
    }

    /// Never zero, even for an unvalidated config.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn tombstone_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.tombstone_retention_days)
    }

    /// Offset for report periods; out-of-range values fall back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
    }

    pub fn mirror_path(&self) -> anyhow::Result<PathBuf> {
        match &self.mirror_path {
            Some(path) => Ok(path.clone()),
            None => crate::mirror::MirrorStore::default_path(),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

fn positive(value: u64, var: &'static str) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        });
    }
    Ok(value)
}
