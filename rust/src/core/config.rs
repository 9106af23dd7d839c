use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub(crate) const CONFIG_FILE_NAME: &str = "chatsync_config.json";

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const MIN_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_SEND_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_UPLOAD_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
    #[error("poll_interval_ms must be at least 250, got {0}")]
    PollIntervalTooShort(u64),
    #[error("auto_follow_threshold_px must be a non-negative number, got {0}")]
    BadThreshold(f64),
    #[error("api_base_url is empty")]
    EmptyBaseUrl,
}

/// Contents of `chatsync_config.json`. Every field is optional; accessors apply defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_network: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_uploads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_follow_threshold_px: Option<f64>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ms) = self.poll_interval_ms {
            if ms < MIN_POLL_INTERVAL_MS {
                return Err(ConfigError::PollIntervalTooShort(ms));
            }
        }
        for (key, value) in [
            ("request_timeout_ms", self.request_timeout_ms),
            ("send_timeout_ms", self.send_timeout_ms),
            ("upload_timeout_ms", self.upload_timeout_ms),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Zero { key });
            }
        }
        if self.max_concurrent_uploads == Some(0) {
            return Err(ConfigError::Zero {
                key: "max_concurrent_uploads",
            });
        }
        if let Some(px) = self.auto_follow_threshold_px {
            if !px.is_finite() || px < 0.0 {
                return Err(ConfigError::BadThreshold(px));
            }
        }
        if self
            .api_base_url
            .as_deref()
            .is_some_and(|u| u.trim().is_empty())
        {
            return Err(ConfigError::EmptyBaseUrl);
        }
        Ok(())
    }

    /// Network is on when a base URL is configured and `disable_network` is not set.
    pub fn network_enabled(&self) -> bool {
        self.disable_network != Some(true) && self.api_base_url.is_some()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
                .max(MIN_POLL_INTERVAL_MS),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        millis_or(self.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS)
    }

    pub fn send_timeout(&self) -> Duration {
        millis_or(self.send_timeout_ms, DEFAULT_SEND_TIMEOUT_MS)
    }

    pub fn upload_timeout(&self) -> Duration {
        millis_or(self.upload_timeout_ms, DEFAULT_UPLOAD_TIMEOUT_MS)
    }

    pub fn max_concurrent_uploads(&self) -> usize {
        self.max_concurrent_uploads
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_UPLOADS)
    }

    pub fn auto_follow_threshold_px(&self) -> f64 {
        self.auto_follow_threshold_px
            .filter(|px| px.is_finite() && *px >= 0.0)
            .unwrap_or(super::viewport::DEFAULT_AUTO_FOLLOW_THRESHOLD_PX)
    }
}

fn millis_or(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.filter(|ms| *ms > 0).unwrap_or(default))
}

/// Read the config file from `data_dir`. `Ok(None)` when there is no file.
pub fn read_app_config(data_dir: &Path) -> anyhow::Result<Option<AppConfig>> {
    let path = data_dir.join(CONFIG_FILE_NAME);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let config: AppConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(Some(config))
}

/// Like `read_app_config`, but a broken file is logged and replaced by defaults.
pub(crate) fn load_app_config(data_dir: &Path) -> AppConfig {
    match read_app_config(data_dir) {
        Ok(Some(config)) => config,
        Ok(None) => AppConfig::default(),
        Err(e) => {
            tracing::warn!(error = format!("{e:#}"), "config: using defaults");
            AppConfig::default()
        }
    }
}
