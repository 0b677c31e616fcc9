use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read when neither `--config` nor `BKMON_CONFIG` is given.
pub const DEFAULT_CONFIG_FILE: &str = "bkmon.toml";

const ENV_PREFIX: &str = "BKMON_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base URL of the backup REST endpoints.
    pub api_url: String,
    /// Push endpoint; the session id is appended as `?clientId=`.
    pub push_url: String,
    /// Identifies this dashboard session on the push endpoint.
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub refresh_debounce_ms: u64,
    pub poll_interval_secs: u64,
    pub history_limit: usize,
    pub request_timeout_secs: u64,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/api/backup".to_string(),
            push_url: "ws://localhost:8080/ws/backup".to_string(),
            session_id: format!("dashboard-{}", uuid::Uuid::now_v7()),
            api_token: None,
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: 5,
            refresh_debounce_ms: 2000,
            poll_interval_secs: 10,
            history_limit: 10,
            request_timeout_secs: 10,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the config file, `BKMON_*` env vars and CLI overrides (in that order).
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        let path = std::env::var_os("BKMON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load(&path, overrides)
    }

    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.push_url.starts_with("ws://") || self.push_url.starts_with("wss://")) {
            anyhow::bail!("push_url must be a ws:// or wss:// URL, got {}", self.push_url);
        }
        if self.session_id.trim().is_empty() {
            anyhow::bail!("session_id must not be empty");
        }
        Ok(())
    }

    /// Write the config as TOML, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn push_endpoint(&self) -> String {
        let separator = if self.push_url.contains('?') { '&' } else { '?' };
        format!("{}{}clientId={}", self.push_url, separator, self.session_id)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
