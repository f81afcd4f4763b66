//! Nurture configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{NurtureError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NurtureConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl NurtureConfig {
    /// Load config from the default path (~/.nurture/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NurtureError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse a TOML document, then apply environment overrides for secrets.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| NurtureError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config.with_env_overrides())
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| NurtureError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Nurture home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nurture")
    }

    fn validate(&self) -> Result<()> {
        if self.dispatcher.workers == 0 {
            return Err(NurtureError::Config("dispatcher.workers must be at least 1".into()));
        }
        if self.dispatcher.batch_size == 0 {
            return Err(NurtureError::Config("dispatcher.batch_size must be at least 1".into()));
        }
        // a claim must outlive one transport call or it can be recovered mid-send
        if self.dispatcher.claim_ttl_secs <= self.mail.timeout_secs {
            return Err(NurtureError::Config(format!(
                "dispatcher.claim_ttl_secs ({}) must exceed mail.timeout_secs ({})",
                self.dispatcher.claim_ttl_secs, self.mail.timeout_secs
            )));
        }
        if self.tracking.enabled && self.tracking.base_url.trim().is_empty() {
            return Err(NurtureError::Config(
                "tracking.base_url is required when tracking is enabled".into(),
            ));
        }
        Ok(())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("NURTURE_MAIL_API_KEY")
            && !key.is_empty()
        {
            self.mail.api_key = key;
        }
        if let Ok(password) = std::env::var("NURTURE_SMTP_PASSWORD")
            && !password.is_empty()
        {
            self.mail.smtp_password = password;
        }
        self
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "~/.nurture/campaigns.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Daily send budgets. Both caps are hard limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_global_cap")]
    pub global_daily_cap: u32,
    #[serde(default = "default_recipient_cap")]
    pub recipient_daily_cap: u32,
}

fn default_global_cap() -> u32 { 100 }
fn default_recipient_cap() -> u32 { 3 }

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_daily_cap: default_global_cap(),
            recipient_daily_cap: default_recipient_cap(),
        }
    }
}

/// Dispatch sweep tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Claimed rows older than this are returned to `pending` on the next sweep.
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,
}

fn default_workers() -> usize { 2 }
fn default_poll_interval() -> u64 { 30 }
fn default_batch_size() -> usize { 25 }
fn default_claim_ttl() -> u64 { 900 }

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            claim_ttl_secs: default_claim_ttl(),
        }
    }
}

/// Outbound mail transport selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// "log", "http" or "smtp".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_provider() -> String { "log".into() }
fn default_from_address() -> String { "coach@example.com".into() }
fn default_from_name() -> String { "Your Coach".into() }
fn default_api_url() -> String { "https://api.resend.com/emails".into() }
fn default_smtp_port() -> u16 { 587 }
fn default_timeout() -> u64 { 30 }

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            from_address: default_from_address(),
            from_name: default_from_name(),
            api_url: default_api_url(),
            api_key: String::new(),
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            smtp_username: String::new(),
            smtp_password: String::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Open/click tracking instrumentation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Public URL the tracking endpoints are reachable at, e.g. `https://mail.example.com`.
    #[serde(default)]
    pub base_url: String,
}

/// Template rendering defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_fallback_name")]
    pub fallback_name: String,
}

fn default_fallback_name() -> String { "there".into() }

impl Default for RenderConfig {
    fn default() -> Self {
        Self { fallback_name: default_fallback_name() }
    }
}

/// HTTP gateway bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3080 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}
