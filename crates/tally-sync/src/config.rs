//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_CRM_BASE_URL=https://crm.example.com/api                     │
//! │     TALLY_INTEGRATION_SECRET=...                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally-sync/sync.toml (Linux)                             │
//! │     ~/Library/Application Support/com.tally.sync/sync.toml (macOS)     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [database]
//! path = "/var/lib/tally/sync.db"
//!
//! [crm]
//! base_url = "https://crm.example.com/api"
//! integration_secret = "change-me"
//! timeout_secs = 30
//!
//! [processor]
//! interval_secs = 300
//! batch_size = 100
//! max_attempts = 3
//! stuck_threshold_mins = 30
//!
//! [reconciliation]
//! interval_secs = 86400
//! auto_sync_threshold = 10
//! alert_threshold = 100
//!
//! [webhook]
//! bind_addr = "0.0.0.0:8080"
//! admin_bind_addr = "127.0.0.1:8081"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use tally_core::{DriftThresholds, RetryPolicy};

// =============================================================================
// Database Settings
// =============================================================================

/// Where the sync store lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Path to the SQLite file. Created on first start.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("com", "tally", "sync")
        .map(|dirs| dirs.data_dir().join("sync.db"))
        .unwrap_or_else(|| PathBuf::from("sync.db"))
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
        }
    }
}

// =============================================================================
// CRM Settings
// =============================================================================

/// Outbound connection to the CRM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmSettings {
    /// Base URL of the CRM integration API (http or https).
    #[serde(default = "default_crm_base_url")]
    pub base_url: String,

    /// Shared HS256 secret for system-to-system tokens.
    #[serde(default)]
    pub integration_secret: String,

    /// `iss` claim of outbound tokens.
    #[serde(default = "default_token_issuer")]
    pub token_issuer: String,

    /// Lifetime of outbound tokens (seconds).
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Per-request timeout (seconds). A timeout is a retryable failure.
    #[serde(default = "default_crm_timeout")]
    pub timeout_secs: u64,

    /// Master switch for outbound sync and reconciliation.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_crm_base_url() -> String {
    "http://localhost:3001/api/integrations".to_string()
}

fn default_token_issuer() -> String {
    "tally-pos".to_string()
}

fn default_token_ttl() -> u64 {
    300
}

fn default_crm_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for CrmSettings {
    fn default() -> Self {
        CrmSettings {
            base_url: default_crm_base_url(),
            integration_secret: String::new(),
            token_issuer: default_token_issuer(),
            token_ttl_secs: default_token_ttl(),
            timeout_secs: default_crm_timeout(),
            enabled: true,
        }
    }
}

impl CrmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// =============================================================================
// Processor Settings
// =============================================================================

/// Queue processor behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSettings {
    /// Interval between cycles (seconds).
    #[serde(default = "default_processor_interval")]
    pub interval_secs: u64,

    /// Items per HIGH / NORMAL tier pass. LOW gets half.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Items per RETRY pass.
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: i64,

    /// Counted failures after which an item is FAILED.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// PROCESSING older than this is considered abandoned (minutes).
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_mins: i64,

    /// Reschedule delay while a customer dependency is unsynced (seconds).
    #[serde(default = "default_dependency_wait")]
    pub dependency_wait_secs: i64,

    /// Pause between items within a batch (milliseconds).
    #[serde(default = "default_item_delay")]
    pub item_delay_ms: u64,

    /// SUCCESS items older than this are deleted (days).
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_processor_interval() -> u64 {
    300
}
fn default_batch_size() -> i64 {
    100
}
fn default_retry_batch_size() -> i64 {
    50
}
fn default_max_attempts() -> u32 {
    tally_core::policy::DEFAULT_MAX_ATTEMPTS
}
fn default_stuck_threshold() -> i64 {
    30
}
fn default_dependency_wait() -> i64 {
    30
}
fn default_item_delay() -> u64 {
    100
}
fn default_retention_days() -> i64 {
    7
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        ProcessorSettings {
            interval_secs: default_processor_interval(),
            batch_size: default_batch_size(),
            retry_batch_size: default_retry_batch_size(),
            max_attempts: default_max_attempts(),
            stuck_threshold_mins: default_stuck_threshold(),
            dependency_wait_secs: default_dependency_wait(),
            item_delay_ms: default_item_delay(),
            retention_days: default_retention_days(),
            enabled: true,
        }
    }
}

impl ProcessorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stuck_threshold_mins)
    }

    pub fn dependency_wait(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dependency_wait_secs)
    }
}

// =============================================================================
// Reconciliation Settings
// =============================================================================

/// Loyalty reconciliation behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSettings {
    /// Interval between full passes (seconds). Default: daily.
    #[serde(default = "default_reconciliation_interval")]
    pub interval_secs: u64,

    /// |drift| at or below this is overwritten silently.
    #[serde(default = "default_auto_sync_threshold")]
    pub auto_sync_threshold: i64,

    /// |drift| above this goes to manual review.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: i64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_reconciliation_interval() -> u64 {
    86_400
}
fn default_auto_sync_threshold() -> i64 {
    tally_core::drift::DEFAULT_AUTO_SYNC_THRESHOLD
}
fn default_alert_threshold() -> i64 {
    tally_core::drift::DEFAULT_ALERT_THRESHOLD
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        ReconciliationSettings {
            interval_secs: default_reconciliation_interval(),
            auto_sync_threshold: default_auto_sync_threshold(),
            alert_threshold: default_alert_threshold(),
            enabled: true,
        }
    }
}

impl ReconciliationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn thresholds(&self) -> DriftThresholds {
        DriftThresholds {
            auto_sync: self.auto_sync_threshold,
            alert: self.alert_threshold,
        }
    }
}

// =============================================================================
// Webhook Settings
// =============================================================================

/// Inbound HTTP listeners and webhook token rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Public listener for CRM webhooks.
    #[serde(default = "default_webhook_bind")]
    pub bind_addr: String,

    /// Operator listener for admin routes. Loopback unless overridden.
    #[serde(default = "default_admin_bind")]
    pub admin_bind_addr: String,

    /// Required `iss` claim of webhook tokens.
    #[serde(default = "default_expected_issuer")]
    pub expected_issuer: String,

    /// Required `scope` claim of webhook tokens.
    #[serde(default = "default_required_scope")]
    pub required_scope: String,

    /// Verification secret. Falls back to the integration secret.
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_webhook_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_bind() -> String {
    "127.0.0.1:8081".to_string()
}
fn default_expected_issuer() -> String {
    "crm".to_string()
}
fn default_required_scope() -> String {
    "webhook".to_string()
}

impl Default for WebhookSettings {
    fn default() -> Self {
        WebhookSettings {
            bind_addr: default_webhook_bind(),
            admin_bind_addr: default_admin_bind(),
            expected_issuer: default_expected_issuer(),
            required_scope: default_required_scope(),
            secret: None,
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub crm: CrmSettings,

    #[serde(default)]
    pub processor: ProcessorSettings,

    #[serde(default)]
    pub reconciliation: ReconciliationSettings,

    #[serde(default)]
    pub webhook: WebhookSettings,
}

impl SyncConfig {
    /// Creates a config with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let url = url::Url::parse(&self.crm.base_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "CRM base URL must be http:// or https://, got: {}",
                self.crm.base_url
            )));
        }

        if self.crm.enabled && self.crm.integration_secret.is_empty() {
            return Err(SyncError::InvalidConfig(
                "crm.integration_secret is required while CRM sync is enabled".into(),
            ));
        }

        if self.processor.batch_size <= 0 || self.processor.retry_batch_size <= 0 {
            return Err(SyncError::InvalidConfig(
                "batch sizes must be greater than 0".into(),
            ));
        }

        if self.processor.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if self.reconciliation.auto_sync_threshold > self.reconciliation.alert_threshold {
            return Err(SyncError::InvalidConfig(format!(
                "auto_sync_threshold ({}) must not exceed alert_threshold ({})",
                self.reconciliation.auto_sync_threshold, self.reconciliation.alert_threshold
            )));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TALLY_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(url) = std::env::var("TALLY_CRM_BASE_URL") {
            debug!(url = %url, "Overriding CRM base URL from environment");
            self.crm.base_url = url;
        }

        // never log the value
        if let Ok(secret) = std::env::var("TALLY_INTEGRATION_SECRET") {
            self.crm.integration_secret = secret;
        }

        if let Ok(secret) = std::env::var("TALLY_WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }

        if let Ok(enabled) = std::env::var("TALLY_CRM_ENABLED") {
            match enabled.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.crm.enabled = true,
                "0" | "false" | "no" => self.crm.enabled = false,
                _ => warn!(value = %enabled, "Unknown TALLY_CRM_ENABLED value in environment"),
            }
        }

        if let Ok(interval) = std::env::var("TALLY_SYNC_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.processor.interval_secs = secs;
            }
        }

        if let Ok(size) = std::env::var("TALLY_SYNC_BATCH_SIZE") {
            if let Ok(n) = size.parse::<i64>() {
                self.processor.batch_size = n;
            }
        }

        if let Ok(max) = std::env::var("TALLY_SYNC_MAX_ATTEMPTS") {
            if let Ok(n) = max.parse::<u32>() {
                self.processor.max_attempts = n;
            }
        }

        if let Ok(interval) = std::env::var("TALLY_RECONCILIATION_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.reconciliation.interval_secs = secs;
            }
        }

        if let Ok(addr) = std::env::var("TALLY_WEBHOOK_BIND") {
            self.webhook.bind_addr = addr;
        }

        if let Ok(addr) = std::env::var("TALLY_ADMIN_BIND") {
            self.webhook.admin_bind_addr = addr;
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Secret used to verify inbound webhook tokens.
    pub fn webhook_secret(&self) -> &str {
        self.webhook
            .secret
            .as_deref()
            .unwrap_or(&self.crm.integration_secret)
    }
}
