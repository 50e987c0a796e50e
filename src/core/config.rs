use anyhow::{Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::driver::DriverSettings;
use crate::core::sweep::SweepSettings;

pub const CONFIG_FILE: &str = "witness.toml";

/// Settle time is bounded by the lookback, so this caps both.
const MAX_LOOKBACK_HOURS: i64 = 24 * 366;

#[derive(Debug, Clone, Deserialize)]
pub struct WitnessConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub github: GithubConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub sweep: SweepConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    /// Blob root. Relative paths resolve against the data directory.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    #[serde(default = "default_max_dequeue_count")]
    pub max_dequeue_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Six-field cron expression (seconds first).
    #[serde(default = "default_sweep_cron")]
    pub cron: String,

    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,

    #[serde(default = "default_settle_minutes")]
    pub settle_minutes: i64,

    /// `owner/name` pairs to sweep.
    #[serde(default)]
    pub repositories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_webhook_host")]
    pub host: String,

    #[serde(default = "default_webhook_port")]
    pub port: u16,

    /// Environment variable holding the webhook signing secret. When the
    /// variable is unset, signatures are not checked.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_user_agent() -> String {
    format!("actions-witness/{}", env!("CARGO_PKG_VERSION"))
}
fn default_lease_seconds() -> u64 {
    600
}
fn default_max_dequeue_count() -> u32 {
    5
}
fn default_concurrency() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    5_000
}
fn default_error_backoff_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_sweep_cron() -> String {
    "0 */15 * * * *".to_string()
}
fn default_lookback_hours() -> i64 {
    24
}
fn default_settle_minutes() -> i64 {
    30
}
fn default_webhook_host() -> String {
    "127.0.0.1".to_string()
}
fn default_webhook_port() -> u16 {
    17890
}
fn default_secret_env() -> String {
    "GITHUB_WEBHOOK_SECRET".to_string()
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            github: GithubConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            consumer: ConsumerConfig::default(),
            sweep: SweepConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: None,
            lease_seconds: default_lease_seconds(),
            max_dequeue_count: default_max_dequeue_count(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: default_sweep_cron(),
            lookback_hours: default_lookback_hours(),
            settle_minutes: default_settle_minutes(),
            repositories: Vec::new(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_webhook_host(),
            port: default_webhook_port(),
            secret_env: default_secret_env(),
        }
    }
}

impl WitnessConfig {
    /// Load `path`, or defaults if it does not exist.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No {} found, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config: WitnessConfig = toml::from_str(&content)?;
        config.validate()?;

        info!(
            "Loaded config: consumers={}, sweep={} ({} repositories), webhook={}",
            config.consumer.concurrency,
            config.sweep.enabled,
            config.sweep.repositories.len(),
            config.webhook.enabled
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consumer.concurrency == 0 {
            bail!("consumer.concurrency must be at least 1");
        }
        if self.queue.lease_seconds == 0 {
            bail!("queue.lease_seconds must be at least 1");
        }
        if self.sweep.settle_minutes < 0 || self.sweep.lookback_hours <= 0 {
            bail!("sweep.lookback_hours and sweep.settle_minutes must be positive");
        }
        if self.sweep.lookback_hours > MAX_LOOKBACK_HOURS {
            bail!(
                "sweep.lookback_hours ({}) must be at most {} (one year)",
                self.sweep.lookback_hours,
                MAX_LOOKBACK_HOURS
            );
        }
        if self.sweep.settle_minutes >= self.sweep.lookback_hours * 60 {
            bail!(
                "sweep.settle_minutes ({}) must be shorter than sweep.lookback_hours ({}h)",
                self.sweep.settle_minutes,
                self.sweep.lookback_hours
            );
        }
        for repo in &self.sweep.repositories {
            if !is_repository_name(repo) {
                bail!("sweep.repositories entry {:?} is not of the form owner/name", repo);
            }
        }
        Ok(())
    }

    pub fn storage_root(&self, data_dir: &Path) -> PathBuf {
        match &self.storage.root {
            Some(root) => data_dir.join(root),
            None => data_dir.join("blobs"),
        }
    }

    pub fn queue_path(&self, data_dir: &Path) -> PathBuf {
        match &self.queue.path {
            Some(path) => data_dir.join(path),
            None => data_dir.join("queue.db"),
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.queue.lease_seconds)
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            concurrency: self.consumer.concurrency,
            poll_interval: Duration::from_millis(self.consumer.poll_interval_ms),
            error_backoff: Duration::from_millis(self.consumer.error_backoff_ms),
        }
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            lookback: chrono::Duration::hours(self.sweep.lookback_hours),
            settle: chrono::Duration::minutes(self.sweep.settle_minutes),
            repositories: self.sweep.repositories.clone(),
        }
    }
}

fn is_repository_name(s: &str) -> bool {
    let valid = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    matches!(s.split_once('/'), Some((owner, name)) if valid(owner) && valid(name))
}
