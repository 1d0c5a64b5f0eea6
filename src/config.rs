//! Configuration types for nzb-mount

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::UsageClass;

/// NNTP provider configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider hostname
    pub host: String,

    /// Provider port (typically 119 for unencrypted, 563 for TLS)
    pub port: u16,

    /// Use TLS (implicit TLS, not STARTTLS)
    pub tls: bool,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Maximum connections this provider allows
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Role of this provider in the provider set
    #[serde(default)]
    pub provider_type: ProviderType,

    /// Provider priority (lower = tried first on affinity ties)
    #[serde(default)]
    pub priority: i32,
}

impl ProviderConfig {
    /// Whether this provider participates in normal fetching at all
    pub fn is_enabled(&self) -> bool {
        self.provider_type != ProviderType::Disabled
    }

    /// Whether this provider is a backup (tried only after primaries)
    pub fn is_backup(&self) -> bool {
        matches!(
            self.provider_type,
            ProviderType::BackupAndStats | ProviderType::BackupOnly
        )
    }
}

/// Role of a provider
///
/// Only `PrimaryPooled` providers count toward the shared streaming
/// capacity budget; backups are consulted after primaries are exhausted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Not used at all
    Disabled,
    /// Normal provider counted toward the capacity budget (default)
    #[default]
    PrimaryPooled,
    /// Backup that also serves stats/health traffic
    BackupAndStats,
    /// Backup consulted only on primary failure
    BackupOnly,
}

/// Connection and transfer tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionsConfig {
    /// Connections the queue worker may use at once (default: 10)
    #[serde(default = "default_max_queue_connections")]
    pub max_queue_connections: usize,

    /// Total primary-pooled connections available for streaming (default: 20)
    #[serde(default = "default_total_streaming_connections")]
    pub total_streaming_connections: usize,

    /// Connections a single streaming read may fan out over (default: 2)
    #[serde(default = "default_connections_per_stream")]
    pub connections_per_stream: usize,

    /// High-water mark of the in-memory body buffer in bytes (default: 1 MiB)
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,

    /// Per-operation I/O timeout in seconds (default: 30)
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Pool acquisition timeout in seconds (default: 60)
    #[serde(default = "default_acquire_timeout_secs")]
    pub connection_acquire_timeout_secs: u64,

    /// Idle seconds after which a pooled connection is pinged with DATE (default: 30)
    #[serde(default = "default_idle_ping_secs")]
    pub idle_ping_after_secs: u64,

    /// STAT every segment before accepting an NZB (default: false)
    #[serde(default)]
    pub ensure_article_existence: bool,

    /// Track per-provider success/latency and order providers by score (default: true)
    #[serde(default = "default_true")]
    pub provider_affinity: bool,
}

impl ConnectionsConfig {
    /// Per-operation timeout as a `Duration`
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Pool acquisition timeout as a `Duration`
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_acquire_timeout_secs)
    }
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            max_queue_connections: default_max_queue_connections(),
            total_streaming_connections: default_total_streaming_connections(),
            connections_per_stream: default_connections_per_stream(),
            stream_buffer_size: default_stream_buffer_size(),
            operation_timeout_secs: default_operation_timeout_secs(),
            connection_acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_ping_after_secs: default_idle_ping_secs(),
            ensure_article_existence: false,
            provider_affinity: true,
        }
    }
}

/// Reserved connection quotas per usage class
///
/// The remainder of the primary-pooled capacity forms a shared overflow
/// pool. `sum of reserves` must not exceed `total_streaming_connections`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Permits reserved for streaming reads (default: 8)
    #[serde(default = "default_streaming_reserve")]
    pub streaming_reserved: usize,

    /// Permits reserved for the queue worker (default: 6)
    #[serde(default = "default_queue_reserve")]
    pub queue_reserved: usize,

    /// Permits reserved for health checks (default: 1)
    #[serde(default = "default_one")]
    pub health_check_reserved: usize,

    /// Permits reserved for repair traffic (default: 1)
    #[serde(default = "default_one")]
    pub repair_reserved: usize,
}

impl LimiterConfig {
    /// Reserve for a given class
    pub fn reserved(&self, class: UsageClass) -> usize {
        match class {
            UsageClass::Streaming => self.streaming_reserved,
            UsageClass::Queue => self.queue_reserved,
            UsageClass::HealthCheck => self.health_check_reserved,
            UsageClass::Repair => self.repair_reserved,
        }
    }

    /// Sum of all reserves
    pub fn total_reserved(&self) -> usize {
        UsageClass::ALL.iter().map(|c| self.reserved(*c)).sum()
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            streaming_reserved: default_streaming_reserve(),
            queue_reserved: default_queue_reserve(),
            health_check_reserved: default_one(),
            repair_reserved: default_one(),
        }
    }
}

/// What to do when a job folder with the same name already exists
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateNzbBehavior {
    /// Finalize the new job as failed
    MarkFailed,
    /// Keep the existing folder and finish without writing
    Ignore,
    /// Append " (2)" … " (100)" to find a free sibling name (default)
    #[default]
    Increment,
}

/// How completed files are surfaced to downstream importers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStrategy {
    /// Expose mount paths for symlink-based import (default)
    #[default]
    Symlinks,
    /// Emit .strm text files pointing at the streaming URLs
    Strm,
}

/// Finalization and import behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Fail jobs that produce no importable video file (default: false)
    #[serde(default)]
    pub ensure_importable_video: bool,

    /// Import strategy for downstream media managers
    #[serde(default)]
    pub import_strategy: ImportStrategy,

    /// Behavior when the job folder already exists
    #[serde(default)]
    pub duplicate_nzb_behavior: DuplicateNzbBehavior,

    /// File extensions never committed to the mount (lower-case, with dot)
    #[serde(default)]
    pub blacklisted_extensions: Vec<String>,

    /// Drop files whose name marks them as samples (default: false)
    #[serde(default)]
    pub hide_samples: bool,

    /// Base URL written into STRM files (used only with `ImportStrategy::Strm`)
    #[serde(default)]
    pub strm_base_url: Option<String>,

    /// Directory STRM files are written into; no files are written when unset
    #[serde(default)]
    pub strm_output_dir: Option<std::path::PathBuf>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            ensure_importable_video: false,
            import_strategy: ImportStrategy::default(),
            duplicate_nzb_behavior: DuplicateNzbBehavior::default(),
            blacklisted_extensions: Vec::new(),
            hide_samples: false,
            strm_base_url: None,
            strm_output_dir: None,
        }
    }
}

/// Queue manager tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pause applied after a retryable failure (default: 60 s)
    #[serde(default = "default_retry_pause_secs")]
    pub retry_pause_secs: u64,

    /// Supervisor warns when a job runs longer than this (default: 300 s)
    #[serde(default = "default_supervisor_secs")]
    pub supervisor_interval_secs: u64,

    /// Hours history items are retained; pruning is applied by the API layer (default: 720)
    #[serde(default = "default_history_retention_hours")]
    pub history_retention_hours: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_pause_secs: default_retry_pause_secs(),
            supervisor_interval_secs: default_supervisor_secs(),
            history_retention_hours: default_history_retention_hours(),
        }
    }
}

/// Retry configuration for transient connection-level failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry in milliseconds (default: 1000)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds (default: 30000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl RetryConfig {
    /// Initial delay as a `Duration`
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Maximum delay as a `Duration`
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// External *arr (Radarr/Sonarr) instance consumed by the API layer
///
/// Carried in config so one document configures the whole system; the core
/// never talks to these itself.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ArrInstanceConfig {
    /// Display name
    pub name: String,
    /// Base URL of the instance
    pub url: String,
    /// API key
    pub api_key: String,
}

/// Main configuration for the fetcher core
///
/// Fields are organized into logical sub-configs; all sub-config fields are
/// flattened so the JSON/TOML document stays flat and backward compatible.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// NNTP provider configurations (at least one enabled primary required)
    pub providers: Vec<ProviderConfig>,

    /// Connection and transfer tuning
    #[serde(flatten)]
    pub connections: ConnectionsConfig,

    /// Per-class reserved connection quotas
    #[serde(flatten)]
    pub limiter: LimiterConfig,

    /// Finalization and import behavior
    #[serde(flatten)]
    pub import: ImportConfig,

    /// Queue manager tuning
    #[serde(flatten)]
    pub queue: QueueConfig,

    /// Transient-failure retry tuning
    #[serde(default)]
    pub retry: RetryConfig,

    /// External *arr instances (consumed by the API layer, not the core)
    #[serde(default)]
    pub arr: Vec<ArrInstanceConfig>,
}

impl Config {
    /// Validate cross-field invariants
    ///
    /// - at least one enabled primary provider
    /// - limiter reserves fit inside the primary-pooled capacity
    pub fn validate(&self) -> Result<()> {
        let primaries = self
            .providers
            .iter()
            .filter(|p| p.provider_type == ProviderType::PrimaryPooled)
            .count();
        if primaries == 0 {
            return Err(Error::Config {
                message: "at least one primary_pooled provider is required".into(),
                key: Some("providers".into()),
            });
        }

        let capacity = self.primary_capacity();
        if self.limiter.total_reserved() > capacity {
            return Err(Error::Config {
                message: format!(
                    "reserved quotas ({}) exceed primary-pooled capacity ({})",
                    self.limiter.total_reserved(),
                    capacity
                ),
                key: Some("limiter".into()),
            });
        }

        Ok(())
    }

    /// Total connections across primary-pooled providers, capped by
    /// `total_streaming_connections`
    pub fn primary_capacity(&self) -> usize {
        let declared: usize = self
            .providers
            .iter()
            .filter(|p| p.provider_type == ProviderType::PrimaryPooled)
            .map(|p| p.max_connections)
            .sum();
        declared.min(self.connections.total_streaming_connections)
    }
}

/// Shared, runtime-mutable configuration
///
/// Long-lived components hold a `ConfigHandle` and either read the current
/// snapshot or subscribe to change notifications.
#[derive(Clone)]
pub struct ConfigHandle {
    current: std::sync::Arc<tokio::sync::RwLock<std::sync::Arc<Config>>>,
    notify: tokio::sync::watch::Sender<u64>,
}

impl ConfigHandle {
    /// Wrap an initial configuration
    pub fn new(config: Config) -> Self {
        let (notify, _) = tokio::sync::watch::channel(0);
        Self {
            current: std::sync::Arc::new(tokio::sync::RwLock::new(std::sync::Arc::new(config))),
            notify,
        }
    }

    /// Current configuration snapshot
    pub async fn get(&self) -> std::sync::Arc<Config> {
        self.current.read().await.clone()
    }

    /// Replace the configuration and notify subscribers
    pub async fn update(&self, config: Config) -> Result<()> {
        config.validate()?;
        *self.current.write().await = std::sync::Arc::new(config);
        self.notify.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// Subscribe to change notifications (the value is a generation counter)
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<u64> {
        self.notify.subscribe()
    }
}

fn default_max_connections() -> usize {
    10
}

fn default_max_queue_connections() -> usize {
    10
}

fn default_total_streaming_connections() -> usize {
    20
}

fn default_connections_per_stream() -> usize {
    2
}

fn default_stream_buffer_size() -> usize {
    1024 * 1024
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_acquire_timeout_secs() -> u64 {
    60
}

fn default_idle_ping_secs() -> u64 {
    30
}

fn default_streaming_reserve() -> usize {
    8
}

fn default_queue_reserve() -> usize {
    6
}

fn default_one() -> usize {
    1
}

fn default_retry_pause_secs() -> u64 {
    60
}

fn default_supervisor_secs() -> u64 {
    300
}

fn default_history_retention_hours() -> u64 {
    720
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}
