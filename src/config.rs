/*!
 * Client configuration
 *
 * All sections deserialize from TOML with full defaults, so a minimal
 * config file (or none at all) is valid. Syntactic checks are serde's
 * job; [`ClientConfig::validate`] performs the semantic checks afterwards
 * and reports every problem it finds, not just the first.
 */

use crate::error::{ClientError, Result};
use chainward_core_resilience::{BatchConfig, PoolConfig, RecoveryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for the client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-entity cache sizing and TTLs.
    pub caches: CacheSettings,

    /// Connection pool bounds and timeouts.
    pub pool: PoolSettings,

    /// Write batching bounds and pacing.
    pub batch: BatchSettings,

    /// Failure recovery pacing and bounds.
    pub recovery: RecoverySettings,

    /// Logging configuration.
    pub logging: LoggingSettings,

    /// Seconds between maintenance passes (idle reaping, minimum pool
    /// top-up, expired cache sweeps).
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

fn default_maintenance_interval() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            caches: CacheSettings::default(),
            pool: PoolSettings::default(),
            batch: BatchSettings::default(),
            recovery: RecoverySettings::default(),
            logging: LoggingSettings::default(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

/// Sizing and TTL for one cache.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheEntrySettings {
    /// Maximum live entries.
    pub max_size: usize,

    /// Seconds an entry stays valid after insertion.
    pub ttl_secs: u64,
}

impl Default for CacheEntrySettings {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl_secs: 300,
        }
    }
}

impl CacheEntrySettings {
    /// The TTL as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Cache settings per entity kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Block cache.
    pub block: CacheEntrySettings,

    /// Transaction cache.
    pub transaction: CacheEntrySettings,

    /// Balance cache.
    pub balance: CacheEntrySettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            block: CacheEntrySettings {
                max_size: 1000,
                ttl_secs: 300,
            },
            transaction: CacheEntrySettings {
                max_size: 10_000,
                ttl_secs: 60,
            },
            balance: CacheEntrySettings {
                max_size: 100_000,
                ttl_secs: 30,
            },
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Connections kept alive even when idle.
    pub min_connections: usize,

    /// Hard cap on concurrently existing connections.
    pub max_connections: usize,

    /// Seconds to wait for a connection before failing with exhaustion.
    pub connection_timeout_secs: u64,

    /// Seconds an idle connection survives before being reaped.
    pub idle_timeout_secs: u64,

    /// Consecutive failures before a connection is replaced.
    pub max_retries: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 10,
            max_connections: 100,
            connection_timeout_secs: 30,
            idle_timeout_secs: 300,
            max_retries: 3,
        }
    }
}

impl PoolSettings {
    /// The acquire deadline as a duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub(crate) fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            connection_timeout: self.connection_timeout(),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_retries: self.max_retries,
            ..PoolConfig::default()
        }
    }
}

/// Write batching settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Maximum records per batch.
    pub max_batch_size: usize,

    /// Milliseconds the oldest queued record may wait before a partial
    /// batch is drained anyway.
    pub batch_timeout_ms: u64,

    /// Times a failed batch is retried before being dropped.
    pub max_retries: u32,

    /// Queue capacity; submissions beyond it fail fast.
    pub max_queue_length: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            batch_timeout_ms: 100,
            max_retries: 3,
            max_queue_length: 10_000,
        }
    }
}

impl BatchSettings {
    pub(crate) fn to_batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            max_retries: self.max_retries,
            max_queue_length: self.max_queue_length,
        }
    }
}

/// Failure recovery settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Maximum retry attempts per failed operation.
    pub max_retry_attempts: u32,

    /// Seconds before the first retry; doubles per attempt.
    pub retry_delay_secs: u64,

    /// Seconds a whole recovery run may take before timing out.
    pub recovery_timeout_secs: u64,

    /// Whether transient transport failures are retried automatically
    /// inside the failing call.
    pub auto_recover: bool,

    /// Bound on tracked operations and on recovery history.
    pub max_recovery_queue_size: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_delay_secs: 5,
            recovery_timeout_secs: 30,
            auto_recover: true,
            max_recovery_queue_size: 1000,
        }
    }
}

impl RecoverySettings {
    pub(crate) fn to_recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            max_attempts: self.max_retry_attempts,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            max_queue_size: self.max_recovery_queue_size,
            ..RecoveryConfig::default()
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LoggingSettings {
    /// Minimum level emitted.
    pub level: LogLevel,

    /// When set, logs go to this file as JSON lines instead of stdout.
    pub log_file: Option<PathBuf>,
}

/// Log level for diagnostic output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: ClientConfig = toml::from_str(&contents)
            .map_err(|e| ClientError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation. Collects every problem before failing so a
    /// bad config file can be fixed in one pass.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.pool.max_connections == 0 {
            problems.push("pool.max_connections must be at least 1".to_string());
        }
        if self.pool.min_connections > self.pool.max_connections {
            problems.push(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            ));
        }
        if self.pool.connection_timeout_secs == 0 {
            problems.push("pool.connection_timeout_secs must be positive".to_string());
        }

        if self.batch.max_batch_size == 0 {
            problems.push("batch.max_batch_size must be at least 1".to_string());
        }
        if self.batch.max_queue_length < self.batch.max_batch_size {
            problems.push(format!(
                "batch.max_queue_length ({}) is smaller than batch.max_batch_size ({})",
                self.batch.max_queue_length, self.batch.max_batch_size
            ));
        }
        if self.batch.batch_timeout_ms == 0 {
            problems.push("batch.batch_timeout_ms must be positive".to_string());
        }

        if self.recovery.max_retry_attempts == 0 {
            problems.push("recovery.max_retry_attempts must be at least 1".to_string());
        }
        if self.recovery.recovery_timeout_secs == 0 {
            problems.push("recovery.recovery_timeout_secs must be positive".to_string());
        }
        if self.recovery.max_recovery_queue_size == 0 {
            problems.push("recovery.max_recovery_queue_size must be at least 1".to_string());
        }

        for (name, cache) in [
            ("caches.block", &self.caches.block),
            ("caches.transaction", &self.caches.transaction),
            ("caches.balance", &self.caches.balance),
        ] {
            if cache.ttl_secs == 0 {
                problems.push(format!("{}.ttl_secs must be positive", name));
            }
        }

        if self.maintenance_interval_secs == 0 {
            problems.push("maintenance_interval_secs must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ClientError::Config(problems.join("; ")))
        }
    }

    /// The maintenance cadence as a duration.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.caches.block.max_size, 1000);
        assert_eq!(config.caches.transaction.max_size, 10_000);
        assert_eq!(config.caches.balance.ttl_secs, 30);
        assert_eq!(config.pool.max_connections, 100);
        assert_eq!(config.batch.batch_timeout_ms, 100);
        assert!(config.recovery.auto_recover);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config.pool.min_connections, 10);
        assert_eq!(config.maintenance_interval_secs, 10);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: ClientConfig = toml::from_str(
            r#"
            [pool]
            min_connections = 2
            max_connections = 8

            [caches.block]
            max_size = 50
            ttl_secs = 10

            [recovery]
            auto_recover = false
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.min_connections, 2);
        assert_eq!(config.pool.max_connections, 8);
        assert_eq!(config.caches.block.max_size, 50);
        // Untouched sections keep their defaults.
        assert_eq!(config.caches.transaction.max_size, 10_000);
        assert!(!config.recovery.auto_recover);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let mut config = ClientConfig::default();
        config.pool.min_connections = 10;
        config.pool.max_connections = 2;
        config.batch.max_batch_size = 0;
        config.caches.block.ttl_secs = 0;

        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("min_connections"));
        assert!(message.contains("max_batch_size"));
        assert!(message.contains("caches.block.ttl_secs"));
    }

    #[test]
    fn test_queue_shorter_than_batch_rejected() {
        let mut config = ClientConfig::default();
        config.batch.max_batch_size = 100;
        config.batch.max_queue_length = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pool]\nmax_connections = 4\nmin_connections = 1"
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.max_connections, 4);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmax_connections = 0").unwrap();

        let err = ClientConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Info.to_tracing_level(), tracing::Level::INFO);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }

    #[test]
    fn test_duration_accessors() {
        let config = ClientConfig::default();
        assert_eq!(config.pool.connection_timeout(), Duration::from_secs(30));
        assert_eq!(config.caches.balance.ttl(), Duration::from_secs(30));
        assert_eq!(config.maintenance_interval(), Duration::from_secs(10));
    }
}
