//! Configuration for the lease engine.
//!
//! Configuration is read from an optional YAML file, then overridden by
//! `WORKQ_*` environment variables, then validated. Invalid settings are fatal
//! at startup: nothing in the engine falls back to a default at runtime.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A priority class and its fairness weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityWeight {
    /// Priority name, used in key names (`queue:ready:{name}`).
    pub name: String,
    /// Claims granted to this priority per fairness cycle.
    pub weight: i64,
}

impl PriorityWeight {
    pub fn new(name: impl Into<String>, weight: i64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Lease and heartbeat timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease TTL granted on claim and on every renewal.
    pub ttl_ms: u64,
    /// Lower bound of the jittered renewal interval.
    pub renewal_min_ms: u64,
    /// Upper bound of the jittered renewal interval.
    pub renewal_max_ms: u64,
    /// How long a claim may block waiting for a job.
    pub claim_timeout_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            renewal_min_ms: 8_000,
            renewal_max_ms: 12_000,
            claim_timeout_ms: 1_000,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}

/// Worker process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of fetch loops in this process.
    pub count: usize,
    /// Retry budget given to jobs enqueued without an explicit one.
    pub max_attempts: u32,
    /// Base delay of the exponential retry backoff after a handler failure.
    pub backoff_base_ms: u64,
    /// Cap of the retry backoff.
    pub backoff_max_ms: u64,
    /// How long shutdown waits for an in-flight handler before releasing its lease.
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

/// Reaper loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub scan_interval_ms: u64,
    /// A registry entry older than this is considered stale.
    pub liveness_timeout_ms: u64,
    /// Maximum stale entries handled per scan.
    pub scan_batch: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_ms: 5_000,
            liveness_timeout_ms: 60_000,
            scan_batch: 100,
        }
    }
}

/// Scheduled job mover settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoverConfig {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    /// Maximum jobs promoted per priority per tick.
    pub batch_limit: usize,
}

impl Default for MoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 1_000,
            batch_limit: 500,
        }
    }
}

/// Idempotent completion gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub enabled: bool,
    /// Lifetime of an idempotency record. Duplicate suppression is bounded by it.
    pub ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

/// Circuit breaker settings for the fetch loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failure rate in the window at which the breaker opens.
    pub failure_threshold: f64,
    pub window_ms: u64,
    pub cooldown_ms: u64,
    /// Results required in the window before the rate is trusted.
    pub min_samples: usize,
    /// Sleep between fetch attempts while the breaker refuses work.
    pub pause_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            min_samples: 20,
            pause_ms: 100,
        }
    }
}

/// Backoff applied to transient store errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_ms: 50,
            max_ms: 2_000,
        }
    }
}

/// Complete configuration consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix of queue keys.
    pub namespace: String,
    /// Prefix of idempotency record keys.
    pub idempotency_namespace: String,
    /// Priorities in declared (scan) order.
    pub priorities: Vec<PriorityWeight>,
    pub lease: LeaseConfig,
    pub worker: WorkerConfig,
    pub reaper: ReaperConfig,
    pub mover: MoverConfig,
    pub idempotency: IdempotencyConfig,
    pub breaker: BreakerConfig,
    pub store_retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "queue".to_string(),
            idempotency_namespace: "idem".to_string(),
            priorities: vec![
                PriorityWeight::new("high", 8),
                PriorityWeight::new("medium", 2),
                PriorityWeight::new("low", 1),
            ],
            lease: LeaseConfig::default(),
            worker: WorkerConfig::default(),
            reaper: ReaperConfig::default(),
            mover: MoverConfig::default(),
            idempotency: IdempotencyConfig::default(),
            breaker: BreakerConfig::default(),
            store_retry: RetryConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file (if it exists), applies environment
    /// overrides and validates the result.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be parsed, an override is
    /// malformed, or validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_yaml(&content)?
        } else {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from YAML. Missing keys take their defaults.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Creates configuration from defaults plus environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `WORKQ_REDIS_URL`: Redis connection URL
    /// - `WORKQ_NAMESPACE`: Queue key prefix
    /// - `WORKQ_PRIORITIES`: Comma-separated `name:weight` list, e.g. `high:8,low:1`
    /// - `WORKQ_WORKER_COUNT`: Fetch loops per process
    /// - `WORKQ_LEASE_TTL_MS`: Lease TTL
    /// - `WORKQ_RENEWAL_MIN_MS` / `WORKQ_RENEWAL_MAX_MS`: Renewal jitter bounds
    /// - `WORKQ_REAPER_ENABLED` / `WORKQ_MOVER_ENABLED`: Background loops
    /// - `WORKQ_LIVENESS_TIMEOUT_MS`: Registry staleness threshold
    /// - `WORKQ_IDEMPOTENCY_TTL_MS`: Idempotency record TTL
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("WORKQ_REDIS_URL") {
            self.redis_url = val;
        }
        if let Ok(val) = std::env::var("WORKQ_NAMESPACE") {
            self.namespace = val;
        }
        if let Ok(val) = std::env::var("WORKQ_PRIORITIES") {
            self.priorities = parse_priorities(&val)?;
        }
        if let Ok(val) = std::env::var("WORKQ_WORKER_COUNT") {
            self.worker.count = parse_env("WORKQ_WORKER_COUNT", &val)?;
        }
        if let Ok(val) = std::env::var("WORKQ_LEASE_TTL_MS") {
            self.lease.ttl_ms = parse_env("WORKQ_LEASE_TTL_MS", &val)?;
        }
        if let Ok(val) = std::env::var("WORKQ_RENEWAL_MIN_MS") {
            self.lease.renewal_min_ms = parse_env("WORKQ_RENEWAL_MIN_MS", &val)?;
        }
        if let Ok(val) = std::env::var("WORKQ_RENEWAL_MAX_MS") {
            self.lease.renewal_max_ms = parse_env("WORKQ_RENEWAL_MAX_MS", &val)?;
        }
        if let Ok(val) = std::env::var("WORKQ_REAPER_ENABLED") {
            self.reaper.enabled = parse_env("WORKQ_REAPER_ENABLED", &val)?;
        }
        if let Ok(val) = std::env::var("WORKQ_MOVER_ENABLED") {
            self.mover.enabled = parse_env("WORKQ_MOVER_ENABLED", &val)?;
        }
        if let Ok(val) = std::env::var("WORKQ_LIVENESS_TIMEOUT_MS") {
            self.reaper.liveness_timeout_ms = parse_env("WORKQ_LIVENESS_TIMEOUT_MS", &val)?;
        }
        if let Ok(val) = std::env::var("WORKQ_IDEMPOTENCY_TTL_MS") {
            self.idempotency.ttl_ms = parse_env("WORKQ_IDEMPOTENCY_TTL_MS", &val)?;
        }
        Ok(())
    }

    /// Validates every constraint the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.priorities.is_empty() {
            return Err(ConfigError::invalid("priorities", "must be non-empty"));
        }
        let mut seen = HashSet::new();
        for p in &self.priorities {
            if p.name.is_empty() || p.name.contains(':') || p.name.chars().any(char::is_whitespace)
            {
                return Err(ConfigError::invalid(
                    "priorities",
                    format!("invalid priority name '{}'", p.name),
                ));
            }
            if p.weight <= 0 {
                return Err(ConfigError::InvalidWeight {
                    name: p.name.clone(),
                    weight: p.weight,
                });
            }
            if !seen.insert(p.name.as_str()) {
                return Err(ConfigError::DuplicatePriority(p.name.clone()));
            }
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::invalid("namespace", "must be non-empty"));
        }
        if self.idempotency_namespace.is_empty() {
            return Err(ConfigError::invalid(
                "idempotency_namespace",
                "must be non-empty",
            ));
        }

        let lease = &self.lease;
        if lease.ttl_ms == 0 {
            return Err(ConfigError::LeaseTiming("ttl_ms must be > 0".to_string()));
        }
        if lease.renewal_min_ms == 0 || lease.renewal_min_ms > lease.renewal_max_ms {
            return Err(ConfigError::LeaseTiming(format!(
                "renewal bounds [{}, {}] must satisfy 0 < min <= max",
                lease.renewal_min_ms, lease.renewal_max_ms
            )));
        }
        // A single missed renewal must not lose the lease.
        if lease.renewal_max_ms.saturating_mul(2) >= lease.ttl_ms {
            return Err(ConfigError::LeaseTiming(format!(
                "renewal_max_ms ({}) must be < ttl_ms / 2 ({})",
                lease.renewal_max_ms,
                lease.ttl_ms / 2
            )));
        }
        if lease.claim_timeout_ms == 0 || lease.claim_timeout_ms.saturating_mul(2) >= lease.ttl_ms {
            return Err(ConfigError::LeaseTiming(format!(
                "claim_timeout_ms ({}) must be > 0 and < ttl_ms / 2",
                lease.claim_timeout_ms
            )));
        }

        if self.worker.count == 0 {
            return Err(ConfigError::invalid("worker.count", "must be >= 1"));
        }
        if self.worker.max_attempts == 0 {
            return Err(ConfigError::invalid("worker.max_attempts", "must be >= 1"));
        }
        if self.worker.backoff_base_ms > self.worker.backoff_max_ms {
            return Err(ConfigError::invalid(
                "worker.backoff_base_ms",
                "must be <= worker.backoff_max_ms",
            ));
        }

        if self.reaper.scan_interval_ms == 0 || self.reaper.scan_batch == 0 {
            return Err(ConfigError::invalid(
                "reaper",
                "scan_interval_ms and scan_batch must be > 0",
            ));
        }
        if self.reaper.liveness_timeout_ms < lease.ttl_ms {
            return Err(ConfigError::invalid(
                "reaper.liveness_timeout_ms",
                format!("must be >= lease.ttl_ms ({})", lease.ttl_ms),
            ));
        }
        if self.mover.tick_interval_ms == 0 || self.mover.batch_limit == 0 {
            return Err(ConfigError::invalid(
                "mover",
                "tick_interval_ms and batch_limit must be > 0",
            ));
        }
        if self.idempotency.ttl_ms == 0 {
            return Err(ConfigError::invalid("idempotency.ttl_ms", "must be > 0"));
        }
        let threshold = self.breaker.failure_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "breaker.failure_threshold",
                "must be in (0, 1]",
            ));
        }
        if self.breaker.window_ms == 0 {
            return Err(ConfigError::invalid("breaker.window_ms", "must be > 0"));
        }
        if self.store_retry.base_ms > self.store_retry.max_ms {
            return Err(ConfigError::invalid(
                "store_retry.base_ms",
                "must be <= store_retry.max_ms",
            ));
        }
        Ok(())
    }

    /// Returns the priority names in declared order.
    pub fn priority_names(&self) -> Vec<String> {
        self.priorities.iter().map(|p| p.name.clone()).collect()
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the queue key prefix.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Replaces the priority table.
    pub fn with_priorities(mut self, priorities: Vec<PriorityWeight>) -> Self {
        self.priorities = priorities;
        self
    }

    /// Sets the number of fetch loops.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker.count = count;
        self
    }

    /// Sets lease TTL and renewal jitter bounds together.
    pub fn with_lease_timing(mut self, ttl: Duration, renewal_min: Duration, renewal_max: Duration) -> Self {
        self.lease.ttl_ms = ttl.as_millis() as u64;
        self.lease.renewal_min_ms = renewal_min.as_millis() as u64;
        self.lease.renewal_max_ms = renewal_max.as_millis() as u64;
        self
    }

    /// Sets the blocking claim timeout.
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.lease.claim_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets reaper scan interval and liveness timeout.
    pub fn with_reaper(mut self, scan_interval: Duration, liveness_timeout: Duration) -> Self {
        self.reaper.scan_interval_ms = scan_interval.as_millis() as u64;
        self.reaper.liveness_timeout_ms = liveness_timeout.as_millis() as u64;
        self
    }

    /// Sets mover tick interval and batch limit.
    pub fn with_mover(mut self, tick_interval: Duration, batch_limit: usize) -> Self {
        self.mover.tick_interval_ms = tick_interval.as_millis() as u64;
        self.mover.batch_limit = batch_limit;
        self
    }

    /// Sets the retry backoff used after handler failures.
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.worker.backoff_base_ms = base.as_millis() as u64;
        self.worker.backoff_max_ms = max.as_millis() as u64;
        self
    }

    /// Sets the idempotency record TTL.
    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency.ttl_ms = ttl.as_millis() as u64;
        self
    }
}

/// Parses `high:8,medium:2,low:1`.
pub fn parse_priorities(list: &str) -> Result<Vec<PriorityWeight>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (name, weight) = entry.split_once(':').ok_or_else(|| {
                ConfigError::invalid("priorities", format!("expected name:weight, got '{entry}'"))
            })?;
            let weight = weight.trim().parse::<i64>().map_err(|e| {
                ConfigError::invalid("priorities", format!("bad weight in '{entry}': {e}"))
            })?;
            Ok(PriorityWeight::new(name.trim(), weight))
        })
        .collect()
}

fn parse_env<T>(key: &str, val: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    val.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.priority_names(), vec!["high", "medium", "low"]);
        assert_eq!(config.lease.ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_weight_rejected() {
        let config = QueueConfig::default().with_priorities(vec![
            PriorityWeight::new("high", 8),
            PriorityWeight::new("low", 0),
        ]);
        match config.validate() {
            Err(ConfigError::InvalidWeight { name, weight }) => {
                assert_eq!(name, "low");
                assert_eq!(weight, 0);
            }
            other => panic!("expected InvalidWeight, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_weight_rejected() {
        let config =
            QueueConfig::default().with_priorities(vec![PriorityWeight::new("high", -3)]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let config = QueueConfig::default().with_priorities(vec![
            PriorityWeight::new("high", 2),
            PriorityWeight::new("high", 1),
        ]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePriority(_))
        ));
    }

    #[test]
    fn test_priority_name_with_colon_rejected() {
        let config = QueueConfig::default().with_priorities(vec![PriorityWeight::new("a:b", 1)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_renewal_interval_must_be_under_half_ttl() {
        let config = QueueConfig::default().with_lease_timing(
            Duration::from_secs(30),
            Duration::from_secs(10),
            Duration::from_secs(15),
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LeaseTiming(_))
        ));

        let config = QueueConfig::default().with_lease_timing(
            Duration::from_secs(30),
            Duration::from_secs(9),
            Duration::from_secs(14),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_renewal_bounds_ordered() {
        let config = QueueConfig::default().with_lease_timing(
            Duration::from_secs(30),
            Duration::from_secs(12),
            Duration::from_secs(8),
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LeaseTiming(_))
        ));
    }

    #[test]
    fn test_liveness_shorter_than_ttl_rejected() {
        let config = QueueConfig::default()
            .with_reaper(Duration::from_secs(5), Duration::from_secs(10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_with_partial_keys() {
        let yaml = r#"
redis_url: "redis://cache:6380"
priorities:
  - name: critical
    weight: 5
  - name: bulk
    weight: 1
lease:
  ttl_ms: 60000
  renewal_min_ms: 15000
  renewal_max_ms: 25000
mover:
  batch_limit: 50
"#;
        let config = QueueConfig::from_yaml(yaml).expect("yaml should parse");
        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.priority_names(), vec!["critical", "bulk"]);
        assert_eq!(config.lease.ttl_ms, 60_000);
        assert_eq!(config.lease.claim_timeout_ms, 1_000);
        assert_eq!(config.mover.batch_limit, 50);
        assert_eq!(config.mover.tick_interval_ms, 1_000);
        assert_eq!(config.worker.count, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("workq.yaml");
        std::fs::write(&path, "namespace: jobs\nworker:\n  count: 2\n")
            .expect("config should be written");

        let config = QueueConfig::load(&path).expect("config should load");
        assert_eq!(config.namespace, "jobs");
        assert_eq!(config.worker.count, 2);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("workq.yaml");
        std::fs::write(&path, "priorities:\n  - name: high\n    weight: 0\n")
            .expect("config should be written");

        assert!(matches!(
            QueueConfig::load(&path),
            Err(ConfigError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn test_parse_priorities() {
        let parsed = parse_priorities("high:8, medium:2 ,low:1").expect("should parse");
        assert_eq!(
            parsed,
            vec![
                PriorityWeight::new("high", 8),
                PriorityWeight::new("medium", 2),
                PriorityWeight::new("low", 1),
            ]
        );

        assert!(parse_priorities("high").is_err());
        assert!(parse_priorities("high:x").is_err());
    }

    #[test]
    fn test_builder_methods() {
        let config = QueueConfig::new()
            .with_redis_url("redis://other:6379")
            .with_namespace("jobs")
            .with_worker_count(8)
            .with_claim_timeout(Duration::from_millis(250))
            .with_mover(Duration::from_millis(200), 10)
            .with_retry_backoff(Duration::ZERO, Duration::from_secs(1))
            .with_idempotency_ttl(Duration::from_secs(60));

        assert_eq!(config.redis_url, "redis://other:6379");
        assert_eq!(config.namespace, "jobs");
        assert_eq!(config.worker.count, 8);
        assert_eq!(config.lease.claim_timeout(), Duration::from_millis(250));
        assert_eq!(config.mover.batch_limit, 10);
        assert_eq!(config.worker.backoff_base_ms, 0);
        assert_eq!(config.idempotency.ttl_ms, 60_000);
        assert!(config.validate().is_ok());
    }
}
