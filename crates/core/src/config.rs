use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EtlError;
use crate::schedule::{lease_duration, parse_cron, parse_duration};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> Result<usize, EtlError> {
    match profiled_env_opt(profile, key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| EtlError::Config(format!("{key} must be a positive integer, got {v:?}"))),
        None => Ok(default),
    }
}

fn profiled_env_duration(profile: &str, key: &str, default: &str) -> Result<Duration, EtlError> {
    let raw = profiled_env_or(profile, key, default);
    parse_duration(&raw).map_err(|_| EtlError::Config(format!("{key} is not a valid duration: {raw:?}")))
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub store: StoreConfig,
    pub source: SourceConfig,
    pub lease: LeaseConfig,
    pub trigger: TriggerConfig,
    pub worker: WorkerConfig,
    pub transform: TransformConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `ETL_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, EtlError> {
        let profile = env_or("ETL_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, EtlError> {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Ok(Self {
            profile: p.to_string(),
            store: StoreConfig::from_env_profiled(p),
            source: SourceConfig::from_env_profiled(p)?,
            lease: LeaseConfig::from_env_profiled(p)?,
            trigger: TriggerConfig::from_env_profiled(p),
            worker: WorkerConfig::from_env_profiled(p),
            transform: TransformConfig::from_env_profiled(p)?,
        })
    }

    /// Reject settings that would let the pipeline misbehave at runtime.
    ///
    /// The source request timeout must be strictly shorter than the lease
    /// duration, otherwise a hung source can outlive the lease and a second
    /// holder takes over while the first is still saving.
    pub fn validate(&self) -> Result<(), EtlError> {
        if self.lease.timeout.is_zero() {
            return Err(EtlError::Config("LEASE_TIMEOUT must be greater than zero".into()));
        }
        lease_duration(self.lease.timeout)?;
        if self.source.request_timeout >= self.lease.timeout {
            return Err(EtlError::Config(format!(
                "SOURCE_TIMEOUT ({}s) must be shorter than LEASE_TIMEOUT ({}s)",
                self.source.request_timeout.as_secs(),
                self.lease.timeout.as_secs()
            )));
        }
        if self.transform.batch_size == 0 {
            return Err(EtlError::Config("TRANSFORM_BATCH_SIZE must be greater than zero".into()));
        }
        parse_cron(&self.trigger.schedule)?;
        Ok(())
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  store:     endpoint={}, database={}, key={}",
            self.store.endpoint,
            self.store.database,
            if self.store.key.is_some() { "(set)" } else { "(none)" }
        );
        tracing::info!(
            "  source:    endpoint={}, timeout={}s",
            self.source.endpoint,
            self.source.request_timeout.as_secs()
        );
        tracing::info!("  lease:     timeout={}s", self.lease.timeout.as_secs());
        tracing::info!("  trigger:   schedule={}", self.trigger.schedule);
        tracing::info!("  worker:    location={}", self.worker.location());
        tracing::info!(
            "  transform: batch_size={}, poll_interval={}ms",
            self.transform.batch_size,
            self.transform.poll_interval.as_millis()
        );
    }
}

// ── Document store ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub endpoint: String,
    pub database: String,
    pub key: Option<String>,
}

impl StoreConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            endpoint: profiled_env_or(p, "STORE_ENDPOINT", "http://localhost:8081"),
            database: profiled_env_or(p, "STORE_DATABASE", "documents"),
            key: profiled_env_opt(p, "STORE_KEY"),
        }
    }
}

// ── External source ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub endpoint: String,
    /// Query string resolved against `endpoint`, e.g. `?code=...&count=20`.
    pub params: String,
    pub request_timeout: Duration,
}

impl SourceConfig {
    fn from_env_profiled(p: &str) -> Result<Self, EtlError> {
        Ok(Self {
            endpoint: profiled_env_or(p, "EXTERNAL_ENDPOINT", "http://localhost:7071/api/list"),
            params: profiled_env_or(p, "EXTERNAL_ENDPOINT_PARAMS", ""),
            request_timeout: profiled_env_duration(p, "SOURCE_TIMEOUT", "30s")?,
        })
    }
}

// ── Lease ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How long a holder may keep the lease before it is considered stale.
    /// Must exceed the slowest expected orchestration run.
    pub timeout: Duration,
}

impl LeaseConfig {
    fn from_env_profiled(p: &str) -> Result<Self, EtlError> {
        Ok(Self {
            timeout: profiled_env_duration(p, "LEASE_TIMEOUT", "5m")?,
        })
    }
}

// ── Trigger ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Cron expression, 5 or 6 fields.
    pub schedule: String,
}

impl TriggerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            schedule: profiled_env_or(p, "TRIGGER_SCHEDULE", "0 */2 * * * *"),
        }
    }
}

// ── Worker identity ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub preferred_locations: Vec<String>,
}

impl WorkerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self::from_locations(&profiled_env_or(p, "PREFERRED_LOCATIONS", "local"))
    }

    /// Split a comma-separated location list, dropping blank entries.
    pub fn from_locations(raw: &str) -> Self {
        Self {
            preferred_locations: raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    /// Label stamped on leases, runs, and transformed records.
    pub fn location(&self) -> &str {
        self.preferred_locations
            .first()
            .map(String::as_str)
            .unwrap_or("local")
    }
}

// ── Transform worker ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl TransformConfig {
    fn from_env_profiled(p: &str) -> Result<Self, EtlError> {
        Ok(Self {
            batch_size: profiled_env_usize(p, "TRANSFORM_BATCH_SIZE", 10)?,
            poll_interval: profiled_env_duration(p, "TRANSFORM_POLL_INTERVAL", "1s")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            profile: String::new(),
            store: StoreConfig {
                endpoint: "http://localhost:8081".into(),
                database: "documents".into(),
                key: None,
            },
            source: SourceConfig {
                endpoint: "http://localhost:7071/api/list".into(),
                params: String::new(),
                request_timeout: Duration::from_secs(30),
            },
            lease: LeaseConfig {
                timeout: Duration::from_secs(300),
            },
            trigger: TriggerConfig {
                schedule: "0 */2 * * * *".into(),
            },
            worker: WorkerConfig::from_locations("West Europe, North Europe"),
            transform: TransformConfig {
                batch_size: 10,
                poll_interval: Duration::from_secs(1),
            },
        }
    }

    #[test]
    fn sample_config_is_valid() {
        sample().validate().unwrap();
    }

    #[test]
    fn source_timeout_must_be_shorter_than_lease() {
        let mut config = sample();
        config.source.request_timeout = Duration::from_secs(300);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("SOURCE_TIMEOUT"));
    }

    #[test]
    fn zero_lease_timeout_rejected() {
        let mut config = sample();
        config.lease.timeout = Duration::ZERO;
        config.source.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_lease_timeout_rejected() {
        let mut config = sample();
        config.lease.timeout = Duration::from_secs(u64::MAX);
        assert!(matches!(config.validate(), Err(EtlError::LeaseTimeout(_))));

        config.lease.timeout = Duration::from_secs(400 * 86_400);
        assert!(matches!(config.validate(), Err(EtlError::LeaseTimeout(_))));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut config = sample();
        config.transform.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_cron_rejected() {
        let mut config = sample();
        config.trigger.schedule = "every two minutes".into();
        assert!(matches!(config.validate(), Err(EtlError::InvalidCron { .. })));
    }

    #[test]
    fn worker_location_is_first_preferred() {
        let worker = WorkerConfig::from_locations("West Europe, North Europe");
        assert_eq!(worker.location(), "West Europe");
        assert_eq!(worker.preferred_locations.len(), 2);
    }

    #[test]
    fn worker_location_defaults_when_empty() {
        let worker = WorkerConfig::from_locations(" , ");
        assert!(worker.preferred_locations.is_empty());
        assert_eq!(worker.location(), "local");
    }

    #[test]
    fn profiled_lookup_prefers_prefixed_key() {
        std::env::set_var("ETLTEST_LEASE_TIMEOUT", "7m");
        std::env::set_var("ETLTEST_TRANSFORM_BATCH_SIZE", "25");
        let config = Config::for_profile("etltest").unwrap();
        assert_eq!(config.profile, "ETLTEST");
        assert_eq!(config.lease.timeout, Duration::from_secs(420));
        assert_eq!(config.transform.batch_size, 25);
        std::env::remove_var("ETLTEST_LEASE_TIMEOUT");
        std::env::remove_var("ETLTEST_TRANSFORM_BATCH_SIZE");
    }

    #[test]
    fn malformed_duration_is_config_error() {
        std::env::set_var("BADDUR_SOURCE_TIMEOUT", "soon");
        let err = Config::for_profile("baddur").unwrap_err();
        assert!(matches!(err, EtlError::Config(msg) if msg.contains("SOURCE_TIMEOUT")));
        std::env::remove_var("BADDUR_SOURCE_TIMEOUT");
    }
}
