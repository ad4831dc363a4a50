use std::time::Duration;

use crate::jobs::{DispatcherConfig, QueueConfig, RetryConfig, WorkerConfig};

/// Runtime configuration, read from `JOBFLOW_*` environment variables with
/// unprefixed fallbacks. `.env` is honoured.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub queue: String,
    /// Key prefix for everything this deployment writes to the store.
    pub namespace: String,

    pub lease_seconds: u64,
    pub heartbeat_interval_ms: u64,
    pub max_attempts: u32,
    pub result_ttl_secs: u64,
    pub failure_ttl_secs: u64,
    pub dequeue_timeout_ms: u64,
    pub reap_interval_ms: u64,
    pub reap_batch_size: usize,
    pub concurrency: usize,

    pub api_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub max_payload_bytes: usize,
    pub default_job_type: String,
    pub process_job_delay_ms: u64,
    pub purge_interval_secs: u64,

    pub store_retry: RetryConfig,
    pub pool: PoolSettings,
}

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub disable_sync_commit: bool,
    pub disable_jit: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(get);

        let database_url = env
            .first(&["JOBFLOW_DATABASE_URL", "DATABASE_URL"])
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env
            .first(&["JOBFLOW_WORKER_ID", "WORKER_ID", "HOSTNAME"])
            .unwrap_or_else(|| "worker-1".to_string());

        let queue = env
            .first(&["JOBFLOW_QUEUE", "QUEUE"])
            .unwrap_or_else(|| "default".to_string());

        let namespace = env
            .first(&["JOBFLOW_NAMESPACE"])
            .unwrap_or_else(|| "jobflow".to_string());

        let lease_seconds: u64 = env.parse(&["JOBFLOW_LEASE_SECONDS", "LEASE_SECONDS"], 30)?;
        let heartbeat_interval_ms: u64 = env.parse(
            &["JOBFLOW_HEARTBEAT_INTERVAL_MS"],
            lease_seconds.saturating_mul(1000) / 3,
        )?;

        let store_retry = RetryConfig {
            max_attempts: env.parse(&["JOBFLOW_STORE_RETRY_ATTEMPTS"], 5)?,
            base_ms: env.parse(&["JOBFLOW_STORE_RETRY_BASE_MS"], 50)?,
            max_ms: env.parse(&["JOBFLOW_STORE_RETRY_MAX_MS"], 2_000)?,
            jitter_pct: env.parse(&["JOBFLOW_STORE_RETRY_JITTER_PCT"], 0.20)?,
        };

        let pool = PoolSettings {
            max_connections: env
                .parse::<u32>(&["JOBFLOW_DB_MAX_CONNECTIONS"], 8)?
                .clamp(1, 64),
            acquire_timeout_secs: env
                .parse::<u64>(&["JOBFLOW_DB_ACQUIRE_TIMEOUT_SECS"], 10)?
                .clamp(1, 60),
            disable_sync_commit: env.flag("JOBFLOW_DISABLE_SYNC_COMMIT").unwrap_or(false),
            disable_jit: env.flag("JOBFLOW_DISABLE_JIT").unwrap_or(true),
        };

        let cfg = Self {
            database_url,
            worker_id,
            queue,
            namespace,
            lease_seconds,
            heartbeat_interval_ms,
            max_attempts: env.parse(&["JOBFLOW_MAX_ATTEMPTS", "MAX_ATTEMPTS"], 3)?,
            result_ttl_secs: env.parse(&["JOBFLOW_RESULT_TTL_SECS", "RESULT_TTL"], 500)?,
            failure_ttl_secs: env.parse(&["JOBFLOW_FAILURE_TTL_SECS", "FAILURE_TTL"], 31_536_000)?,
            dequeue_timeout_ms: env.parse(&["JOBFLOW_DEQUEUE_TIMEOUT_MS"], 5_000)?,
            reap_interval_ms: env.parse(&["JOBFLOW_REAP_INTERVAL_MS", "REAP_INTERVAL_MS"], 5_000)?,
            reap_batch_size: env.parse(&["JOBFLOW_REAP_BATCH_SIZE"], 500)?,
            concurrency: env.parse(&["JOBFLOW_CONCURRENCY", "CONCURRENCY"], 1)?,
            api_addr: env
                .first(&["JOBFLOW_API_ADDR", "API_ADDR"])
                .and_then(|s| normalize_optional_addr(&s)),
            migrate_on_startup: env.flag("JOBFLOW_MIGRATE_ON_STARTUP").unwrap_or(false),
            max_payload_bytes: env.parse(&["JOBFLOW_MAX_PAYLOAD_BYTES", "MAX_PAYLOAD_BYTES"], 256 * 1024)?,
            default_job_type: env
                .first(&["JOBFLOW_DEFAULT_JOB_TYPE"])
                .unwrap_or_else(|| "process_job".to_string()),
            process_job_delay_ms: env.parse(&["JOBFLOW_PROCESS_JOB_DELAY_MS"], 5_000)?,
            purge_interval_secs: env.parse(&["JOBFLOW_PURGE_INTERVAL_SECS"], 60)?,
            store_retry,
            pool,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.lease_seconds >= 1, "lease_seconds must be at least 1");
        anyhow::ensure!(
            self.heartbeat_interval_ms >= 1 && self.heartbeat_interval_ms < self.lease_seconds * 1000,
            "heartbeat_interval_ms ({}) must be below the lease ({}s)",
            self.heartbeat_interval_ms,
            self.lease_seconds
        );
        anyhow::ensure!(self.max_attempts >= 1, "max_attempts must be at least 1");
        anyhow::ensure!(self.concurrency >= 1, "concurrency must be at least 1");
        anyhow::ensure!(self.store_retry.max_attempts >= 1, "store retry attempts must be at least 1");
        anyhow::ensure!(!self.queue.trim().is_empty(), "queue name must not be empty");
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            name: self.queue.clone(),
            lease_duration: Duration::from_secs(self.lease_seconds),
            max_attempts: self.max_attempts,
            result_ttl: Duration::from_secs(self.result_ttl_secs),
            failure_ttl: Duration::from_secs(self.failure_ttl_secs),
            retry: self.store_retry.clone(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            dequeue_timeout: Duration::from_millis(self.dequeue_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            retry: self.store_retry.clone(),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_payload_bytes: self.max_payload_bytes,
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// First non-blank value among `keys`.
    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|k| (self.0)(k))
            .find(|v| !v.trim().is_empty())
            .map(|v| v.trim().to_string())
    }

    fn parse<T>(&self, keys: &[&str], default: T) -> anyhow::Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.first(keys) {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid value {raw:?} for {}: {e}", keys[0])),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.first(&[key])
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_follow_the_documented_values() {
        let cfg = load(&[("DATABASE_URL", "postgres://localhost/jobflow")]).unwrap();
        assert_eq!(cfg.queue, "default");
        assert_eq!(cfg.lease_seconds, 30);
        assert_eq!(cfg.heartbeat_interval_ms, 10_000);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.result_ttl_secs, 500);
        assert_eq!(cfg.default_job_type, "process_job");
        assert_eq!(cfg.api_addr, None);
        assert_eq!(cfg.queue_config().lease_duration, Duration::from_secs(30));
    }

    #[test]
    fn prefixed_values_win_over_fallbacks() {
        let cfg = load(&[
            ("DATABASE_URL", "postgres://fallback"),
            ("JOBFLOW_DATABASE_URL", "postgres://primary"),
            ("QUEUE", "emails"),
            ("JOBFLOW_LEASE_SECONDS", "9"),
            ("JOBFLOW_API_ADDR", "off"),
            ("JOBFLOW_MIGRATE_ON_STARTUP", "yes"),
        ])
        .unwrap();
        assert_eq!(cfg.database_url, "postgres://primary");
        assert_eq!(cfg.queue, "emails");
        assert_eq!(cfg.heartbeat_interval_ms, 3_000);
        assert_eq!(cfg.api_addr, None);
        assert!(cfg.migrate_on_startup);
    }

    #[test]
    fn bad_values_are_reported() {
        assert!(load(&[]).is_err());
        assert!(load(&[("DATABASE_URL", "x"), ("JOBFLOW_MAX_ATTEMPTS", "many")]).is_err());
        assert!(load(&[("DATABASE_URL", "x"), ("JOBFLOW_MAX_ATTEMPTS", "0")]).is_err());
        assert!(load(&[
            ("DATABASE_URL", "x"),
            ("JOBFLOW_LEASE_SECONDS", "2"),
            ("JOBFLOW_HEARTBEAT_INTERVAL_MS", "5000"),
        ])
        .is_err());
    }
}
