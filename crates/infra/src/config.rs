//! Configuration loading and representation.
//!
//! Values come from environment variables. Anything missing or unparsable
//! falls back to its default with a warning, except `DATABASE_URL`, which is
//! required when persistent stores are enabled.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use docpipe_jobs::DEFAULT_MAX_RETRIES;

use crate::pipeline::{PipelineConfig, RetryPolicy};
use crate::queue::QueueConfig;
use crate::workers::WorkerPoolConfig;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

/// Where jobs are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    InMemory,
    Postgres { database_url: String },
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub default_max_retries: u32,
    pub persistence: Persistence,
    pub workers: WorkerPoolConfig,
    pub pipeline: PipelineConfig,
    pub queue: QueueConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            default_max_retries: DEFAULT_MAX_RETRIES,
            persistence: Persistence::InMemory,
            workers: WorkerPoolConfig::default(),
            pipeline: PipelineConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env(lookup);

        let persistence = if env.parse("USE_PERSISTENT_STORES", false) {
            let database_url = env
                .get("DATABASE_URL")
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            Persistence::Postgres { database_url }
        } else {
            Persistence::InMemory
        };

        let workers = WorkerPoolConfig {
            workers: env.parse("DOCPIPE_WORKERS", defaults.workers.workers).max(1),
            poll_interval: Duration::from_millis(env.parse(
                "DOCPIPE_POLL_INTERVAL_MS",
                defaults.workers.poll_interval.as_millis() as u64,
            )),
            lease_timeout: env.secs("DOCPIPE_LEASE_TIMEOUT_SECS", defaults.workers.lease_timeout),
            shutdown_grace: env.secs("DOCPIPE_SHUTDOWN_GRACE_SECS", defaults.workers.shutdown_grace),
            ..defaults.workers
        };

        let retry = defaults.pipeline.retry_policy;
        let pipeline = PipelineConfig {
            stage_timeout: env.secs("DOCPIPE_STAGE_TIMEOUT_SECS", defaults.pipeline.stage_timeout),
            retry_policy: RetryPolicy {
                strategy: env.parse("DOCPIPE_RETRY_BACKOFF", retry.strategy),
                base_delay: Duration::from_millis(
                    env.parse("DOCPIPE_RETRY_BASE_DELAY_MS", retry.base_delay.as_millis() as u64),
                ),
                max_delay: env.secs("DOCPIPE_RETRY_MAX_DELAY_SECS", retry.max_delay),
                jitter_percent: env.parse("DOCPIPE_RETRY_JITTER_PERCENT", retry.jitter_percent),
            },
            ..defaults.pipeline
        };

        Ok(Self {
            bind_addr: env.parse("DOCPIPE_BIND_ADDR", defaults.bind_addr),
            default_max_retries: env.parse("DOCPIPE_MAX_RETRIES", defaults.default_max_retries),
            persistence,
            workers,
            pipeline,
            queue: QueueConfig {
                max_deliveries: env.parse("DOCPIPE_MAX_DELIVERIES", defaults.queue.max_deliveries),
            },
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Debug,
    {
        let Some(raw) = self.get(key) else {
            return default;
        };
        match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = ?default, "invalid config value, using default");
                default
            }
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(key, default.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BackoffStrategy;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.workers.workers, 4);
        assert_eq!(config.workers.poll_interval, Duration::from_millis(200));
        assert_eq!(config.workers.lease_timeout, Duration::from_secs(60));
        assert_eq!(config.pipeline.stage_timeout, Duration::from_secs(300));
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.queue.max_deliveries, 10);
        assert_eq!(config.persistence, Persistence::InMemory);
        assert_eq!(config.pipeline.retry_policy, RetryPolicy::default());
    }

    #[test]
    fn requeue_backoff_is_configurable() {
        let config = load(&[
            ("DOCPIPE_RETRY_BACKOFF", "fixed"),
            ("DOCPIPE_RETRY_BASE_DELAY_MS", "250"),
            ("DOCPIPE_RETRY_MAX_DELAY_SECS", "2"),
            ("DOCPIPE_RETRY_JITTER_PERCENT", "0"),
        ])
        .unwrap();
        let policy = config.pipeline.retry_policy;
        assert_eq!(policy.strategy, BackoffStrategy::Fixed);
        assert_eq!(policy.requeue_delay(4), Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(2));

        let config = load(&[("DOCPIPE_RETRY_BACKOFF", "linear")]).unwrap();
        assert_eq!(config.pipeline.retry_policy.strategy, BackoffStrategy::Exponential);
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("DOCPIPE_BIND_ADDR", "127.0.0.1:9000"),
            ("DOCPIPE_WORKERS", "8"),
            ("DOCPIPE_STAGE_TIMEOUT_SECS", "30"),
            ("DOCPIPE_MAX_RETRIES", "5"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.workers.workers, 8);
        assert_eq!(config.pipeline.stage_timeout, Duration::from_secs(30));
        assert_eq!(config.default_max_retries, 5);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = load(&[("DOCPIPE_WORKERS", "many"), ("DOCPIPE_WORKERS_X", "1")]).unwrap();
        assert_eq!(config.workers.workers, 4);

        let config = load(&[("DOCPIPE_WORKERS", "0")]).unwrap();
        assert_eq!(config.workers.workers, 1);
    }

    #[test]
    fn persistent_stores_need_database_url() {
        assert_eq!(
            load(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );

        let config = load(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/docpipe"),
        ])
        .unwrap();
        assert_eq!(
            config.persistence,
            Persistence::Postgres {
                database_url: "postgres://localhost/docpipe".to_string()
            }
        );
    }
}
