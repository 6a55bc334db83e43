//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use scheduler::{ArchiveSettings, SchedulerConfig, SweepSettings};

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SERVICE_NAME`: scopes idempotency keys and sweep locks (default: `"default"`)
/// - `DATABASE_URL`: PostgreSQL connection string; unset means in-memory stores
/// - `HOST` / `PORT`: bind address (default: `"0.0.0.0"` / `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `WORKER_POOL_SIZE`: concurrent handler executions (default: `4`)
/// - `NEAR_IMMEDIATE_SECS`: tasks due sooner than this run inline (default: `5`)
/// - `{TASK,EVENT,SAGA}_SWEEP_{BATCH_SIZE,MAX_CONCURRENCY,INTERVAL_SECS,MAX_LOCK_SECS}`
/// - `ARCHIVE_{BATCH_SIZE,GRACE_DAYS,INTERVAL_SECS,MAX_LOCK_SECS}`
/// - `PARTITION_INTERVAL_SECS`
///
/// Unparseable values fall back to the default, as do zero sizes and
/// intervals.
#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub worker_pool_size: usize,
    pub near_immediate: chrono::Duration,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let env = Env(&lookup);

        Self {
            service_name: env.string("SERVICE_NAME", defaults.service_name),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            host: env.string("HOST", defaults.host),
            port: env.parse("PORT", defaults.port),
            log_level: env.string("RUST_LOG", defaults.log_level),
            log_format: env.parse("LOG_FORMAT", defaults.log_format),
            worker_pool_size: env.positive("WORKER_POOL_SIZE", defaults.worker_pool_size),
            near_immediate: chrono::Duration::seconds(
                env.parse("NEAR_IMMEDIATE_SECS", defaults.near_immediate.num_seconds()),
            ),
            scheduler: SchedulerConfig {
                task: env.sweep("TASK_SWEEP", defaults.scheduler.task),
                event: env.sweep("EVENT_SWEEP", defaults.scheduler.event),
                saga: env.sweep("SAGA_SWEEP", defaults.scheduler.saga),
                archive: env.archive(defaults.scheduler.archive),
                partition_interval: env.secs(
                    "PARTITION_INTERVAL_SECS",
                    defaults.scheduler.partition_interval,
                ),
            },
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "default".to_string(),
            database_url: None,
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            worker_pool_size: 4,
            near_immediate: chrono::Duration::seconds(5),
            scheduler: SchedulerConfig::default(),
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, default: String) -> String {
        (self.0)(key)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(default)
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Like [`Self::parse`], but zero also keeps the default.
    fn positive<T: FromStr + Default + PartialEq>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|value| value.trim().parse().ok())
            .filter(|value| *value != T::default())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.positive(key, default.as_secs()))
    }

    fn sweep(&self, prefix: &str, default: SweepSettings) -> SweepSettings {
        SweepSettings {
            batch_size: self.positive(&format!("{prefix}_BATCH_SIZE"), default.batch_size),
            max_concurrency: self.positive(
                &format!("{prefix}_MAX_CONCURRENCY"),
                default.max_concurrency,
            ),
            interval: self.secs(&format!("{prefix}_INTERVAL_SECS"), default.interval),
            max_lock_duration: self.secs(
                &format!("{prefix}_MAX_LOCK_SECS"),
                default.max_lock_duration,
            ),
        }
    }

    fn archive(&self, default: ArchiveSettings) -> ArchiveSettings {
        ArchiveSettings {
            batch_size: self.positive("ARCHIVE_BATCH_SIZE", default.batch_size),
            grace: chrono::Duration::days(
                self.parse("ARCHIVE_GRACE_DAYS", default.grace.num_days()),
            ),
            interval: self.secs("ARCHIVE_INTERVAL_SECS", default.interval),
            max_lock_duration: self.secs("ARCHIVE_MAX_LOCK_SECS", default.max_lock_duration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.service_name, "default");
        assert!(config.database_url.is_none());
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.near_immediate, chrono::Duration::seconds(5));
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config.service_name, "default");
        assert_eq!(config.port, 3000);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_reads_service_settings() {
        let config = Config::from_lookup(lookup(&[
            ("SERVICE_NAME", "billing"),
            ("DATABASE_URL", "postgres://localhost/billing"),
            ("PORT", "8080"),
            ("LOG_FORMAT", "JSON"),
            ("WORKER_POOL_SIZE", "16"),
            ("NEAR_IMMEDIATE_SECS", "0"),
        ]));

        assert_eq!(config.service_name, "billing");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/billing")
        );
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.worker_pool_size, 16);
        assert_eq!(config.near_immediate, chrono::Duration::zero());
    }

    #[test]
    fn test_reads_sweep_settings() {
        let config = Config::from_lookup(lookup(&[
            ("TASK_SWEEP_BATCH_SIZE", "50"),
            ("TASK_SWEEP_INTERVAL_SECS", "30"),
            ("EVENT_SWEEP_MAX_LOCK_SECS", "10"),
            ("SAGA_SWEEP_MAX_CONCURRENCY", "3"),
            ("ARCHIVE_GRACE_DAYS", "30"),
            ("PARTITION_INTERVAL_SECS", "3600"),
        ]));

        let scheduler = config.scheduler;
        assert_eq!(scheduler.task.batch_size, 50);
        assert_eq!(scheduler.task.interval, Duration::from_secs(30));
        assert_eq!(scheduler.task.max_lock_duration, Duration::from_secs(300));
        assert_eq!(scheduler.event.max_lock_duration, Duration::from_secs(10));
        assert_eq!(scheduler.saga.max_concurrency, 3);
        assert_eq!(scheduler.archive.grace, chrono::Duration::days(30));
        assert_eq!(scheduler.archive.batch_size, 100);
        assert_eq!(scheduler.partition_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "not-a-port"),
            ("LOG_FORMAT", "xml"),
            ("SERVICE_NAME", "  "),
            ("DATABASE_URL", ""),
            ("TASK_SWEEP_BATCH_SIZE", "-1"),
        ]));

        assert_eq!(config.port, 3000);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.service_name, "default");
        assert!(config.database_url.is_none());
        assert_eq!(config.scheduler.task.batch_size, 10);
    }

    #[test]
    fn test_zero_sizes_and_intervals_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("WORKER_POOL_SIZE", "0"),
            ("TASK_SWEEP_BATCH_SIZE", "0"),
            ("TASK_SWEEP_INTERVAL_SECS", "0"),
            ("EVENT_SWEEP_MAX_LOCK_SECS", "0"),
            ("SAGA_SWEEP_MAX_CONCURRENCY", "0"),
            ("ARCHIVE_BATCH_SIZE", "0"),
            ("ARCHIVE_INTERVAL_SECS", "0"),
            ("PARTITION_INTERVAL_SECS", "0"),
        ]));

        let defaults = Config::default();
        assert_eq!(config.worker_pool_size, defaults.worker_pool_size);
        assert_eq!(config.scheduler, defaults.scheduler);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}
