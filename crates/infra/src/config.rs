//! Configuration loading and representation.
//!
//! Everything is read from environment variables with defaults; only the
//! database URL is mandatory, and only for the binary.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use thiserror::Error;

use chorus_ai::HttpGeneratorConfig;

use crate::jobs::RetryPolicy;
use crate::quota::QuotaLimits;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Run the bundled schema on startup.
    pub apply_schema: bool,
    pub worker_name: String,
    /// Sleep between scheduler ticks.
    pub poll_interval: Duration,
    /// Deadline for each task within a tick.
    pub task_timeout: Duration,
    /// Deadline for a single provider call; must leave room inside `task_timeout`.
    pub generation_timeout: Duration,
    pub retry: RetryPolicy,
    /// PROCESSING rows older than `task_timeout * reaper_safety_factor` are reclaimed.
    pub reaper_safety_factor: u32,
    pub quota: QuotaLimits,
    /// Upper bound of personas asked to reply to one post.
    pub reply_fanout_limit: usize,
    pub digest_activity_limit: usize,
    pub digest_top_k: usize,
    pub depth_report_interval: Duration,
    pub health_addr: SocketAddr,
    pub generator: HttpGeneratorConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            apply_schema: false,
            worker_name: "chorus-worker".to_string(),
            poll_interval: Duration::from_secs(3),
            task_timeout: Duration::from_secs(15),
            generation_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            reaper_safety_factor: 4,
            quota: QuotaLimits::default(),
            reply_fanout_limit: 3,
            digest_activity_limit: 200,
            digest_top_k: 5,
            depth_report_interval: Duration::from_secs(60),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            generator: HttpGeneratorConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_attempts: env.parse("JOB_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: env.secs("JOB_RETRY_BASE_SECS", defaults.retry.base_delay)?,
            max_delay: env.secs("JOB_RETRY_MAX_SECS", defaults.retry.max_delay)?,
            jitter: defaults.retry.jitter,
        };

        let offset_minutes: i32 = env.parse(
            "QUOTA_UTC_OFFSET_MINUTES",
            defaults.quota.utc_offset.local_minus_utc() / 60,
        )?;
        let utc_offset =
            FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| ConfigError::Invalid {
                key: "QUOTA_UTC_OFFSET_MINUTES",
                value: offset_minutes.to_string(),
                reason: "offset must be within ±24h".to_string(),
            })?;

        let quota = QuotaLimits {
            utc_offset,
            persona_replies_per_day: env.parse(
                "QUOTA_PERSONA_REPLIES_PER_DAY",
                defaults.quota.persona_replies_per_day,
            )?,
            user_posts_per_day: env
                .parse("QUOTA_USER_POSTS_PER_DAY", defaults.quota.user_posts_per_day)?,
        };

        let generator = HttpGeneratorConfig {
            base_url: env.string("LLM_BASE_URL").unwrap_or(defaults.generator.base_url),
            api_key: env.string("LLM_API_KEY"),
            model: env.string("LLM_MODEL").unwrap_or(defaults.generator.model),
        };

        let config = Self {
            database_url: env.string("DATABASE_URL"),
            database_max_connections: env
                .parse("DATABASE_MAX_CONNECTIONS", defaults.database_max_connections)?,
            apply_schema: env.parse("APPLY_SCHEMA", defaults.apply_schema)?,
            worker_name: env.string("WORKER_NAME").unwrap_or(defaults.worker_name),
            poll_interval: env.secs("WORKER_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            task_timeout: env.secs("WORKER_TASK_TIMEOUT_SECS", defaults.task_timeout)?,
            generation_timeout: env.secs("GENERATION_TIMEOUT_SECS", defaults.generation_timeout)?,
            retry,
            reaper_safety_factor: env
                .parse("REAPER_SAFETY_FACTOR", defaults.reaper_safety_factor)?,
            quota,
            reply_fanout_limit: env.parse("REPLY_FANOUT_LIMIT", defaults.reply_fanout_limit)?,
            digest_activity_limit: env
                .parse("DIGEST_ACTIVITY_LIMIT", defaults.digest_activity_limit)?,
            digest_top_k: env.parse("DIGEST_TOP_K", defaults.digest_top_k)?,
            depth_report_interval: env
                .secs("DEPTH_REPORT_INTERVAL_SECS", defaults.depth_report_interval)?,
            health_addr: env.parse("HEALTH_ADDR", defaults.health_addr)?,
            generator,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Inconsistent(
                "JOB_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Inconsistent(
                "JOB_RETRY_BASE_SECS must not exceed JOB_RETRY_MAX_SECS".to_string(),
            ));
        }
        if self.poll_interval.is_zero() || self.task_timeout.is_zero() {
            return Err(ConfigError::Inconsistent(
                "poll interval and task timeout must be positive".to_string(),
            ));
        }
        if self.generation_timeout >= self.task_timeout {
            return Err(ConfigError::Inconsistent(
                "GENERATION_TIMEOUT_SECS must be below WORKER_TASK_TIMEOUT_SECS".to_string(),
            ));
        }
        if self.reaper_safety_factor < 2 {
            return Err(ConfigError::Inconsistent(
                "REAPER_SAFETY_FACTOR must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Age after which a PROCESSING row is considered abandoned.
    pub fn stale_lock_after(&self) -> Duration {
        self.task_timeout * self.reaper_safety_factor
    }

    /// Budget of one job execution; shorter than `task_timeout` so the
    /// dispatcher always gets to finalise a timed-out job.
    pub fn execution_timeout(&self) -> Duration {
        self.task_timeout * 4 / 5
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &'static str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.task_timeout, Duration::from_secs(15));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_secs(30));
        assert_eq!(config.retry.max_delay, Duration::from_secs(600));
        assert_eq!(config.stale_lock_after(), Duration::from_secs(60));
        assert_eq!(config.execution_timeout(), Duration::from_secs(12));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/chorus"),
            ("JOB_MAX_ATTEMPTS", "3"),
            ("QUOTA_UTC_OFFSET_MINUTES", "-300"),
            ("HEALTH_ADDR", "127.0.0.1:9000"),
        ])
        .unwrap();
        assert_eq!(config.require_database_url().unwrap(), "postgres://localhost/chorus");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.quota.utc_offset.local_minus_utc(), -300 * 60);
        assert_eq!(config.health_addr.port(), 9000);
    }

    #[test]
    fn invalid_number_names_the_variable() {
        let err = load(&[("JOB_MAX_ATTEMPTS", "five")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "JOB_MAX_ATTEMPTS",
                ..
            }
        ));
    }

    #[test]
    fn generation_timeout_must_fit_in_task_timeout() {
        let err = load(&[
            ("WORKER_TASK_TIMEOUT_SECS", "10"),
            ("GENERATION_TIMEOUT_SECS", "10"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn missing_database_url_is_reported() {
        let config = load(&[]).unwrap();
        assert_eq!(
            config.require_database_url().unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }
}
