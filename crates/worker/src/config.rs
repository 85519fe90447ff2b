use std::time::Duration;

use folio_core::backoff::BackoffPolicy;
use folio_core::config::{env_or, env_parse, env_required, ConfigError};
use folio_core::job::{EnqueueOptions, DEFAULT_MAX_ATTEMPTS};
use folio_db::job_queue::DEFAULT_MAX_STALLS;
use folio_db::{QueueConfig, RetentionPolicy};

use crate::pool::PoolConfig;

/// Queue and progress-store tunables shared by every process that touches
/// the queue.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Retention window of progress entries (default: 1 hour).
    pub progress_ttl: Duration,
    /// `max_attempts` for submissions that do not set one (default: `3`).
    pub max_attempts: u32,
    /// Delay after the first failed attempt (default: 5 s).
    pub retry_base_delay: Duration,
    /// Cap on the retry delay (default: 5 min).
    pub retry_max_delay: Duration,
    /// A claim with no heartbeat for this long is stalled (default: 30 s).
    pub stall_timeout: Duration,
    /// How often the watchdog looks for stalled claims (default: 5 s).
    pub stall_check_interval: Duration,
    pub retention: RetentionPolicy,
    /// How often terminal jobs and expired progress are swept (default: 5 min).
    pub retention_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            progress_ttl: Duration::from_secs(3600),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_millis(5000),
            retry_max_delay: Duration::from_millis(300_000),
            stall_timeout: Duration::from_secs(30),
            stall_check_interval: Duration::from_secs(5),
            retention: RetentionPolicy::default(),
            retention_interval: Duration::from_secs(300),
        }
    }
}

impl QueueSettings {
    /// Load settings from environment variables with defaults.
    ///
    /// | Env Var                     | Default  |
    /// |-----------------------------|----------|
    /// | `PROGRESS_TTL_SECS`         | `3600`   |
    /// | `JOB_MAX_ATTEMPTS`          | `3`      |
    /// | `RETRY_BASE_DELAY_MS`       | `5000`   |
    /// | `RETRY_MAX_DELAY_MS`        | `300000` |
    /// | `STALL_TIMEOUT_SECS`        | `30`     |
    /// | `STALL_CHECK_INTERVAL_SECS` | `5`      |
    /// | `RETENTION_KEEP_COMPLETED`  | `100`    |
    /// | `RETENTION_KEEP_FAILED`     | `500`    |
    /// | `RETENTION_MAX_AGE_HOURS`   | `24`     |
    /// | `RETENTION_INTERVAL_SECS`   | `300`    |
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = Self {
            progress_ttl: Duration::from_secs(env_parse("PROGRESS_TTL_SECS", 3600)?),
            max_attempts: env_parse("JOB_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            retry_base_delay: Duration::from_millis(env_parse("RETRY_BASE_DELAY_MS", 5000)?),
            retry_max_delay: Duration::from_millis(env_parse("RETRY_MAX_DELAY_MS", 300_000)?),
            stall_timeout: Duration::from_secs(env_parse("STALL_TIMEOUT_SECS", 30)?),
            stall_check_interval: Duration::from_secs(env_parse("STALL_CHECK_INTERVAL_SECS", 5)?),
            retention: RetentionPolicy {
                keep_completed: env_parse("RETENTION_KEEP_COMPLETED", 100)?,
                keep_failed: env_parse("RETENTION_KEEP_FAILED", 500)?,
                max_age: Duration::from_secs(env_parse::<u64>("RETENTION_MAX_AGE_HOURS", 24)? * 3600),
            },
            retention_interval: Duration::from_secs(env_parse("RETENTION_INTERVAL_SECS", 300)?),
        };

        if let Err(e) = settings.default_enqueue_options().validate() {
            return Err(ConfigError::Invalid {
                key: "JOB_MAX_ATTEMPTS",
                value: settings.max_attempts.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(settings)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            backoff: BackoffPolicy::exponential(self.retry_base_delay, self.retry_max_delay),
            max_stalls: DEFAULT_MAX_STALLS,
        }
    }

    pub fn default_enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions::with_max_attempts(self.max_attempts)
    }
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Concurrent execution slots (default: `2`).
    pub concurrency: usize,
    /// Longest idle wait between claim attempts (default: 1 s).
    pub poll_interval: Duration,
    /// Claim heartbeat period while a job runs (default: 5 s).
    pub heartbeat_interval: Duration,
    /// Provider endpoint the generation request is posted to.
    pub generation_url: String,
    /// Per-request generation timeout (default: 300 s).
    pub generation_timeout: Duration,
    /// Prefix for slot identifiers in logs and claims (default: hostname or `worker`).
    pub worker_name: String,
    pub queue: QueueSettings,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                          | Default    |
    /// |----------------------------------|------------|
    /// | `DATABASE_URL`                   | (required) |
    /// | `WORKER_CONCURRENCY`             | `2`        |
    /// | `WORKER_POLL_INTERVAL_MS`        | `1000`     |
    /// | `WORKER_HEARTBEAT_INTERVAL_SECS` | `5`        |
    /// | `GENERATION_URL`                 | (required) |
    /// | `GENERATION_TIMEOUT_SECS`        | `300`      |
    /// | `WORKER_NAME`                    | `$HOSTNAME` or `worker` |
    ///
    /// Queue knobs are read by [`QueueSettings::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let concurrency: usize = env_parse("WORKER_CONCURRENCY", 2)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let queue = QueueSettings::from_env()?;
        let heartbeat_interval =
            Duration::from_secs(env_parse("WORKER_HEARTBEAT_INTERVAL_SECS", 5)?);
        if heartbeat_interval.is_zero() || heartbeat_interval >= queue.stall_timeout {
            return Err(ConfigError::Invalid {
                key: "WORKER_HEARTBEAT_INTERVAL_SECS",
                value: heartbeat_interval.as_secs().to_string(),
                reason: "must be non-zero and shorter than STALL_TIMEOUT_SECS".into(),
            });
        }

        Ok(Self {
            database_url: env_required("DATABASE_URL")?,
            concurrency,
            poll_interval: Duration::from_millis(env_parse("WORKER_POLL_INTERVAL_MS", 1000)?),
            heartbeat_interval,
            generation_url: env_required("GENERATION_URL")?,
            generation_timeout: Duration::from_secs(env_parse("GENERATION_TIMEOUT_SECS", 300)?),
            worker_name: std::env::var("WORKER_NAME")
                .unwrap_or_else(|_| env_or("HOSTNAME", "worker")),
            queue,
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            concurrency: self.concurrency,
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            worker_name: self.worker_name.clone(),
        }
    }
}
