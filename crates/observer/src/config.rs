use std::path::PathBuf;
use std::time::Duration;

use folio_core::backoff::BackoffPolicy;
use folio_core::config::{env_or, env_parse, ConfigError};

/// Default freshness window of persisted jobs (10 minutes).
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(600);

/// Observer client configuration.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Base of the HTTP API, including the version prefix.
    pub api_url: String,
    /// Realtime endpoint.
    pub ws_url: String,
    /// File holding the jobs this client is tracking.
    pub state_path: PathBuf,
    /// Status polling period for jobs without a recent realtime event,
    /// and for every job while disconnected (default: 3 s).
    pub poll_interval: Duration,
    /// Persisted jobs older than this are not resubscribed (default: 10 min).
    pub freshness: Duration,
    /// Reconnect delays: 1 s doubling to 30 s.
    pub reconnect: BackoffPolicy,
}

impl ObserverConfig {
    /// Build a config for a server at `api_url` / `ws_url` with default
    /// timings.
    pub fn new(api_url: impl Into<String>, ws_url: impl Into<String>, state_path: PathBuf) -> Self {
        Self {
            api_url: api_url.into(),
            ws_url: ws_url.into(),
            state_path,
            poll_interval: Duration::from_secs(3),
            freshness: DEFAULT_FRESHNESS,
            reconnect: BackoffPolicy::default(),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                          |
    /// |-------------------------------|----------------------------------|
    /// | `OBSERVER_API_URL`            | `http://localhost:3000/api/v1`   |
    /// | `OBSERVER_WS_URL`             | `ws://localhost:3000/api/v1/ws`  |
    /// | `OBSERVER_STATE_PATH`         | `.folio-observer.json`           |
    /// | `OBSERVER_POLL_INTERVAL_SECS` | `3`                              |
    /// | `OBSERVER_FRESHNESS_SECS`     | `600`                            |
    pub fn from_env() -> Result<Self, ConfigError> {
        let poll_interval = Duration::from_secs(env_parse("OBSERVER_POLL_INTERVAL_SECS", 3)?);
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "OBSERVER_POLL_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            api_url: env_or("OBSERVER_API_URL", "http://localhost:3000/api/v1"),
            ws_url: env_or("OBSERVER_WS_URL", "ws://localhost:3000/api/v1/ws"),
            state_path: PathBuf::from(env_or("OBSERVER_STATE_PATH", ".folio-observer.json")),
            poll_interval,
            freshness: Duration::from_secs(env_parse(
                "OBSERVER_FRESHNESS_SECS",
                DEFAULT_FRESHNESS.as_secs(),
            )?),
            reconnect: BackoffPolicy::default(),
        })
    }
}
