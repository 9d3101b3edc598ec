use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Process configuration for the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Listen address for the HTTP surface.
    pub listen_addr: SocketAddr,

    /// Workers per queue.
    pub worker_count: usize,

    /// How long an idle worker sleeps before polling its queue again.
    pub poll_interval_ms: u64,

    /// Default timeout of an outbound push, overridable per endpoint.
    pub http_timeout_secs: u64,

    /// Response bytes kept in a delivery attempt.
    pub max_response_bytes: usize,

    /// Largest accepted inbound payload, overridable per source.
    pub max_payload_bytes: usize,

    /// Lookback window of the duplicate check.
    pub dedup_window_secs: u64,

    /// Cap on exponential retry delays.
    pub max_retry_delay_secs: u64,

    /// Lease duration of a dequeued job.
    pub queue_lease_secs: u64,

    /// Expiry of idle breaker state.
    pub breaker_ttl_secs: u64,

    /// Accept `http://` endpoint URLs. For local development only.
    pub allow_http_endpoints: bool,

    /// Accept loopback and private-range endpoint hosts. For local development only.
    pub allow_private_endpoints: bool,

    /// Relational store; in-memory when unset.
    pub database_url: Option<String>,

    /// Breaker store; in-memory when unset.
    pub redis_url: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5005)),
            worker_count: 4,
            poll_interval_ms: 100,
            http_timeout_secs: 10,
            max_response_bytes: 4096,
            max_payload_bytes: 1024 * 1024,
            dedup_window_secs: 3600,
            max_retry_delay_secs: 7200,
            queue_lease_secs: 60,
            breaker_ttl_secs: 3600,
            allow_http_endpoints: false,
            allow_private_endpoints: false,
            database_url: None,
            redis_url: None,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// This allows tests to supply variables without mutating process-global
    /// environment state.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();

        let worker_count: usize = parse(&reader, "HOOKRELAY_WORKER_COUNT", defaults.worker_count)?;
        if worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "HOOKRELAY_WORKER_COUNT".into(),
                "must be at least 1".into(),
            ));
        }

        Ok(Self {
            listen_addr: parse(&reader, "HOOKRELAY_LISTEN_ADDR", defaults.listen_addr)?,
            worker_count,
            poll_interval_ms: parse(
                &reader,
                "HOOKRELAY_POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
            )?,
            http_timeout_secs: parse(
                &reader,
                "HOOKRELAY_HTTP_TIMEOUT_SECS",
                defaults.http_timeout_secs,
            )?,
            max_response_bytes: parse(
                &reader,
                "HOOKRELAY_MAX_RESPONSE_BYTES",
                defaults.max_response_bytes,
            )?,
            max_payload_bytes: parse(
                &reader,
                "HOOKRELAY_MAX_PAYLOAD_BYTES",
                defaults.max_payload_bytes,
            )?,
            dedup_window_secs: parse(
                &reader,
                "HOOKRELAY_DEDUP_WINDOW_SECS",
                defaults.dedup_window_secs,
            )?,
            max_retry_delay_secs: parse(
                &reader,
                "HOOKRELAY_MAX_RETRY_DELAY_SECS",
                defaults.max_retry_delay_secs,
            )?,
            queue_lease_secs: parse(
                &reader,
                "HOOKRELAY_QUEUE_LEASE_SECS",
                defaults.queue_lease_secs,
            )?,
            breaker_ttl_secs: parse(
                &reader,
                "HOOKRELAY_BREAKER_TTL_SECS",
                defaults.breaker_ttl_secs,
            )?,
            allow_http_endpoints: reader("HOOKRELAY_ALLOW_HTTP_ENDPOINTS")
                .unwrap_or_else(|_| "false".to_string())
                .parse::<bool>()
                .unwrap_or(false),
            allow_private_endpoints: reader("HOOKRELAY_ALLOW_PRIVATE_ENDPOINTS")
                .unwrap_or_else(|_| "false".to_string())
                .parse::<bool>()
                .unwrap_or(false),
            database_url: reader("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            redis_url: reader("REDIS_URL").ok().filter(|v| !v.is_empty()),
        })
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    #[must_use]
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    #[must_use]
    pub fn queue_lease(&self) -> Duration {
        Duration::from_secs(self.queue_lease_secs)
    }

    #[must_use]
    pub fn breaker_ttl(&self) -> Duration {
        Duration::from_secs(self.breaker_ttl_secs)
    }
}

fn parse<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.into(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
