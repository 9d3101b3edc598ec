//! Per-endpoint circuit breaker for webhook delivery.
//!
//! Breaker state lives in a shared [`KvStore`] under `breaker:<project>:<endpoint>`
//! with a TTL, so every dispatcher instance sees the same admission decision.
//! Updates are optimistic read-modify-write with compare-and-set. A lost race
//! after a few retries is tolerated: the outcome is dropped and the
//! transition happens one outcome later.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::WebhookError;
use crate::kv::KvStore;

const MAX_CAS_ATTEMPTS: usize = 5;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - deliveries proceed.
    #[default]
    Closed,
    /// Circuit tripped - deliveries rejected without a request.
    Open,
    /// Testing recovery - one trial request at a time.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

/// Project-overridable breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Fraction of outcomes counted in the window statistics, in `(0, 1]`.
    #[validate(range(
        exclusive_min = 0.0,
        max = 1.0,
        message = "must be greater than 0 and at most 1"
    ))]
    pub sample_rate: f64,
    /// Seconds an open breaker waits before allowing a trial request.
    #[validate(range(min = 1, message = "must be greater than 0"))]
    pub error_timeout_secs: u64,
    /// Failure percentage that opens a closed breaker.
    #[validate(range(max = 100, message = "must be between 0 and 100"))]
    pub failure_threshold: u32,
    /// Percentage of `minimum_request_count` trial successes that close a
    /// half-open breaker (at least one).
    #[validate(range(max = 100, message = "must be between 0 and 100"))]
    pub success_threshold: u32,
    /// Length of the statistics window in seconds.
    #[validate(range(min = 1, message = "must be greater than 0"))]
    pub observability_window_secs: u64,
    /// Percentage rules are not evaluated below this many requests.
    pub minimum_request_count: u32,
    /// Consecutive failures that open the breaker regardless of percentages.
    /// Zero disables the rule.
    pub consecutive_failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1.0,
            error_timeout_secs: 30,
            failure_threshold: 70,
            success_threshold: 5,
            observability_window_secs: 300,
            minimum_request_count: 10,
            consecutive_failure_threshold: 10,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    #[must_use]
    pub fn with_error_timeout(mut self, secs: u64) -> Self {
        self.error_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, percent: u32) -> Self {
        self.failure_threshold = percent;
        self
    }

    #[must_use]
    pub fn with_success_threshold(mut self, percent: u32) -> Self {
        self.success_threshold = percent;
        self
    }

    #[must_use]
    pub fn with_observability_window(mut self, secs: u64) -> Self {
        self.observability_window_secs = secs;
        self
    }

    #[must_use]
    pub fn with_minimum_request_count(mut self, count: u32) -> Self {
        self.minimum_request_count = count;
        self
    }

    #[must_use]
    pub fn with_consecutive_failure_threshold(mut self, count: u32) -> Self {
        self.consecutive_failure_threshold = count;
        self
    }

    /// Trial successes needed to close a half-open breaker.
    #[must_use]
    pub fn required_trial_successes(&self) -> u32 {
        let scaled = u64::from(self.minimum_request_count) * u64::from(self.success_threshold);
        let required = scaled.div_ceil(100);
        u32::try_from(required).unwrap_or(u32::MAX).max(1)
    }

    fn error_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.error_timeout_secs).unwrap_or(i64::MAX / 1000))
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.observability_window_secs).unwrap_or(i64::MAX / 1000),
        )
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Half-open trial request.
    Trial,
    /// Short-circuit; a trial request may be sent from `retry_at`.
    Rejected { retry_at: DateTime<Utc> },
}

impl Admission {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Shared breaker state of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub endpoint_id: Uuid,
    pub project_id: Uuid,
    pub state: CircuitState,
    pub requests: u32,
    pub failures: u32,
    pub successes: u32,
    pub consecutive_failures: u32,
    pub window_started_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_successes: u32,
}

impl BreakerState {
    #[must_use]
    pub fn new(project_id: Uuid, endpoint_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            endpoint_id,
            project_id,
            state: CircuitState::Closed,
            requests: 0,
            failures: 0,
            successes: 0,
            consecutive_failures: 0,
            window_started_at: now,
            last_transition_at: now,
            opened_at: None,
            trial_started_at: None,
            trial_successes: 0,
        }
    }

    /// Decide whether a request may go out, moving open to half-open once
    /// the error timeout has elapsed.
    pub fn admit(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let reopen_at = self.opened_at.unwrap_or(self.last_transition_at)
                    + config.error_timeout();
                if now >= reopen_at {
                    self.transition(CircuitState::HalfOpen, now);
                    self.trial_started_at = Some(now);
                    Admission::Trial
                } else {
                    Admission::Rejected { retry_at: reopen_at }
                }
            }
            CircuitState::HalfOpen => match self.trial_started_at {
                // A trial that never reported back within the timeout is abandoned.
                Some(started) if now < started + config.error_timeout() => Admission::Rejected {
                    retry_at: started + config.error_timeout(),
                },
                _ => {
                    self.trial_started_at = Some(now);
                    Admission::Trial
                }
            },
        }
    }

    /// Fold one delivery outcome in. Returns the transition, if any.
    ///
    /// The consecutive-failure counter is kept for every outcome; only the
    /// window statistics are sampled.
    pub fn record(
        &mut self,
        config: &CircuitBreakerConfig,
        success: bool,
        sampled: bool,
        now: DateTime<Utc>,
    ) -> Option<(CircuitState, CircuitState)> {
        if now >= self.window_started_at + config.window() {
            self.reset_window(now);
        }

        let from = self.state;
        if success {
            self.consecutive_failures = 0;
            if sampled {
                self.requests += 1;
                self.successes += 1;
            }
            if self.state == CircuitState::HalfOpen {
                self.trial_started_at = None;
                self.trial_successes += 1;
                if self.trial_successes >= config.required_trial_successes() {
                    self.transition(CircuitState::Closed, now);
                    self.reset_window(now);
                }
            }
        } else {
            self.consecutive_failures += 1;
            if sampled {
                self.requests += 1;
                self.failures += 1;
            }
            match self.state {
                CircuitState::Closed if self.should_trip(config) => {
                    self.transition(CircuitState::Open, now);
                }
                CircuitState::HalfOpen => self.transition(CircuitState::Open, now),
                _ => {}
            }
        }

        (from != self.state).then_some((from, self.state))
    }

    fn should_trip(&self, config: &CircuitBreakerConfig) -> bool {
        let consecutive = config.consecutive_failure_threshold > 0
            && self.consecutive_failures >= config.consecutive_failure_threshold;
        let percentage = self.requests > 0
            && self.failures > 0
            && self.requests >= config.minimum_request_count
            && u64::from(self.failures) * 100
                >= u64::from(config.failure_threshold) * u64::from(self.requests);
        consecutive || percentage
    }

    fn transition(&mut self, to: CircuitState, now: DateTime<Utc>) {
        self.state = to;
        self.last_transition_at = now;
        self.trial_started_at = None;
        self.trial_successes = 0;
        self.opened_at = (to == CircuitState::Open).then_some(now);
    }

    fn reset_window(&mut self, now: DateTime<Utc>) {
        self.requests = 0;
        self.failures = 0;
        self.successes = 0;
        self.window_started_at = now;
    }
}

/// Operator view of one endpoint's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub endpoint_id: Uuid,
    pub state: CircuitState,
    pub requests: u32,
    pub failures: u32,
    pub successes: u32,
    pub consecutive_failures: u32,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerStatus {
    /// Status of an endpoint with no stored state.
    #[must_use]
    pub fn closed(endpoint_id: Uuid) -> Self {
        Self {
            endpoint_id,
            state: CircuitState::Closed,
            requests: 0,
            failures: 0,
            successes: 0,
            consecutive_failures: 0,
            last_transition_at: None,
            opened_at: None,
        }
    }
}

impl From<&BreakerState> for CircuitBreakerStatus {
    fn from(state: &BreakerState) -> Self {
        Self {
            endpoint_id: state.endpoint_id,
            state: state.state,
            requests: state.requests,
            failures: state.failures,
            successes: state.successes,
            consecutive_failures: state.consecutive_failures,
            last_transition_at: Some(state.last_transition_at),
            opened_at: state.opened_at,
        }
    }
}

/// Reads and updates breaker state in the shared store.
pub struct CircuitBreakerManager {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl CircuitBreakerManager {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    #[must_use]
    pub fn key(project_id: Uuid, endpoint_id: Uuid) -> String {
        format!("breaker:{project_id}:{endpoint_id}")
    }

    async fn load(&self, key: &str) -> Result<Option<(BreakerState, u64)>, WebhookError> {
        let Some(stored) = self.kv.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&stored.value) {
            Ok(state) => Ok(Some((state, stored.version))),
            Err(e) => {
                tracing::warn!(
                    target: "circuit_breaker",
                    key = %key,
                    error = %e,
                    "Discarding unreadable breaker state"
                );
                Ok(None)
            }
        }
    }

    /// Read-modify-write with compare-and-set. Nothing is written when `f`
    /// leaves the state unchanged.
    async fn update<R>(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        mut f: impl FnMut(&mut BreakerState) -> R + Send,
    ) -> Result<(R, BreakerState), WebhookError>
    where
        R: Send,
    {
        let key = Self::key(project_id, endpoint_id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let loaded = self.load(&key).await?;
            let version = loaded.as_ref().map(|(_, v)| *v);
            let mut state = loaded
                .map(|(s, _)| s)
                .unwrap_or_else(|| BreakerState::new(project_id, endpoint_id, Utc::now()));
            let before = state.clone();
            let result = f(&mut state);

            if state == before {
                return Ok((result, state));
            }

            let value = serde_json::to_string(&state)?;
            if self
                .kv
                .compare_and_set(&key, version, value, self.ttl)
                .await?
            {
                return Ok((result, state));
            }

            if attempt >= MAX_CAS_ATTEMPTS {
                tracing::warn!(
                    target: "circuit_breaker",
                    endpoint_id = %endpoint_id,
                    attempts = attempt,
                    "Breaker update lost to concurrent writers"
                );
                return Ok((result, state));
            }
        }
    }

    /// Admission check for one request to `endpoint_id`.
    pub async fn admit(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        config: &CircuitBreakerConfig,
    ) -> Result<Admission, WebhookError> {
        let now = Utc::now();
        let (admission, state) = self
            .update(project_id, endpoint_id, |state| state.admit(config, now))
            .await?;

        if admission == Admission::Trial {
            tracing::info!(
                target: "circuit_breaker",
                endpoint_id = %endpoint_id,
                state = state.state.as_str(),
                "Circuit breaker allowing trial request"
            );
        }
        Ok(admission)
    }

    /// Record the outcome of a real request. Returns the resulting state.
    pub async fn record_outcome(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
        config: &CircuitBreakerConfig,
        success: bool,
    ) -> Result<CircuitState, WebhookError> {
        let sampled = config.sample_rate >= 1.0 || rand::random::<f64>() < config.sample_rate;
        let now = Utc::now();
        let (transition, state) = self
            .update(project_id, endpoint_id, |state| {
                state.record(config, success, sampled, now)
            })
            .await?;

        match transition {
            Some((from, CircuitState::Open)) => tracing::warn!(
                target: "circuit_breaker",
                endpoint_id = %endpoint_id,
                from = from.as_str(),
                consecutive_failures = state.consecutive_failures,
                requests = state.requests,
                failures = state.failures,
                "Circuit breaker opened"
            ),
            Some((from, to)) => tracing::info!(
                target: "circuit_breaker",
                endpoint_id = %endpoint_id,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker transitioned"
            ),
            None => {}
        }
        Ok(state.state)
    }

    /// Current state, `None` when nothing is stored (equivalent to closed).
    pub async fn state(
        &self,
        project_id: Uuid,
        endpoint_id: Uuid,
    ) -> Result<Option<BreakerState>, WebhookError> {
        Ok(self
            .load(&Self::key(project_id, endpoint_id))
            .await?
            .map(|(state, _)| state))
    }

    /// Overwrite the endpoints' breakers with fresh closed state.
    pub async fn reset(&self, project_id: Uuid, endpoint_ids: &[Uuid]) -> Result<(), WebhookError> {
        let now = Utc::now();
        let mut entries = Vec::with_capacity(endpoint_ids.len());
        for endpoint_id in endpoint_ids {
            let state = BreakerState::new(project_id, *endpoint_id, now);
            entries.push((
                Self::key(project_id, *endpoint_id),
                serde_json::to_string(&state)?,
            ));
        }
        self.kv.set_many(entries, self.ttl).await
    }

    /// Drop stored state so the next admission starts from a clean window.
    pub async fn invalidate(
        &self,
        project_id: Uuid,
        endpoint_ids: &[Uuid],
    ) -> Result<(), WebhookError> {
        let keys: Vec<String> = endpoint_ids
            .iter()
            .map(|id| Self::key(project_id, *id))
            .collect();
        self.kv.delete_many(&keys).await
    }
}
