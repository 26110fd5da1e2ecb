//! Per (storage, service, rpc) failure isolation.
//!
//! Only resource exhaustion reported by the backend counts as a failure.
//! State lives behind [`CircuitStore`]; when the store cannot answer, the
//! circuit is treated as closed.

pub mod store;

pub use store::MemoryCircuitStore;

use crate::context::{self, ActorLookup};
use crate::errors::{ClientError, TransportError};
use crate::feature::{CIRCUIT_BREAKER_FLAG, FeatureFlags};
use crate::metrics_defs::{CIRCUIT_BREAKER_REQUEST, CIRCUIT_BREAKER_TRANSITION};
use async_trait::async_trait;
use shared::counter;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const REJECTED_REASON: &str = "circuit_open";
pub const ERRORED_REASON: &str = "resource_exhausted";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    storage: String,
    service: String,
    rpc: String,
}

impl CircuitKey {
    pub fn new(
        storage: impl Into<String>,
        service: impl Into<String>,
        rpc: impl Into<String>,
    ) -> Self {
        CircuitKey {
            storage: storage.into(),
            service: service.into(),
            rpc: rpc.into(),
        }
    }

    pub fn storage(&self) -> &str {
        &self.storage
    }

    /// `service:rpc`, the endpoint label used in metrics.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.service, self.rpc)
    }
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.storage, self.service, self.rpc)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

impl CircuitState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CircuitOptions {
    /// Minimum samples in the time window before the error rate counts
    pub volume_threshold: u32,
    pub error_threshold_percentage: u32,
    /// How long an open circuit stays open
    pub sleep_window: Duration,
    pub time_window: Duration,
}

impl Default for CircuitOptions {
    fn default() -> Self {
        CircuitOptions {
            volume_threshold: 20,
            error_threshold_percentage: 50,
            sleep_window: Duration::from_secs(90),
            time_window: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub before: CircuitState,
    pub after: CircuitState,
}

impl StateChange {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("circuit store unavailable: {0}")]
    Unavailable(String),
}

/// Shared source of truth for circuit state. Implementations must be safe
/// under concurrent writers.
#[async_trait]
pub trait CircuitStore: Send + Sync {
    async fn state(
        &self,
        key: &CircuitKey,
        options: &CircuitOptions,
    ) -> Result<CircuitState, StoreError>;

    async fn record_success(
        &self,
        key: &CircuitKey,
        options: &CircuitOptions,
    ) -> Result<StateChange, StoreError>;

    async fn record_failure(
        &self,
        key: &CircuitKey,
        options: &CircuitOptions,
    ) -> Result<StateChange, StoreError>;
}

/// Receives breaker decisions. Fire and forget.
pub trait CircuitEvents: Send + Sync {
    fn allowed(&self, key: &CircuitKey);
    fn rejected(&self, key: &CircuitKey, reason: &str);
    fn errored(&self, key: &CircuitKey, reason: &str);
    fn transition(&self, key: &CircuitKey, change: StateChange);
}

/// Emits breaker events as counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsEvents;

impl CircuitEvents for MetricsEvents {
    fn allowed(&self, key: &CircuitKey) {
        counter!(CIRCUIT_BREAKER_REQUEST, "result" => "allowed", "storage" => key.storage.clone())
            .increment(1);
    }

    fn rejected(&self, key: &CircuitKey, reason: &str) {
        counter!(
            CIRCUIT_BREAKER_REQUEST,
            "result" => "rejected",
            "reason" => reason.to_string(),
            "storage" => key.storage.clone()
        )
        .increment(1);
    }

    fn errored(&self, key: &CircuitKey, reason: &str) {
        counter!(
            CIRCUIT_BREAKER_REQUEST,
            "result" => "errored",
            "reason" => reason.to_string(),
            "storage" => key.storage.clone()
        )
        .increment(1);
    }

    fn transition(&self, key: &CircuitKey, change: StateChange) {
        tracing::info!(
            circuit = %key,
            from = change.before.as_str(),
            to = change.after.as_str(),
            "circuit breaker state changed"
        );
        counter!(
            CIRCUIT_BREAKER_TRANSITION,
            "from" => change.before.as_str(),
            "to" => change.after.as_str(),
            "endpoint" => key.endpoint(),
            "storage" => key.storage.clone()
        )
        .increment(1);
    }
}

/// Everything breakers share: thresholds, the state store, the event sink
/// and the bypass lookups.
#[derive(Clone)]
pub struct CircuitPolicy {
    pub options: CircuitOptions,
    pub store: Arc<dyn CircuitStore>,
    pub events: Arc<dyn CircuitEvents>,
    pub flags: Arc<dyn FeatureFlags>,
    pub actor: Arc<dyn ActorLookup>,
}

impl CircuitPolicy {
    pub fn breaker(&self, key: CircuitKey) -> CircuitBreaker<'_> {
        CircuitBreaker { key, policy: self }
    }
}

pub struct CircuitBreaker<'a> {
    key: CircuitKey,
    policy: &'a CircuitPolicy,
}

impl CircuitBreaker<'_> {
    pub fn key(&self) -> &CircuitKey {
        &self.key
    }

    /// Disabled breakers and authenticated users skip the circuit entirely,
    /// and their outcomes are not recorded.
    fn bypassed(&self) -> bool {
        let actors = context::feature_flag_actors();
        !self.policy.flags.is_enabled(CIRCUIT_BREAKER_FLAG, &actors)
            || self.policy.actor.is_authenticated_user()
    }

    async fn current_state(&self) -> CircuitState {
        match self.policy.store.state(&self.key, &self.policy.options).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(circuit = %self.key, error = %e, "circuit store failed, assuming closed");
                CircuitState::Closed
            }
        }
    }

    fn reject(&self) -> ClientError {
        self.policy.events.rejected(&self.key, REJECTED_REASON);
        ClientError::CircuitOpen {
            key: self.key.clone(),
        }
    }

    fn observe(&self, result: Result<StateChange, StoreError>) {
        match result {
            Ok(change) if change.changed() => self.policy.events.transition(&self.key, change),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(circuit = %self.key, error = %e, "could not record circuit outcome")
            }
        }
    }

    /// Runs `f` unless the circuit is open.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        if self.bypassed() {
            return Ok(f().await?);
        }

        if self.current_state().await == CircuitState::Open {
            return Err(self.reject());
        }

        let options = &self.policy.options;
        match f().await {
            Ok(value) => {
                self.policy.events.allowed(&self.key);
                self.observe(self.policy.store.record_success(&self.key, options).await);
                Ok(value)
            }
            Err(e) if e.is_resource_exhausted() => {
                self.policy.events.errored(&self.key, ERRORED_REASON);
                self.observe(self.policy.store.record_failure(&self.key, options).await);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fails if the circuit is open. Never records a sample.
    pub async fn check(&self) -> Result<(), ClientError> {
        if self.bypassed() {
            return Ok(());
        }

        match self.current_state().await {
            CircuitState::Open => Err(self.reject()),
            CircuitState::Closed => Ok(()),
        }
    }
}
