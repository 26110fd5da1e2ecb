//! Per-request bookkeeping shared by every call made while serving one request.
//!
//! The store is active only inside [`RequestStore::scope`]. Outside a scope
//! the free functions in this module read as empty and writes are dropped,
//! which is how background jobs run.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

tokio::task_local! {
    static STORE: RequestStore;
}

/// Diagnostic record for one completed call.
#[derive(Clone, Debug, Serialize)]
pub struct CallDetails {
    pub start: SystemTime,
    /// `service#rpc`
    pub feature: String,
    pub duration: Duration,
    pub request: serde_json::Value,
    pub rpc: String,
    pub backtrace: String,
}

#[derive(Default)]
struct Inner {
    query_time: Duration,
    call_details: Vec<CallDetails>,
    counts: HashMap<String, u64>,
    stack_counter: HashMap<String, u64>,
    ref_name_caching: bool,
    session_id: Option<String>,
    relative_path: Option<String>,
    git_env: BTreeMap<String, String>,
    request_deadline: Option<SystemTime>,
    performance_bar: bool,
}

#[derive(Clone, Default)]
pub struct RequestStore {
    inner: Arc<Mutex<Inner>>,
}

impl RequestStore {
    pub fn new() -> Self {
        RequestStore::default()
    }

    /// Absolute deadline of the enclosing request. Call deadlines are capped by it.
    pub fn with_request_deadline(self, deadline: SystemTime) -> Self {
        self.inner.lock().request_deadline = Some(deadline);
        self
    }

    /// Repository path of a quarantined push, forwarded as `relative-path-bin`.
    pub fn with_relative_path(self, path: impl Into<String>) -> Self {
        self.inner.lock().relative_path = Some(path.into()).filter(|p| !p.is_empty());
        self
    }

    /// Git hook environment. When present, calls are routed to the primary.
    pub fn with_git_env(self, env: BTreeMap<String, String>) -> Self {
        self.inner.lock().git_env = env;
        self
    }

    /// Call details are only exposed when the performance bar is on for this request.
    pub fn with_performance_bar(self, enabled: bool) -> Self {
        self.inner.lock().performance_bar = enabled;
        self
    }

    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        STORE.scope(self, fut).await
    }

    pub fn current() -> Option<RequestStore> {
        STORE.try_with(Clone::clone).ok()
    }

    pub fn is_active() -> bool {
        STORE.try_with(|_| ()).is_ok()
    }

    pub fn query_time(&self) -> Duration {
        self.inner.lock().query_time
    }

    pub fn add_query_time(&self, duration: Duration) {
        self.inner.lock().query_time += duration;
    }

    pub fn add_call_details(&self, details: CallDetails) {
        self.inner.lock().call_details.push(details);
    }

    pub fn call_details(&self) -> Vec<CallDetails> {
        self.inner.lock().call_details.clone()
    }

    pub fn performance_bar_enabled(&self) -> bool {
        self.inner.lock().performance_bar
    }

    /// Stable for the lifetime of the store.
    pub fn session_id(&self) -> String {
        self.inner
            .lock()
            .session_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    pub fn relative_path(&self) -> Option<String> {
        self.inner.lock().relative_path.clone()
    }

    pub fn has_git_env(&self) -> bool {
        !self.inner.lock().git_env.is_empty()
    }

    pub fn request_deadline(&self) -> Option<SystemTime> {
        self.inner.lock().request_deadline
    }

    pub fn deadline_exceeded(&self, now: SystemTime) -> bool {
        self.request_deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Counts one more call from `stack`, returning the new count.
    pub fn count_stack(&self, stack: String) -> u64 {
        let mut inner = self.inner.lock();
        let count = inner.stack_counter.entry(stack).or_default();
        *count += 1;
        *count
    }

    /// Highest per-stack call count, and every stack that reached it.
    pub fn max_stacks(&self) -> (u64, Vec<String>) {
        let inner = self.inner.lock();
        let max = inner.stack_counter.values().copied().max().unwrap_or(0);
        if max == 0 {
            return (0, Vec::new());
        }

        let mut stacks: Vec<String> = inner
            .stack_counter
            .iter()
            .filter(|(_, count)| **count == max)
            .map(|(stack, _)| stack.clone())
            .collect();
        stacks.sort_unstable();

        (max, stacks)
    }

    pub fn ref_name_caching_allowed(&self) -> bool {
        self.inner.lock().ref_name_caching
    }

    pub(crate) fn set_ref_name_caching(&self, allowed: bool) {
        self.inner.lock().ref_name_caching = allowed;
    }

    pub(crate) fn increment(&self, key: &str) -> u64 {
        let mut inner = self.inner.lock();
        let count = inner.counts.entry(key.to_string()).or_default();
        *count += 1;
        *count
    }

    pub(crate) fn decrement(&self, key: &str) {
        if let Some(count) = self.inner.lock().counts.get_mut(key) {
            *count = count.saturating_sub(1);
        }
    }

    pub(crate) fn count(&self, key: &str) -> u64 {
        self.inner.lock().counts.get(key).copied().unwrap_or(0)
    }

    pub(crate) fn set_count(&self, key: &str, value: u64) {
        self.inner.lock().counts.insert(key.to_string(), value);
    }
}

/// Total time spent in calls during the current request, rounded to microseconds.
pub fn query_time() -> Duration {
    let total = RequestStore::current()
        .map(|store| store.query_time())
        .unwrap_or_default();

    let micros = (total.as_nanos() + 500) / 1_000;
    Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
}

pub fn add_query_time(duration: Duration) {
    if let Some(store) = RequestStore::current() {
        store.add_query_time(duration);
    }
}

pub fn list_call_details() -> Vec<CallDetails> {
    match RequestStore::current() {
        Some(store) if store.performance_bar_enabled() => store.call_details(),
        _ => Vec::new(),
    }
}
