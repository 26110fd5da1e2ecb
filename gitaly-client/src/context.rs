//! Request-scoped application context.
//!
//! Every scope pushes an immutable frame merged from the frame below it.
//! Frames are shared through `Arc` and never mutated; leaving a scope
//! restores the previous frame itself, not a copy of it. Frames are
//! task-local, so spawned tasks start from the empty frame.

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};

pub const USER_KEY: &str = "meta.user";
pub const USER_ID_KEY: &str = "meta.user_id";
pub const REMOTE_IP_KEY: &str = "meta.remote_ip";
pub const CORRELATION_ID_KEY: &str = "correlation_id";

pub type ContextValue = serde_json::Value;
pub type ContextMap = BTreeMap<String, ContextValue>;

static EMPTY_FRAME: LazyLock<Arc<ContextMap>> = LazyLock::new(|| Arc::new(ContextMap::new()));

tokio::task_local! {
    static FRAME: Arc<ContextMap>;
    static ACTORS: FeatureFlagActors;
}

/// The innermost frame, or the shared empty frame outside any scope.
pub fn current_context() -> Arc<ContextMap> {
    FRAME
        .try_with(Arc::clone)
        .unwrap_or_else(|_| EMPTY_FRAME.clone())
}

/// Runs `fut` with `entries` merged over the current frame.
///
/// When every entry is already present with the same value, `fut` runs on
/// the current frame and no new frame is created.
pub async fn with_context<I, K, V, F>(entries: I, fut: F) -> F::Output
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ContextValue>,
    F: Future,
{
    match push(entries) {
        Some(frame) => FRAME.scope(frame, fut).await,
        None => fut.await,
    }
}

/// Synchronous variant of [`with_context`].
pub fn with_context_sync<I, K, V, F, R>(entries: I, f: F) -> R
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ContextValue>,
    F: FnOnce() -> R,
{
    match push(entries) {
        Some(frame) => FRAME.sync_scope(frame, f),
        None => f(),
    }
}

fn push<I, K, V>(entries: I) -> Option<Arc<ContextMap>>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ContextValue>,
{
    let current = current_context();
    let entries: Vec<(String, ContextValue)> = entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();

    if entries.iter().all(|(k, v)| current.get(k) == Some(v)) {
        return None;
    }

    let mut merged = (*current).clone();
    merged.extend(entries);
    Some(Arc::new(merged))
}

/// Actors that server-side feature flags are evaluated against.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FeatureFlagActors {
    pub repository: Option<String>,
    pub user: Option<String>,
    pub project: Option<String>,
    pub group: Option<String>,
}

impl FeatureFlagActors {
    pub fn is_empty(&self) -> bool {
        self == &FeatureFlagActors::default()
    }
}

pub async fn with_feature_flag_actors<F: Future>(actors: FeatureFlagActors, fut: F) -> F::Output {
    ACTORS.scope(actors, fut).await
}

pub fn feature_flag_actors() -> FeatureFlagActors {
    ACTORS.try_with(Clone::clone).unwrap_or_default()
}

/// Answers whether the current request is attributable to an authenticated user.
pub trait ActorLookup: Send + Sync {
    fn is_authenticated_user(&self) -> bool;
}

/// Reads the user from the application context.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApplicationContextActor;

impl ActorLookup for ApplicationContextActor {
    fn is_authenticated_user(&self) -> bool {
        current_context().contains_key(USER_KEY)
    }
}
