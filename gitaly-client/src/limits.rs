//! Detection of N+1 call patterns within a single request.

use crate::config::RequestLimits;
use crate::errors::ClientError;
use crate::request_store::RequestStore;
use std::backtrace::Backtrace;
use std::future::Future;

pub const MAXIMUM_GITALY_CALLS: u64 = 30;

const EXCEPTION_BLOCK_DEPTH_KEY: &str = "gitaly_call_count_exception_block_depth";

fn actual_key(call_site: &str) -> String {
    format!("gitaly_{call_site}_actual")
}

fn permitted_key(call_site: &str) -> String {
    format!("gitaly_{call_site}_permitted")
}

/// Counts one invocation from `call_site` and fails once more than
/// `limits.max_calls` invocations happened outside an
/// [`allow_n_plus_1_calls`] scope.
///
/// Nothing is counted without an active request store.
pub fn enforce_request_limits(limits: &RequestLimits, call_site: &str) -> Result<(), ClientError> {
    let Some(store) = RequestStore::current() else {
        return Ok(());
    };

    let actual = store.increment(&actual_key(call_site));

    if !limits.enforce || store.count(EXCEPTION_BLOCK_DEPTH_KEY) > 0 {
        return Ok(());
    }

    let permitted = store.increment(&permitted_key(call_site));
    store.count_stack(Backtrace::force_capture().to_string());

    if permitted <= limits.max_calls {
        return Ok(());
    }

    let (max_call_stack, most_invoked_stack) = store.max_stacks();
    tracing::warn!(
        call_site,
        actual,
        permitted,
        max_calls = limits.max_calls,
        max_call_stack,
        "too many gitaly calls in a single request"
    );

    Err(ClientError::TooManyInvocations {
        call_site: call_site.to_string(),
        invocation_count: actual,
        max_call_stack,
        most_invoked_stack,
    })
}

struct DepthGuard(RequestStore);

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.0.decrement(EXCEPTION_BLOCK_DEPTH_KEY);
    }
}

/// Runs `fut` with request limits suspended. Calls are still counted towards
/// [`request_count`].
pub async fn allow_n_plus_1_calls<F: Future>(fut: F) -> F::Output {
    let Some(store) = RequestStore::current() else {
        return fut.await;
    };

    store.increment(EXCEPTION_BLOCK_DEPTH_KEY);
    let _guard = DepthGuard(store);

    fut.await
}

struct RefNameCachingGuard(RequestStore);

impl Drop for RefNameCachingGuard {
    fn drop(&mut self) {
        self.0.set_ref_name_caching(false);
    }
}

/// Lets lookups inside `fut` cache commits by ref name instead of by sha.
/// Only safe for read-only work that never moves the refs it reads.
pub async fn allow_ref_name_caching<F: Future>(fut: F) -> F::Output {
    let Some(store) = RequestStore::current() else {
        return fut.await;
    };
    if store.ref_name_caching_allowed() {
        return fut.await;
    }

    store.set_ref_name_caching(true);
    let _guard = RefNameCachingGuard(store);

    fut.await
}

pub fn ref_name_caching_allowed() -> bool {
    RequestStore::current().is_some_and(|store| store.ref_name_caching_allowed())
}

/// Number of calls made during the current request.
pub fn request_count() -> u64 {
    RequestStore::current()
        .map(|store| store.count(&actual_key("call")))
        .unwrap_or(0)
}

pub fn reset_counts() {
    if let Some(store) = RequestStore::current() {
        store.set_count(&actual_key("call"), 0);
        store.set_count(&permitted_key("call"), 0);
    }
}
