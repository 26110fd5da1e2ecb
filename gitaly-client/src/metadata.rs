use crate::config::ConfigError;
use crate::context::{
    self, CORRELATION_ID_KEY, ContextMap, REMOTE_IP_KEY, USER_ID_KEY, USER_KEY,
};
use crate::feature::{self, FeatureFlags};
use crate::request_store::RequestStore;
use crate::storage::Storages;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

pub const DEADLINE_TYPE_HEADER: &str = "deadline_type";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeadlineType {
    /// The call timeout decides the deadline.
    Regular,
    /// The enclosing request's deadline is sooner than the call timeout.
    Limited,
}

impl DeadlineType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeadlineType::Regular => "regular",
            DeadlineType::Limited => "limited",
        }
    }
}

/// Everything a transport needs to attach to one call besides the request itself.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestMetadata {
    pub headers: BTreeMap<String, String>,
    pub deadline: Option<SystemTime>,
}

/// Inputs for [`RequestMetadata::build`].
pub struct MetadataParams<'a> {
    pub storages: &'a Storages,
    pub storage: &'a str,
    pub remote_storage: Option<&'a str>,
    pub client_name: &'a str,
    pub timeout: Option<Duration>,
    pub call_context: &'a ContextMap,
    pub flags: &'a dyn FeatureFlags,
    pub now: SystemTime,
}

impl RequestMetadata {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn build(params: MetadataParams<'_>) -> Result<Self, ConfigError> {
        let token = params.storages.token(params.storage)?;
        let issued_at = params
            .now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut headers = BTreeMap::from([
            (
                "authorization".to_string(),
                format!("Bearer {}", authorization_token_at(&token, issued_at)),
            ),
            ("client_name".to_string(), params.client_name.to_string()),
        ]);

        if let Some(remote) = params.remote_storage {
            headers.insert(
                "gitaly-servers".into(),
                params.storages.address_metadata(remote)?,
            );
        }

        let store = RequestStore::current();
        let session_id = store
            .as_ref()
            .map(RequestStore::session_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        headers.insert("gitaly-session-id".into(), session_id);

        let app_context = context::current_context();
        for (key, header) in [
            (USER_KEY, "username"),
            (USER_ID_KEY, "user_id"),
            (REMOTE_IP_KEY, "remote_ip"),
            (CORRELATION_ID_KEY, "x-gitlab-correlation-id"),
        ] {
            if let Some(value) = app_context.get(key).and_then(header_value) {
                headers.insert(header.into(), value);
            }
        }

        if let Some(path) = store.as_ref().and_then(RequestStore::relative_path) {
            headers.insert("relative-path-bin".into(), path);
        }

        if !params.call_context.is_empty() {
            match serde_json::to_string(params.call_context) {
                Ok(json) => {
                    headers.insert("gitaly-client-context-bin".into(), json);
                }
                Err(e) => tracing::warn!(error = %e, "could not serialize gitaly client context"),
            }
        }

        let actors = context::feature_flag_actors();
        headers.extend(feature::server_feature_headers(params.flags, &actors));

        if store.as_ref().is_some_and(RequestStore::has_git_env) {
            headers.insert(
                "gitaly-route-repository-accessor-policy".into(),
                "primary-only".into(),
            );
        }

        let request_deadline = store.as_ref().and_then(RequestStore::request_deadline);
        let (deadline, deadline_type) =
            request_deadline_for(params.now, params.timeout, request_deadline);
        if let Some(deadline_type) = deadline_type {
            headers.insert(DEADLINE_TYPE_HEADER.into(), deadline_type.as_str().into());
        }

        Ok(RequestMetadata { headers, deadline })
    }
}

fn header_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()).filter(|s| !s.is_empty()),
        other => Some(other.to_string()),
    }
}

/// `v2.<hex hmac-sha256(token, issued_at)>.<issued_at>`
pub fn authorization_token_at(token: &str, issued_at: u64) -> String {
    let issued_at = issued_at.to_string();
    let mut mac =
        HmacSha256::new_from_slice(token.as_bytes()).expect("HMAC can take key of any size");
    mac.update(issued_at.as_bytes());
    let hmac = hex::encode(mac.finalize().into_bytes());

    format!("v2.{hmac}.{issued_at}")
}

/// A missing timeout means the call may run indefinitely, unless the
/// enclosing request has a deadline. The deadline type is only reported
/// when a request deadline exists.
fn request_deadline_for(
    now: SystemTime,
    timeout: Option<Duration>,
    request_deadline: Option<SystemTime>,
) -> (Option<SystemTime>, Option<DeadlineType>) {
    let regular = timeout.map(|timeout| now + timeout);

    let Some(request_deadline) = request_deadline else {
        return (regular, None);
    };

    match regular {
        Some(regular) if regular <= request_deadline => (Some(regular), Some(DeadlineType::Regular)),
        _ => (Some(request_deadline), Some(DeadlineType::Limited)),
    }
}
