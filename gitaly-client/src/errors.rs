use crate::circuit_breaker::CircuitKey;
use crate::config::ConfigError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key under which routing details are attached to a failed status.
pub const ERROR_METADATA_KEY: &str = "gitaly_error_metadata";

/// Status codes carried by a "bad status" transport error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type URL prefix of the detailed errors the server attaches to a status.
pub const DETAILED_ERROR_TYPE_PREFIX: &str = "type.googleapis.com/gitaly.";

/// One packed detail message of a status, as sent on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusDetail {
    pub type_url: String,
    pub value: Bytes,
}

/// A typed error the server can attach as a status detail.
pub trait DetailedError: Sized {
    /// Message name inside the `gitaly` package, e.g. `UserCommitFilesError`.
    const TYPE_NAME: &'static str;

    /// The specific error this one wraps, for errors that carry a oneof.
    type Variant;

    fn decode(value: &[u8]) -> Option<Self>;

    /// Splits out the wrapped error. Errors without one are returned as is.
    fn into_variant(self) -> Result<Self::Variant, Self>;
}

/// Result of [`Status::unwrap_detailed_error`].
#[derive(Debug, PartialEq)]
pub enum Unwrapped<E: DetailedError> {
    Variant(E::Variant),
    Error(E),
}

/// Where a failed call was routed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub storage: String,
    pub address: String,
    pub service: String,
    pub rpc: String,
}

/// A status returned by the remote service.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    code: Code,
    message: String,
    metadata: BTreeMap<String, serde_json::Value>,
    details: Vec<StatusDetail>,
}

impl Status {
    pub fn new<M>(code: Code, message: M) -> Self
    where
        M: Into<String>,
    {
        Status {
            code,
            message: message.into(),
            metadata: BTreeMap::new(),
            details: Vec::new(),
        }
    }

    pub fn with_detail(mut self, type_url: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.details.push(StatusDetail {
            type_url: type_url.into(),
            value: value.into(),
        });
        self
    }

    pub fn details(&self) -> &[StatusDetail] {
        &self.details
    }

    /// Decodes the first detail when it is an `E`. Details of another type,
    /// or that fail to decode, yield `None`.
    pub fn decode_detailed_error<E: DetailedError>(&self) -> Option<E> {
        let detail = self.details.first()?;
        let type_name = detail.type_url.strip_prefix(DETAILED_ERROR_TYPE_PREFIX)?;
        if type_name != E::TYPE_NAME {
            return None;
        }

        E::decode(&detail.value)
    }

    /// Like [`Status::decode_detailed_error`], but returns the wrapped error
    /// when the decoded one carries it.
    pub fn unwrap_detailed_error<E: DetailedError>(&self) -> Option<Unwrapped<E>> {
        let error = self.decode_detailed_error::<E>()?;

        Some(match error.into_variant() {
            Ok(variant) => Unwrapped::Variant(variant),
            Err(error) => Unwrapped::Error(error),
        })
    }

    pub fn resource_exhausted<M: Into<String>>(message: M) -> Self {
        Status::new(Code::ResourceExhausted, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut BTreeMap<String, serde_json::Value> {
        &mut self.metadata
    }

    /// Routing details attached by the call wrapper, if any.
    pub fn routing_metadata(&self) -> Option<RoutingMetadata> {
        self.metadata
            .get(ERROR_METADATA_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub(crate) fn attach_routing(&mut self, routing: &RoutingMetadata) {
        match serde_json::to_value(routing) {
            Ok(value) => {
                self.metadata.insert(ERROR_METADATA_KEY.to_string(), value);
            }
            Err(e) => tracing::warn!(error = %e, "could not serialize routing metadata"),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors raised by the transport executor.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("rpc failed with status {0}")]
    Status(Status),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn status(&self) -> Option<&Status> {
        match self {
            TransportError::Status(status) => Some(status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<Code> {
        self.status().map(Status::code)
    }

    pub fn is_resource_exhausted(&self) -> bool {
        self.code() == Some(Code::ResourceExhausted)
    }

    /// Attaches routing details to bad-status errors, leaving other errors untouched.
    pub(crate) fn annotate(&mut self, routing: &RoutingMetadata) {
        if let TransportError::Status(status) = self {
            status.attach_routing(routing);
        }
    }
}

impl From<Status> for TransportError {
    fn from(status: Status) -> Self {
        TransportError::Status(status)
    }
}

/// Errors surfaced to call sites.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("circuit breaker is open for {key}, the request was not attempted")]
    CircuitOpen { key: CircuitKey },

    #[error("{}", too_many_invocations(.call_site, .invocation_count, .max_call_stack, .most_invoked_stack))]
    TooManyInvocations {
        call_site: String,
        invocation_count: u64,
        /// Calls made from the stack that called the most
        max_call_stack: u64,
        most_invoked_stack: Vec<String>,
    },

    #[error("request deadline exceeded before the call was made")]
    RequestDeadlineExceeded,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

fn too_many_invocations(
    call_site: &str,
    invocation_count: &u64,
    max_call_stack: &u64,
    most_invoked_stack: &[String],
) -> String {
    let mut message = format!(
        "GitalyClient#{call_site} called {invocation_count} times from single request. Potential n+1?"
    );
    if !most_invoked_stack.is_empty() {
        message.push_str(&format!(
            "\nThe following call site called into Gitaly {max_call_stack} times:\n{}\n",
            most_invoked_stack.join("\n")
        ));
    }

    message
}

impl ClientError {
    /// Status-like code, so callers can branch on resource exhaustion
    /// regardless of whether the breaker or the backend reported it.
    pub fn code(&self) -> Option<Code> {
        match self {
            ClientError::Transport(e) => e.code(),
            ClientError::CircuitOpen { .. } => Some(Code::ResourceExhausted),
            ClientError::RequestDeadlineExceeded => Some(Code::DeadlineExceeded),
            ClientError::TooManyInvocations { .. } | ClientError::Config(_) => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ClientError::CircuitOpen { .. })
    }

    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            ClientError::Transport(e) => Some(e),
            _ => None,
        }
    }
}
