//! The seam between the call wrapper and whatever performs the network call.

use crate::address::GitalyAddress;
use crate::config::Timeouts;
use crate::context::ContextMap;
use crate::errors::TransportError;
use crate::metadata::RequestMetadata;
use crate::service::Service;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::time::Duration;

/// Lazily pulled response messages of a streaming RPC.
pub type MessageStream<M> = BoxStream<'static, Result<M, TransportError>>;

pub enum Response<M> {
    Unary(M),
    Stream(MessageStream<M>),
}

impl<M: Send + 'static> Response<M> {
    pub fn is_stream(&self) -> bool {
        matches!(self, Response::Stream(_))
    }

    /// Views any response as a stream. A unary response yields one message.
    pub fn into_stream(self) -> MessageStream<M> {
        match self {
            Response::Unary(message) => stream::once(async move { Ok(message) }).boxed(),
            Response::Stream(messages) => messages,
        }
    }
}

impl<M: std::fmt::Debug> std::fmt::Debug for Response<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Unary(message) => f.debug_tuple("Unary").field(message).finish(),
            Response::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Which configured timeout a call runs with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    #[default]
    Default,
    Medium,
    Fast,
    Long,
    /// No deadline, unless the enclosing request has one.
    Unlimited,
    Custom(Duration),
}

impl Timeout {
    pub fn resolve(&self, timeouts: &Timeouts) -> Option<Duration> {
        match self {
            Timeout::Default => timeouts.default_timeout(),
            Timeout::Medium => timeouts.medium_timeout(),
            Timeout::Fast => timeouts.fast_timeout(),
            Timeout::Long => timeouts.long_timeout(),
            Timeout::Unlimited => None,
            Timeout::Custom(duration) if duration.is_zero() => None,
            Timeout::Custom(duration) => Some(*duration),
        }
    }
}

/// One RPC invocation. Immutable once built.
#[derive(Clone, Debug)]
pub struct CallDescriptor<Req> {
    storage: String,
    service: Service,
    rpc: String,
    request: Req,
    remote_storage: Option<String>,
    timeout: Timeout,
    context: ContextMap,
}

impl<Req> CallDescriptor<Req> {
    pub fn new(storage: impl Into<String>, service: Service, rpc: impl Into<String>, request: Req) -> Self {
        CallDescriptor {
            storage: storage.into(),
            service,
            rpc: rpc.into(),
            request,
            remote_storage: None,
            timeout: Timeout::Default,
            context: ContextMap::new(),
        }
    }

    /// Storage whose address and token are forwarded for cross-storage calls.
    pub fn remote_storage(mut self, storage: impl Into<String>) -> Self {
        self.remote_storage = Some(storage.into());
        self
    }

    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }

    pub fn storage(&self) -> &str {
        &self.storage
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn rpc(&self) -> &str {
        &self.rpc
    }

    pub fn request(&self) -> &Req {
        &self.request
    }

    pub fn remote_storage_name(&self) -> Option<&str> {
        self.remote_storage.as_deref()
    }

    pub fn timeout_kind(&self) -> Timeout {
        self.timeout
    }

    pub fn call_context(&self) -> &ContextMap {
        &self.context
    }

    /// `service#rpc`
    pub fn feature(&self) -> String {
        format!("{}#{}", self.service, self.rpc)
    }
}

/// Performs the remote call. Enforcing `metadata.deadline` is the transport's job.
#[async_trait]
pub trait Transport<Req, Resp>: Send + Sync
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    async fn execute(
        &self,
        address: &GitalyAddress,
        call: &CallDescriptor<Req>,
        metadata: &RequestMetadata,
    ) -> Result<Response<Resp>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor() {
        let call = CallDescriptor::new("default", Service::RefService, "find_branch", ())
            .remote_storage("other")
            .timeout(Timeout::Fast);

        assert_eq!(call.storage(), "default");
        assert_eq!(call.feature(), "ref_service#find_branch");
        assert_eq!(call.remote_storage_name(), Some("other"));
        assert_eq!(call.timeout_kind(), Timeout::Fast);
        assert!(call.call_context().is_empty());
    }

    #[tokio::test]
    async fn test_unary_into_stream() {
        let response: Response<u8> = Response::Unary(7);
        assert!(!response.is_stream());

        let messages: Vec<_> = response.into_stream().collect().await;
        assert_eq!(messages, vec![Ok(7)]);
    }

    #[test]
    fn test_resolve_timeouts() {
        let timeouts = Timeouts::default();

        assert_eq!(Timeout::Default.resolve(&timeouts), Some(Duration::from_secs(55)));
        assert_eq!(Timeout::Medium.resolve(&timeouts), Some(Duration::from_secs(30)));
        assert_eq!(Timeout::Fast.resolve(&timeouts), Some(Duration::from_secs(10)));
        assert_eq!(Timeout::Long.resolve(&timeouts), Some(Duration::from_secs(21600)));
        assert_eq!(Timeout::Unlimited.resolve(&timeouts), None);
        assert_eq!(Timeout::Custom(Duration::ZERO).resolve(&timeouts), None);
        assert_eq!(
            Timeout::Custom(Duration::from_secs(3)).resolve(&timeouts),
            Some(Duration::from_secs(3))
        );
    }
}
