//! The instrumented call wrapper every RPC goes through.
//!
//! A call is admitted by its circuit breaker, executed by the transport and
//! timed. Unary responses are timed immediately. Streaming responses are
//! timed per pull, so time the caller spends between pulls is not counted,
//! and the diagnostic record is written once the stream ends, fails or is
//! dropped.

use crate::circuit_breaker::{
    CircuitBreaker, CircuitEvents, CircuitKey, CircuitPolicy, CircuitStore, MemoryCircuitStore,
    MetricsEvents,
};
use crate::config::{Config, ConfigError, RequestLimits, Timeouts};
use crate::context::{ActorLookup, ApplicationContextActor};
use crate::errors::{ClientError, RoutingMetadata, TransportError};
use crate::feature::{FeatureFlags, StaticFeatureFlags};
use crate::limits;
use crate::metadata::{MetadataParams, RequestMetadata};
use crate::metrics_defs::CALL_DURATION;
use crate::request_store::{CallDetails, RequestStore};
use crate::service::Service;
use crate::storage::Storages;
use crate::transport::{CallDescriptor, MessageStream, Response, Transport};
use futures_util::Stream;
use serde::Serialize;
use shared::histogram;
use std::backtrace::Backtrace;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

pub struct GitalyClient<T> {
    transport: Arc<T>,
    storages: Storages,
    client_name: String,
    limits: RequestLimits,
    timeouts: Timeouts,
    policy: CircuitPolicy,
}

impl<T> GitalyClient<T> {
    pub fn new(config: &Config, transport: T) -> Result<Self, ConfigError> {
        config.validate()?;

        let options = config.circuit_breaker.options();
        let policy = CircuitPolicy {
            options,
            store: Arc::new(MemoryCircuitStore::new(&options)),
            events: Arc::new(MetricsEvents),
            flags: Arc::new(StaticFeatureFlags::from_config(config)),
            actor: Arc::new(ApplicationContextActor),
        };

        Ok(GitalyClient {
            transport: Arc::new(transport),
            storages: Storages::from_config(config)?,
            client_name: config.client_name.clone(),
            limits: config.request_limits.clone(),
            timeouts: config.timeouts.clone(),
            policy,
        })
    }

    /// Replaces the circuit state store, e.g. with one shared between processes.
    pub fn with_circuit_store(mut self, store: Arc<dyn CircuitStore>) -> Self {
        self.policy.store = store;
        self
    }

    pub fn with_circuit_events(mut self, events: Arc<dyn CircuitEvents>) -> Self {
        self.policy.events = events;
        self
    }

    pub fn with_feature_flags(mut self, flags: Arc<dyn FeatureFlags>) -> Self {
        self.policy.flags = flags;
        self
    }

    pub fn with_actor_lookup(mut self, actor: Arc<dyn ActorLookup>) -> Self {
        self.policy.actor = actor;
        self
    }

    pub fn storages(&self) -> &Storages {
        &self.storages
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn circuit_breaker(&self, storage: &str, service: Service, rpc: &str) -> CircuitBreaker<'_> {
        self.policy
            .breaker(CircuitKey::new(storage, service.as_str(), rpc))
    }

    /// Fails fast when the circuit for this call is open, without calling out
    /// and without counting a sample.
    pub async fn check_circuit(
        &self,
        storage: &str,
        service: Service,
        rpc: &str,
    ) -> Result<(), ClientError> {
        self.circuit_breaker(storage, service, rpc).check().await
    }

    pub async fn call<Req, Resp>(
        &self,
        call: CallDescriptor<Req>,
    ) -> Result<Response<Resp>, ClientError>
    where
        T: Transport<Req, Resp>,
        Req: Serialize + Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let recorder = CallRecorder::start(&call);

        match self.execute(&call).await {
            Ok((Response::Stream(stream), routing)) => Ok(Response::Stream(Box::pin(
                InstrumentedStream::new(stream, recorder, routing),
            ))),
            Ok((unary, _)) => Ok(unary),
            Err(e) => Err(e),
        }
    }

    async fn execute<Req, Resp>(
        &self,
        call: &CallDescriptor<Req>,
    ) -> Result<(Response<Resp>, RoutingMetadata), ClientError>
    where
        T: Transport<Req, Resp>,
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        limits::enforce_request_limits(&self.limits, "call")?;

        let now = SystemTime::now();
        if RequestStore::current().is_some_and(|store| store.deadline_exceeded(now)) {
            return Err(ClientError::RequestDeadlineExceeded);
        }

        let address = self.storages.address(call.storage())?;
        let metadata = RequestMetadata::build(MetadataParams {
            storages: &self.storages,
            storage: call.storage(),
            remote_storage: call.remote_storage_name(),
            client_name: &self.client_name,
            timeout: call.timeout_kind().resolve(&self.timeouts),
            call_context: call.call_context(),
            flags: self.policy.flags.as_ref(),
            now,
        })?;

        let routing = RoutingMetadata {
            storage: call.storage().to_string(),
            address: address.to_string(),
            service: call.service().to_string(),
            rpc: call.rpc().to_string(),
        };

        let breaker = self.circuit_breaker(call.storage(), call.service(), call.rpc());
        let result = breaker
            .call(|| Transport::<Req, Resp>::execute(self.transport.as_ref(), address, call, &metadata))
            .await;

        match result {
            Ok(response) => Ok((response, routing)),
            Err(ClientError::Transport(mut e)) => {
                e.annotate(&routing);
                Err(e.into())
            }
            Err(e) => Err(e),
        }
    }
}

/// Accumulates the time one call spends waiting on the transport and writes
/// its diagnostic record exactly once, when finished or dropped.
struct CallRecorder {
    started_at: SystemTime,
    elapsed: Duration,
    /// Start of the span currently being timed
    running_since: Option<Instant>,
    service: Service,
    rpc: String,
    request: serde_json::Value,
    backtrace: String,
    store: Option<RequestStore>,
}

impl CallRecorder {
    fn start<Req: Serialize>(call: &CallDescriptor<Req>) -> Self {
        let store = RequestStore::current();

        // Snapshots are only kept when there is a request to report them to
        let (request, backtrace) = match store {
            Some(_) => (
                serde_json::to_value(call.request()).unwrap_or_default(),
                Backtrace::force_capture().to_string(),
            ),
            None => (serde_json::Value::Null, String::new()),
        };

        CallRecorder {
            started_at: SystemTime::now(),
            elapsed: Duration::ZERO,
            running_since: Some(Instant::now()),
            service: call.service(),
            rpc: call.rpc().to_string(),
            request,
            backtrace,
            store,
        }
    }

    fn resume(&mut self) {
        self.running_since.get_or_insert_with(Instant::now);
    }

    fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.elapsed += since.elapsed();
        }
    }
}

impl Drop for CallRecorder {
    fn drop(&mut self) {
        self.pause();

        histogram!(
            CALL_DURATION,
            "service" => self.service.as_str(),
            "rpc" => self.rpc.clone()
        )
        .record(self.elapsed.as_secs_f64());

        tracing::debug!(
            service = self.service.as_str(),
            rpc = %self.rpc,
            duration_ms = self.elapsed.as_millis() as u64,
            "gitaly call finished"
        );

        let Some(store) = self.store.take() else {
            return;
        };

        store.add_query_time(self.elapsed);
        store.add_call_details(CallDetails {
            start: self.started_at,
            feature: format!("{}#{}", self.service, self.rpc),
            duration: self.elapsed,
            request: std::mem::take(&mut self.request),
            rpc: self.rpc.clone(),
            backtrace: std::mem::take(&mut self.backtrace),
        });
    }
}

/// A streaming response that times every pull and finalizes its call when
/// exhausted, on the first error, or when dropped.
pub struct InstrumentedStream<M> {
    inner: MessageStream<M>,
    recorder: Option<CallRecorder>,
    routing: RoutingMetadata,
}

impl<M> InstrumentedStream<M> {
    fn new(inner: MessageStream<M>, mut recorder: CallRecorder, routing: RoutingMetadata) -> Self {
        // Time spent establishing the call counts, caller time until the first pull does not
        recorder.pause();

        InstrumentedStream {
            inner,
            recorder: Some(recorder),
            routing,
        }
    }

    fn finalize(&mut self) {
        self.recorder.take();
    }
}

impl<M> Stream for InstrumentedStream<M> {
    type Item = Result<M, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(recorder) = this.recorder.as_mut() else {
            return Poll::Ready(None);
        };

        recorder.resume();
        let item = match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(item) => item,
        };
        recorder.pause();

        match item {
            Some(Ok(message)) => Poll::Ready(Some(Ok(message))),
            Some(Err(mut e)) => {
                e.annotate(&this.routing);
                this.finalize();
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.finalize();
                Poll::Ready(None)
            }
        }
    }
}
