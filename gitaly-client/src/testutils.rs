use crate::address::GitalyAddress;
use crate::circuit_breaker::{
    CircuitEvents, CircuitKey, CircuitOptions, CircuitState, CircuitStore, StateChange,
    StoreError,
};
use crate::config::Config;
use crate::errors::TransportError;
use crate::metadata::RequestMetadata;
use crate::transport::{CallDescriptor, MessageStream, Response, Transport};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, SystemTime};

pub fn test_config() -> Config {
    Config::from_yaml(
        r#"
storages:
    default:
        gitaly_address: "tcp://localhost:9876"
        gitaly_token: "secret"
    other:
        gitaly_address: "tcp://localhost:9877"
gitaly_token: "global-token"
"#,
    )
    .expect("valid test config")
}

/// A stream that waits `delay` before yielding each item.
pub fn delayed_stream<M: Send + 'static>(
    items: Vec<(Duration, Result<M, TransportError>)>,
) -> MessageStream<M> {
    stream::iter(items)
        .then(|(delay, item)| async move {
            tokio::time::sleep(delay).await;
            item
        })
        .boxed()
}

enum Scripted<M> {
    Unary(Duration, M),
    Stream(Vec<(Duration, Result<M, TransportError>)>),
    Error(Duration, TransportError),
}

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub address: String,
    pub storage: String,
    pub service: String,
    pub rpc: String,
    pub headers: BTreeMap<String, String>,
    pub deadline: Option<SystemTime>,
}

/// Replays scripted responses in order and records every call it receives.
pub struct ScriptedTransport<M> {
    responses: Mutex<VecDeque<Scripted<M>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl<M> Default for ScriptedTransport<M> {
    fn default() -> Self {
        ScriptedTransport {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl<M> ScriptedTransport<M> {
    pub fn unary(self, delay: Duration, message: M) -> Self {
        self.responses.lock().push_back(Scripted::Unary(delay, message));
        self
    }

    pub fn stream(self, items: Vec<(Duration, Result<M, TransportError>)>) -> Self {
        self.responses.lock().push_back(Scripted::Stream(items));
        self
    }

    pub fn error(self, delay: Duration, error: TransportError) -> Self {
        self.responses.lock().push_back(Scripted::Error(delay, error));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl<Req, M> Transport<Req, M> for ScriptedTransport<M>
where
    Req: Send + Sync + 'static,
    M: Send + 'static,
{
    async fn execute(
        &self,
        address: &GitalyAddress,
        call: &CallDescriptor<Req>,
        metadata: &RequestMetadata,
    ) -> Result<Response<M>, TransportError> {
        self.calls.lock().push(RecordedCall {
            address: address.to_string(),
            storage: call.storage().to_string(),
            service: call.service().to_string(),
            rpc: call.rpc().to_string(),
            headers: metadata.headers.clone(),
            deadline: metadata.deadline,
        });

        let next = self.responses.lock().pop_front();
        match next {
            Some(Scripted::Unary(delay, message)) => {
                tokio::time::sleep(delay).await;
                Ok(Response::Unary(message))
            }
            Some(Scripted::Stream(items)) => Ok(Response::Stream(delayed_stream(items))),
            Some(Scripted::Error(delay, error)) => {
                tokio::time::sleep(delay).await;
                Err(error)
            }
            None => Err(TransportError::Other("no scripted response left".into())),
        }
    }
}

/// A circuit store that is never reachable.
pub struct FailingCircuitStore;

#[async_trait]
impl CircuitStore for FailingCircuitStore {
    async fn state(&self, _: &CircuitKey, _: &CircuitOptions) -> Result<CircuitState, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn record_success(
        &self,
        _: &CircuitKey,
        _: &CircuitOptions,
    ) -> Result<StateChange, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn record_failure(
        &self,
        _: &CircuitKey,
        _: &CircuitOptions,
    ) -> Result<StateChange, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordedEvent {
    Allowed,
    Rejected(String),
    Errored(String),
    Transition(StateChange),
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }
}

impl CircuitEvents for RecordingEvents {
    fn allowed(&self, _: &CircuitKey) {
        self.events.lock().push(RecordedEvent::Allowed);
    }

    fn rejected(&self, _: &CircuitKey, reason: &str) {
        self.events.lock().push(RecordedEvent::Rejected(reason.to_string()));
    }

    fn errored(&self, _: &CircuitKey, reason: &str) {
        self.events.lock().push(RecordedEvent::Errored(reason.to_string()));
    }

    fn transition(&self, _: &CircuitKey, change: StateChange) {
        self.events.lock().push(RecordedEvent::Transition(change));
    }
}
