pub mod address;
pub mod call;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod errors;
pub mod feature;
pub mod limits;
pub mod metadata;
pub mod metrics_defs;
pub mod queue;
pub mod request_store;
pub mod service;
pub mod stitch;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod testutils;

pub use call::{GitalyClient, InstrumentedStream};
pub use circuit_breaker::{CircuitKey, CircuitState};
pub use config::Config;
pub use context::{current_context, with_context};
pub use errors::{ClientError, Code, DetailedError, Status, StatusDetail, TransportError, Unwrapped};
pub use service::Service;
pub use transport::{CallDescriptor, Response, Timeout, Transport};
