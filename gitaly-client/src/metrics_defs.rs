//! Metrics definitions for the gitaly client.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CALL_DURATION: MetricDef = MetricDef {
    name: "gitaly.call.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent waiting on a gitaly call in seconds, summed over all pulls for streams",
};

pub const CIRCUIT_BREAKER_REQUEST: MetricDef = MetricDef {
    name: "gitaly.circuit_breaker.request",
    metric_type: MetricType::Counter,
    description: "Circuit breaker decisions, labelled allowed, rejected or errored",
};

pub const CIRCUIT_BREAKER_TRANSITION: MetricDef = MetricDef {
    name: "gitaly.circuit_breaker.transition",
    metric_type: MetricType::Counter,
    description: "Circuit state changes per endpoint and storage",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CALL_DURATION,
    CIRCUIT_BREAKER_REQUEST,
    CIRCUIT_BREAKER_TRANSITION,
];
