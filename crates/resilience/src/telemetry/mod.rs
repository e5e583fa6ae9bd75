//! Observability seams: structured events and metric export

pub mod events;
#[cfg(feature = "prometheus")]
pub mod prometheus;
pub mod sink;

pub use events::{EventSink, NoopEventSink, ResilienceEvent, TracingEventSink};
#[cfg(feature = "prometheus")]
pub use prometheus::PrometheusMetricsSink;
pub use sink::{names, MetricsSink, NoopMetricsSink};
