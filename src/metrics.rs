//! Controller metrics emission.
//!
//! Metrics are emitted as structured tracing events by default. A sink can
//! be installed to capture emissions in unit tests or to bridge into a real
//! metrics backend.

use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
            MetricValue::Histogram(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
        }
    }
}

static METRIC_SINK: std::sync::OnceLock<RwLock<Arc<dyn MetricSink>>> = std::sync::OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = sink;
}

fn emit(name: &'static str, value: MetricValue, controller: &str) {
    sink().record(MetricEvent {
        name,
        value,
        labels: vec![MetricLabel {
            key: "controller",
            value: controller.to_string(),
        }],
    });
}

fn duration_ms(duration: Duration) -> u64 {
    let ms = duration.as_millis();
    u64::try_from(ms).unwrap_or(u64::MAX)
}

pub fn event_processed(controller: &str) {
    emit("stream_events_processed", MetricValue::Counter(1), controller);
}

pub fn event_skipped(controller: &str) {
    emit("stream_events_skipped", MetricValue::Counter(1), controller);
}

pub fn event_written(controller: &str) {
    emit("stream_events_written", MetricValue::Counter(1), controller);
}

pub fn snapshot_size(controller: &str, bytes: u64) {
    emit("snapshot_size_bytes", MetricValue::Histogram(bytes), controller);
}

pub fn snapshot_duration(controller: &str, duration: Duration) {
    emit(
        "snapshot_duration_ms",
        MetricValue::Histogram(duration_ms(duration)),
        controller,
    );
}
