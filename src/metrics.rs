//! Client metrics.
//!
//! Every subsystem reports through the [`MetricsRegistry`] carried in
//! [`Config::metrics`](crate::config::Config). Nothing is global: two clients
//! in one process keep separate counts.
//!
//! # Names
//!
//! | Name | Kind | Scope |
//! |------|------|-------|
//! | `request-rate` | meter | global, `-for-broker-<id>` |
//! | `request-size` | histogram | global, `-for-broker-<id>` |
//! | `request-latency-in-ms` | histogram | global, `-for-broker-<id>` |
//! | `response-rate` | meter | global, `-for-broker-<id>` |
//! | `response-size` | histogram | global, `-for-broker-<id>` |
//! | `incoming-byte-rate` | meter | global, `-for-broker-<id>` |
//! | `outgoing-byte-rate` | meter | global, `-for-broker-<id>` |
//! | `throttle-time-in-ms` | histogram | global, `-for-broker-<id>` |
//! | `batch-size` | histogram | global, `-for-topic-<name>` |
//! | `compression-ratio` | histogram | global, `-for-topic-<name>` |
//! | `record-send-rate` | meter | global, `-for-topic-<name>` |
//! | `records-per-request` | histogram | global, `-for-topic-<name>` |
//!
//! Compression ratio is reported as an integer percentage: 50 means the
//! payload shrank to half, 1000 means it grew tenfold.

use std::fmt;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Registry, TextEncoder, opts};

use crate::error::{Error, Result};

pub const REQUEST_RATE: &str = "request-rate";
pub const REQUEST_SIZE: &str = "request-size";
pub const REQUEST_LATENCY: &str = "request-latency-in-ms";
pub const RESPONSE_RATE: &str = "response-rate";
pub const RESPONSE_SIZE: &str = "response-size";
pub const INCOMING_BYTE_RATE: &str = "incoming-byte-rate";
pub const OUTGOING_BYTE_RATE: &str = "outgoing-byte-rate";
pub const THROTTLE_TIME: &str = "throttle-time-in-ms";
pub const BATCH_SIZE: &str = "batch-size";
pub const COMPRESSION_RATIO: &str = "compression-ratio";
pub const RECORD_SEND_RATE: &str = "record-send-rate";
pub const RECORDS_PER_REQUEST: &str = "records-per-request";

/// Sink for meters and histograms. Implementations must tolerate concurrent
/// writers.
pub trait MetricsRegistry: Send + Sync + fmt::Debug {
    /// Add `count` events to the meter `name`.
    fn mark_meter(&self, name: &str, count: u64);

    /// Record one observation in the histogram `name`.
    fn update_histogram(&self, name: &str, value: i64);
}

/// Name of the per-broker copy of a metric.
pub fn for_broker(name: &str, broker_id: i32) -> String {
    format!("{name}-for-broker-{broker_id}")
}

/// Name of the per-topic copy of a metric.
pub fn for_topic(name: &str, topic: &str) -> String {
    format!("{name}-for-topic-{topic}")
}

/// Compression ratio as an integer percentage.
pub fn compression_ratio(uncompressed: usize, compressed: usize) -> i64 {
    if uncompressed == 0 {
        return 100;
    }
    (compressed as f64 / uncompressed as f64 * 100.0).round() as i64
}

/// Collects nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRegistry for NoopMetrics {
    fn mark_meter(&self, _name: &str, _count: u64) {}

    fn update_histogram(&self, _name: &str, _value: i64) {}
}

/// Prometheus-backed registry.
///
/// Meters become one `gregor_meter_total` counter and histograms one
/// `gregor_histogram` histogram, both labelled by metric name. The registry
/// is private to this instance; expose it with [`gather`](Self::gather) or
/// [`encode_text`](Self::encode_text).
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    meters: IntCounterVec,
    histograms: HistogramVec,
}

impl fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let registry =
            Registry::new_custom(Some("gregor".to_string()), None).unwrap_or_else(|_| Registry::new());
        let meters = IntCounterVec::new(opts!("meter_total", "Client event meters"), &["name"])
            .expect("metric opts should be valid");
        let histograms = HistogramVec::new(
            HistogramOpts::new("histogram", "Client histograms").buckets(vec![
                1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0,
            ]),
            &["name"],
        )
        .expect("metric opts should be valid");
        if let Err(e) = registry.register(Box::new(meters.clone())) {
            tracing::warn!(error = %e, "Failed to register meter family");
        }
        if let Err(e) = registry.register(Box::new(histograms.clone())) {
            tracing::warn!(error = %e, "Failed to register histogram family");
        }
        Self {
            registry,
            meters,
            histograms,
        }
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Encode every metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.gather(), &mut buffer)
            .map_err(|e| Error::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Current value of a meter.
    pub fn meter_count(&self, name: &str) -> u64 {
        self.meters.with_label_values(&[name]).get()
    }

    /// Number of observations recorded in a histogram.
    pub fn histogram_count(&self, name: &str) -> u64 {
        self.histograms.with_label_values(&[name]).get_sample_count()
    }

    /// Sum of the observations recorded in a histogram.
    pub fn histogram_sum(&self, name: &str) -> f64 {
        self.histograms.with_label_values(&[name]).get_sample_sum()
    }
}

impl MetricsRegistry for PrometheusMetrics {
    fn mark_meter(&self, name: &str, count: u64) {
        self.meters.with_label_values(&[name]).inc_by(count);
    }

    fn update_histogram(&self, name: &str, value: i64) {
        self.histograms
            .with_label_values(&[name])
            .observe(value as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_names() {
        assert_eq!(for_broker(REQUEST_RATE, 3), "request-rate-for-broker-3");
        assert_eq!(for_topic(BATCH_SIZE, "t"), "batch-size-for-topic-t");
    }

    #[test]
    fn test_compression_ratio_percent() {
        assert_eq!(compression_ratio(1000, 500), 50);
        assert_eq!(compression_ratio(100, 1000), 1000);
        assert_eq!(compression_ratio(0, 0), 100);
    }

    #[test]
    fn test_prometheus_meters_and_histograms() {
        let metrics = PrometheusMetrics::new();
        metrics.mark_meter(REQUEST_RATE, 2);
        metrics.mark_meter(REQUEST_RATE, 3);
        metrics.update_histogram(REQUEST_SIZE, 120);
        metrics.update_histogram(REQUEST_SIZE, 80);

        assert_eq!(metrics.meter_count(REQUEST_RATE), 5);
        assert_eq!(metrics.histogram_count(REQUEST_SIZE), 2);
        assert_eq!(metrics.histogram_sum(REQUEST_SIZE), 200.0);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("gregor_meter_total"));
        assert!(text.contains("request-rate"));
    }

    #[test]
    fn test_instances_are_isolated() {
        let a = PrometheusMetrics::new();
        let b = PrometheusMetrics::new();
        a.mark_meter(RESPONSE_RATE, 1);
        assert_eq!(b.meter_count(RESPONSE_RATE), 0);
    }
}
