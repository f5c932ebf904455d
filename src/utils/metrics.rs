//! Prometheus metrics for collective observability.
//!
//! Provides per-collective counters and latency, transport traffic and
//! scratch pool usage.

use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;
#[cfg(feature = "metrics-server")]
use tracing::info;

/// Global metrics registry
static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// Collection of all collective-engine metrics
pub struct MetricsRegistry {
    pub registry: Registry,

    // Collective metrics
    pub collectives_issued: CounterVec,
    pub collectives_failed: CounterVec,
    pub collectives_canceled: CounterVec,
    pub collective_duration: HistogramVec,

    // Transport metrics
    pub messages_sent: Counter,
    pub bytes_sent: Counter,
    pub host_staged_copies: Counter,

    // Scratch pool metrics
    pub scratch_allocations: Counter,
    pub scratch_reuses: Counter,
    pub scratch_resident_bytes: IntGauge,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let collectives_issued = CounterVec::new(
            Opts::new("inc_collectives_issued_total", "Collectives issued"),
            &["op"],
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(collectives_issued.clone()))
            .expect("metric registered once");

        let collectives_failed = CounterVec::new(
            Opts::new("inc_collectives_failed_total", "Collectives that ended in failure"),
            &["op"],
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(collectives_failed.clone()))
            .expect("metric registered once");

        let collectives_canceled = CounterVec::new(
            Opts::new("inc_collectives_canceled_total", "Collectives canceled by the caller"),
            &["op"],
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(collectives_canceled.clone()))
            .expect("metric registered once");

        // Issue-to-completion latency in seconds
        let collective_duration = HistogramVec::new(
            HistogramOpts::new("inc_collective_duration_seconds", "Time per collective")
                .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["op", "algorithm"],
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(collective_duration.clone()))
            .expect("metric registered once");

        let messages_sent = Counter::with_opts(Opts::new(
            "inc_transport_messages_sent_total",
            "Point-to-point messages sent",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(messages_sent.clone()))
            .expect("metric registered once");

        let bytes_sent = Counter::with_opts(Opts::new(
            "inc_transport_bytes_sent_total",
            "Payload bytes sent",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(bytes_sent.clone()))
            .expect("metric registered once");

        let host_staged_copies = Counter::with_opts(Opts::new(
            "inc_host_staged_copies_total",
            "Copies that went through host memory between locations",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(host_staged_copies.clone()))
            .expect("metric registered once");

        let scratch_allocations = Counter::with_opts(Opts::new(
            "inc_scratch_allocations_total",
            "Fresh scratch buffer allocations",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(scratch_allocations.clone()))
            .expect("metric registered once");

        let scratch_reuses = Counter::with_opts(Opts::new(
            "inc_scratch_reuses_total",
            "Scratch leases served from the pool",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(scratch_reuses.clone()))
            .expect("metric registered once");

        let scratch_resident_bytes = IntGauge::with_opts(Opts::new(
            "inc_scratch_resident_bytes",
            "Bytes held by scratch pools",
        ))
        .expect("valid metric definition");
        registry
            .register(Box::new(scratch_resident_bytes.clone()))
            .expect("metric registered once");

        Self {
            registry,
            collectives_issued,
            collectives_failed,
            collectives_canceled,
            collective_duration,
            messages_sent,
            bytes_sent,
            host_staged_copies,
            scratch_allocations,
            scratch_reuses,
            scratch_resident_bytes,
        }
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics registry.
pub fn get_metrics() -> &'static MetricsRegistry {
    REGISTRY.get_or_init(MetricsRegistry::new)
}

/// Render every metric in the Prometheus text format.
pub fn gather_metrics() -> String {
    get_metrics().gather()
}

pub fn record_collective_issued(op: &str) {
    get_metrics().collectives_issued.with_label_values(&[op]).inc();
}

/// Record the terminal outcome of a collective.
pub fn record_collective_outcome(op: &str, algorithm: &str, duration_secs: f64, failed: bool, canceled: bool) {
    let m = get_metrics();
    m.collective_duration
        .with_label_values(&[op, algorithm])
        .observe(duration_secs);
    if canceled {
        m.collectives_canceled.with_label_values(&[op]).inc();
    } else if failed {
        m.collectives_failed.with_label_values(&[op]).inc();
    }
}

pub fn record_message_sent(bytes: usize) {
    let m = get_metrics();
    m.messages_sent.inc();
    m.bytes_sent.inc_by(bytes as f64);
}

pub fn record_host_staged_copy() {
    get_metrics().host_staged_copies.inc();
}

pub fn record_scratch_lease(reused: bool) {
    let m = get_metrics();
    if reused {
        m.scratch_reuses.inc();
    } else {
        m.scratch_allocations.inc();
    }
}

pub fn record_scratch_resident_delta(delta: i64) {
    get_metrics().scratch_resident_bytes.add(delta);
}

/// Start a simple HTTP server to expose metrics on the given port.
///
/// This is a basic implementation. For production, consider using
/// a proper web framework with graceful shutdown.
#[cfg(feature = "metrics-server")]
pub async fn start_metrics_server(port: u16) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Metrics server started");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics = gather_metrics();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics.len(),
                metrics
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = MetricsRegistry::new();
        metrics.collectives_issued.with_label_values(&["all_reduce"]).inc();
        metrics.bytes_sent.inc_by(1000.0);

        let output = metrics.gather();
        assert!(output.contains("inc_collectives_issued_total"));
        assert!(output.contains("inc_transport_bytes_sent_total"));
    }

    #[test]
    fn test_record_collective_outcome() {
        record_collective_issued("broadcast");
        record_collective_outcome("broadcast", "binomial_tree", 0.002, false, false);

        let output = get_metrics().gather();
        assert!(output.contains("inc_collective_duration_seconds"));
    }
}
