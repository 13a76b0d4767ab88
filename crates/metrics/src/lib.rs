//! Metrics and tracing setup for meridian nodes.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus a lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a meridian node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── RPC counters ──
    pub rpcs_sent: IntCounter,
    pub rpcs_received: IntCounter,
    pub rpcs_sent_by_type: IntCounterVec,
    pub rpcs_received_by_type: IntCounterVec,

    // ── RPC latency ──
    pub rpc_latency_secs: HistogramVec,

    // ── KV operation counters ──
    pub kv_puts: IntCounter,
    pub kv_gets: IntCounter,
    pub kv_deletes: IntCounter,
    pub quorum_failures: IntCounter,

    // ── KV operation latency ──
    pub kv_latency_secs: HistogramVec,

    // ── Replication ──
    pub replication_batches_sent: IntCounter,

    // ── Hints ──
    pub hints_stored: IntCounter,
    pub hints_delivered: IntCounter,

    // ── Read repair / anti-entropy ──
    pub read_repairs: IntCounter,
    pub anti_entropy_rounds: IntCounter,
    pub anti_entropy_keys_repaired: IntCounter,

    // ── Storage ──
    pub memtable_flushes: IntCounter,
    pub compactions: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for RPC/KV latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect(name)
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let rpcs_sent = counter("meridian_rpcs_sent_total", "Total outbound RPCs sent");
        let rpcs_received = counter(
            "meridian_rpcs_received_total",
            "Total inbound RPCs received",
        );
        let rpcs_sent_by_type = IntCounterVec::new(
            Opts::new(
                "meridian_rpcs_sent_by_type_total",
                "Outbound RPCs sent, by type",
            ),
            &["rpc_type"],
        )
        .expect("rpcs_sent_by_type counter vec");
        let rpcs_received_by_type = IntCounterVec::new(
            Opts::new(
                "meridian_rpcs_received_by_type_total",
                "Inbound RPCs received, by type",
            ),
            &["rpc_type"],
        )
        .expect("rpcs_received_by_type counter vec");

        let rpc_latency_secs = HistogramVec::new(
            HistogramOpts::new("meridian_rpc_latency_seconds", "RPC latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["rpc_type", "direction"],
        )
        .expect("rpc_latency_secs histogram");

        let kv_puts = counter("meridian_kv_puts_total", "KV PUT operations");
        let kv_gets = counter("meridian_kv_gets_total", "KV GET operations");
        let kv_deletes = counter("meridian_kv_deletes_total", "KV DELETE operations");
        let quorum_failures = counter(
            "meridian_quorum_failures_total",
            "Operations that missed their quorum",
        );

        let kv_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "meridian_kv_latency_seconds",
                "KV operation latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op_type"],
        )
        .expect("kv_latency_secs histogram");

        let replication_batches_sent = counter(
            "meridian_replication_batches_sent_total",
            "Replicate batches pushed to peers",
        );
        let hints_stored = counter(
            "meridian_hints_stored_total",
            "Hints stored for hinted handoff",
        );
        let hints_delivered = counter(
            "meridian_hints_delivered_total",
            "Hints successfully delivered",
        );
        let read_repairs = counter(
            "meridian_read_repairs_total",
            "Read repair operations triggered",
        );
        let anti_entropy_rounds = counter(
            "meridian_anti_entropy_rounds_total",
            "Completed anti-entropy rounds",
        );
        let anti_entropy_keys_repaired = counter(
            "meridian_anti_entropy_keys_repaired_total",
            "Keys pulled during anti-entropy",
        );
        let memtable_flushes = counter(
            "meridian_memtable_flushes_total",
            "Memtable flushes to L0",
        );
        let compactions = counter("meridian_compactions_total", "Completed compactions");

        for collector in [
            &rpcs_sent,
            &rpcs_received,
            &kv_puts,
            &kv_gets,
            &kv_deletes,
            &quorum_failures,
            &replication_batches_sent,
            &hints_stored,
            &hints_delivered,
            &read_repairs,
            &anti_entropy_rounds,
            &anti_entropy_keys_repaired,
            &memtable_flushes,
            &compactions,
        ] {
            registry
                .register(Box::new((*collector).clone()))
                .expect("register counter");
        }
        registry
            .register(Box::new(rpcs_sent_by_type.clone()))
            .expect("register rpcs_sent_by_type");
        registry
            .register(Box::new(rpcs_received_by_type.clone()))
            .expect("register rpcs_received_by_type");
        registry
            .register(Box::new(rpc_latency_secs.clone()))
            .expect("register rpc_latency_secs");
        registry
            .register(Box::new(kv_latency_secs.clone()))
            .expect("register kv_latency_secs");

        Self {
            registry,
            rpcs_sent,
            rpcs_received,
            rpcs_sent_by_type,
            rpcs_received_by_type,
            rpc_latency_secs,
            kv_puts,
            kv_gets,
            kv_deletes,
            quorum_failures,
            kv_latency_secs,
            replication_batches_sent,
            hints_stored,
            hints_delivered,
            read_repairs,
            anti_entropy_rounds,
            anti_entropy_keys_repaired,
            memtable_flushes,
            compactions,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start an RPC latency timer. Returns a guard that records
/// elapsed time on drop.
pub fn start_rpc_timer(rpc_type: &str, direction: &str) -> prometheus::HistogramTimer {
    metrics()
        .rpc_latency_secs
        .with_label_values(&[rpc_type, direction])
        .start_timer()
}

/// Helper: start a KV operation latency timer.
pub fn start_kv_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .kv_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let before = m.kv_puts.get();
        m.kv_puts.inc();
        m.kv_puts.inc();
        assert_eq!(m.kv_puts.get(), before + 2);

        m.hints_stored.inc();
        m.read_repairs.inc();
        m.anti_entropy_rounds.inc();
        m.rpcs_sent_by_type.with_label_values(&["put"]).inc();
        m.rpcs_received_by_type.with_label_values(&["replicate"]).inc();
    }

    #[test]
    fn test_encode_metrics_format() {
        metrics().quorum_failures.inc();

        let output = encode_metrics();
        assert!(output.contains("meridian_kv_puts_total"));
        assert!(output.contains("meridian_quorum_failures_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_latency_timer_records() {
        let m = metrics();
        {
            let _timer = start_kv_timer("test_op");
        }
        let h = m.kv_latency_secs.with_label_values(&["test_op"]);
        assert!(h.get_sample_count() >= 1);
    }
}
