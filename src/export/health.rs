use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::bind_address;

const NAMESPACE: &str = "traffic";

/// Which process the metrics belong to. Only that role's series are
/// registered, and therefore exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Pump,
    Sink,
}

/// Prometheus metrics for pump and sink health.
///
/// Every handle exists for both roles so callers never branch on role; the
/// other role's handles are simply not in the registry.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Pump ===
    /// Raw records read from the event source.
    pub events_received: Counter,
    /// Records dropped because they could not be decoded.
    pub events_dropped: Counter,
    /// Decoded events by syscall kind.
    pub events_by_kind: CounterVec,
    /// Buffered events dropped at shutdown.
    pub events_discarded: Counter,
    /// Events lost with a failed dispatch.
    pub events_lost: Counter,
    /// Batches acknowledged by the sink.
    pub batches_sent: Counter,
    /// Failed dispatches by failure kind.
    pub dispatch_failures: CounterVec,
    /// Time from dispatch start to acknowledgment or failure.
    pub dispatch_duration: Histogram,
    /// Events per flushed batch.
    pub batch_size: Histogram,
    /// Events currently buffered.
    pub buffer_length: Gauge,
    /// BPF programs attached by type (tracepoint/kprobe).
    pub bpf_programs_attached: GaugeVec,
    /// BPF programs that failed to attach by type.
    pub bpf_programs_failed: GaugeVec,

    // === Sink ===
    /// Batches ingested and acknowledged.
    pub batches_received: Counter,
    /// Events carried by ingested batches.
    pub events_ingested: Counter,
    /// Calls answered with an error status, by reason.
    pub batches_rejected: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with `role`'s metrics
    /// registered. An empty `addr` means the HTTP server is never started.
    pub fn new(role: Role, addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total raw records read from the event source.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_dropped = Counter::with_opts(
            Opts::new(
                "events_dropped_total",
                "Total records dropped because they could not be decoded.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_by_kind = CounterVec::new(
            Opts::new("events_by_kind_total", "Decoded events by syscall kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let events_discarded = Counter::with_opts(
            Opts::new(
                "events_discarded_total",
                "Buffered events discarded at shutdown.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_lost = Counter::with_opts(
            Opts::new(
                "events_lost_total",
                "Events lost together with a failed dispatch.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_sent = Counter::with_opts(
            Opts::new("batches_sent_total", "Batches acknowledged by the sink.")
                .namespace(NAMESPACE),
        )?;
        let dispatch_failures = CounterVec::new(
            Opts::new(
                "dispatch_failures_total",
                "Failed batch dispatches by failure kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let dispatch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dispatch_duration_seconds",
                "Time to deliver a batch and receive its acknowledgment.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Number of events per flushed batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
        )?;
        let buffer_length = Gauge::with_opts(
            Opts::new("buffer_length", "Events currently buffered for the next flush.")
                .namespace(NAMESPACE),
        )?;
        let bpf_programs_attached = GaugeVec::new(
            Opts::new(
                "bpf_programs_attached",
                "Number of successfully attached BPF programs by type.",
            )
            .namespace(NAMESPACE),
            &["type"],
        )?;
        let bpf_programs_failed = GaugeVec::new(
            Opts::new(
                "bpf_programs_failed",
                "Number of BPF programs that failed to attach by type.",
            )
            .namespace(NAMESPACE),
            &["type"],
        )?;

        let batches_received = Counter::with_opts(
            Opts::new(
                "batches_received_total",
                "Batches ingested and acknowledged by the sink.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_ingested = Counter::with_opts(
            Opts::new(
                "events_ingested_total",
                "Events carried by batches ingested by the sink.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_rejected = CounterVec::new(
            Opts::new(
                "batches_rejected_total",
                "Inbound calls answered with an error status, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;

        match role {
            Role::Pump => {
                registry.register(Box::new(events_received.clone()))?;
                registry.register(Box::new(events_dropped.clone()))?;
                registry.register(Box::new(events_by_kind.clone()))?;
                registry.register(Box::new(events_discarded.clone()))?;
                registry.register(Box::new(events_lost.clone()))?;
                registry.register(Box::new(batches_sent.clone()))?;
                registry.register(Box::new(dispatch_failures.clone()))?;
                registry.register(Box::new(dispatch_duration.clone()))?;
                registry.register(Box::new(batch_size.clone()))?;
                registry.register(Box::new(buffer_length.clone()))?;
                registry.register(Box::new(bpf_programs_attached.clone()))?;
                registry.register(Box::new(bpf_programs_failed.clone()))?;
            }
            Role::Sink => {
                registry.register(Box::new(batches_received.clone()))?;
                registry.register(Box::new(events_ingested.clone()))?;
                registry.register(Box::new(batches_rejected.clone()))?;
            }
        }

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_dropped,
            events_by_kind,
            events_discarded,
            events_lost,
            batches_sent,
            dispatch_failures,
            dispatch_duration,
            batch_size,
            buffer_length,
            bpf_programs_attached,
            bpf_programs_failed,
            batches_received,
            events_ingested,
            batches_rejected,
        })
    }

    /// Whether an HTTP listen address was configured.
    pub fn is_enabled(&self) -> bool {
        !self.addr.is_empty()
    }

    /// Starts the HTTP server serving /metrics and /healthz, returning the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "serving metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
