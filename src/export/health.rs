use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for supervisor health.
///
/// All metrics use the "eventwatch" namespace. The registry always exists;
/// the HTTP server only runs when an address is configured.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Records counted into an aggregate.
    pub records_accepted: Counter,
    /// Records read but filtered out (unmonitored or generated before start).
    pub records_ignored: Counter,
    /// Observed worker deaths.
    pub worker_failures: Counter,
    /// Workers started as replacements for dead ones.
    pub worker_respawns: Counter,
    /// Snapshots written.
    pub exports: Counter,
    /// Snapshot writes that failed.
    pub export_errors: Counter,
    /// Targets with a running worker.
    pub active_workers: Gauge,
    /// Targets waiting for their retry delay to elapse.
    pub pending_respawns: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_accepted = Counter::with_opts(
            Opts::new(
                "records_accepted_total",
                "Event records counted into an aggregate.",
            )
            .namespace("eventwatch"),
        )?;
        let records_ignored = Counter::with_opts(
            Opts::new(
                "records_ignored_total",
                "Event records filtered out by identifier or generation time.",
            )
            .namespace("eventwatch"),
        )?;
        let worker_failures = Counter::with_opts(
            Opts::new("worker_failures_total", "Observed worker deaths.").namespace("eventwatch"),
        )?;
        let worker_respawns = Counter::with_opts(
            Opts::new(
                "worker_respawns_total",
                "Workers started to replace a dead one.",
            )
            .namespace("eventwatch"),
        )?;
        let exports = Counter::with_opts(
            Opts::new("exports_total", "Snapshots written.").namespace("eventwatch"),
        )?;
        let export_errors = Counter::with_opts(
            Opts::new("export_errors_total", "Snapshot writes that failed.")
                .namespace("eventwatch"),
        )?;
        let active_workers = Gauge::with_opts(
            Opts::new("active_workers", "Targets with a running worker.").namespace("eventwatch"),
        )?;
        let pending_respawns = Gauge::with_opts(
            Opts::new(
                "pending_respawns",
                "Targets waiting for the retry delay before respawn.",
            )
            .namespace("eventwatch"),
        )?;

        registry.register(Box::new(records_accepted.clone()))?;
        registry.register(Box::new(records_ignored.clone()))?;
        registry.register(Box::new(worker_failures.clone()))?;
        registry.register(Box::new(worker_respawns.clone()))?;
        registry.register(Box::new(exports.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(pending_respawns.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_accepted,
            records_ignored,
            worker_failures,
            worker_respawns,
            exports,
            export_errors,
            active_workers,
            pending_respawns,
        })
    }

    /// Returns true if an HTTP listen address was configured.
    pub fn is_enabled(&self) -> bool {
        !self.addr.is_empty()
    }

    /// Binds the configured address and serves `/metrics` and `/healthz`
    /// until [`HealthMetrics::stop`] is called.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = listen_addr(&self.addr);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding health server to {addr}"))?;
        let local_addr = listener.local_addr().context("reading health server address")?;

        let cancel = CancellationToken::new();
        if let Some(previous) = self.shutdown.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let app = router(self.registry.clone());
        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health server listening");

            let served = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "health server failed");
            }
        });

        Ok(local_addr)
    }

    /// Signals the server to stop accepting connections. No-op if it never
    /// started.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }
}

/// `":9464"` listens on every interface.
fn listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry)
}

fn encode(registry: &Registry) -> Result<String> {
    let mut text = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut text)
        .context("encoding metrics")?;
    String::from_utf8(text).context("metrics are not UTF-8")
}

async fn metrics_handler(State(registry): State<Registry>) -> Response {
    match encode(&registry) {
        Ok(text) => text.into_response(),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "rendering /metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
