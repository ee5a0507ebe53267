//! Prometheus metrics for sync engines
//!
//! `MetricsPlugin` records what an engine does into a shared [`Metrics`]
//! registry; `MetricsServer` exposes it in Prometheus text format over HTTP.

use crate::plugin::{EngineEvent, PluginContext, SyncPlugin};
use crate::error::EngineResult;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Sync metrics collector, shared by every engine in the process
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Sync metrics
    pub syncs_total: IntCounterVec,
    pub sync_errors: IntCounterVec,
    pub sync_duration_seconds: HistogramVec,

    // Change metrics
    pub changes_total: IntCounterVec,
    pub warnings_total: IntCounterVec,
    pub rollbacks_total: IntCounterVec,

    // Replica metrics
    pub replicas_active: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let syncs_total = IntCounterVec::new(
            Opts::new("dsync_syncs_total", "Total number of syncs"),
            &["client", "direction"],
        )
        .unwrap();

        let sync_errors = IntCounterVec::new(
            Opts::new("dsync_sync_errors_total", "Total number of failed operations"),
            &["client", "operation", "code"],
        )
        .unwrap();

        let sync_duration_seconds = HistogramVec::new(
            HistogramOpts::new("dsync_sync_duration_seconds", "Sync duration")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["direction"],
        )
        .unwrap();

        let changes_total = IntCounterVec::new(
            Opts::new("dsync_changes_total", "Total element changes sent or applied"),
            &["client", "direction"],
        )
        .unwrap();

        let warnings_total = IntCounterVec::new(
            Opts::new("dsync_warnings_total", "Total operations skipped with a warning"),
            &["client", "code"],
        )
        .unwrap();

        let rollbacks_total = IntCounterVec::new(
            Opts::new("dsync_rollbacks_total", "Total remote diffs rolled back"),
            &["client"],
        )
        .unwrap();

        let replicas_active = IntGaugeVec::new(
            Opts::new("dsync_replicas_active", "Engines with this plugin attached"),
            &["client"],
        )
        .unwrap();

        registry.register(Box::new(syncs_total.clone())).unwrap();
        registry.register(Box::new(sync_errors.clone())).unwrap();
        registry.register(Box::new(sync_duration_seconds.clone())).unwrap();
        registry.register(Box::new(changes_total.clone())).unwrap();
        registry.register(Box::new(warnings_total.clone())).unwrap();
        registry.register(Box::new(rollbacks_total.clone())).unwrap();
        registry.register(Box::new(replicas_active.clone())).unwrap();

        Self {
            registry,
            syncs_total,
            sync_errors,
            sync_duration_seconds,
            changes_total,
            warnings_total,
            rollbacks_total,
            replicas_active,
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Records one engine's events into [`Metrics`]
pub struct MetricsPlugin {
    metrics: Arc<Metrics>,
    client_id: String,
}

impl MetricsPlugin {
    pub const NAME: &'static str = "metrics";

    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            client_id: String::new(),
        }
    }
}

impl SyncPlugin for MetricsPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initialize(&mut self, ctx: &PluginContext) -> EngineResult<()> {
        self.client_id = ctx.client_id.clone();
        self.metrics.replicas_active.with_label_values(&[&self.client_id]).inc();
        Ok(())
    }

    fn on_event(&mut self, event: &EngineEvent) {
        let client = self.client_id.as_str();
        match event {
            EngineEvent::LocalSync { result, .. } | EngineEvent::RemoteSync { result, .. } => {
                let direction = match event {
                    EngineEvent::LocalSync { .. } => "local",
                    _ => "remote",
                };
                self.metrics.syncs_total.with_label_values(&[client, direction]).inc();
                self.metrics
                    .changes_total
                    .with_label_values(&[client, direction])
                    .inc_by(result.applied_changes as u64);
                self.metrics
                    .sync_duration_seconds
                    .with_label_values(&[direction])
                    .observe(result.duration_ms as f64 / 1000.0);
                for warning in &result.warnings {
                    self.metrics
                        .warnings_total
                        .with_label_values(&[client, warning.code.as_str()])
                        .inc();
                }
                if result.rolled_back {
                    self.metrics.rollbacks_total.with_label_values(&[client]).inc();
                }
            }
            EngineEvent::SyncError { operation, errors } => {
                let operation = operation.to_string();
                for e in errors {
                    self.metrics
                        .sync_errors
                        .with_label_values(&[client, &operation, e.code.as_str()])
                        .inc();
                }
            }
        }
    }

    fn destroy(&mut self) {
        self.metrics.replicas_active.with_label_values(&[&self.client_id]).dec();
    }
}

/// HTTP server for the metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Serve `/metrics` and `/health` until the task is dropped
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let n = match stream.read(&mut buf).await {
                            Ok(n) if n > 0 => n,
                            _ => return,
                        };
                        let request = String::from_utf8_lossy(&buf[..n]);
                        let response = if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
                            let body = metrics.export();
                            format!(
                                "HTTP/1.1 200 OK\r\n\
                                 Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                                 Content-Length: {}\r\n\
                                 \r\n\
                                 {}",
                                body.len(),
                                body
                            )
                        } else if request.starts_with("GET /health") {
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK".to_string()
                        } else {
                            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
                        };
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}
