//! Reconciliation metrics and the probe endpoint.
//!
//! Serves `/healthz`, `/readyz` and `/metrics` (Prometheus text format).

use crate::error::ControllerError;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Controller metrics registered in a private registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    failures: IntCounterVec,
    duration: HistogramVec,
    ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new_custom(Some("devbox_controller".to_string()), None)?;

        let reconciliations = IntCounterVec::new(
            Opts::new("reconciliations_total", "Reconciliation passes by result"),
            &["result"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("reconcile_failures_total", "Failed reconciliation passes by error kind"),
            &["error"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Duration of reconciliation passes")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["result"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            failures,
            duration,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn observe_success(&self, elapsed: Duration) {
        self.reconciliations.with_label_values(&["success"]).inc();
        self.duration
            .with_label_values(&["success"])
            .observe(elapsed.as_secs_f64());
    }

    pub fn observe_failure(&self, error: &ControllerError, elapsed: Duration) {
        self.reconciliations.with_label_values(&["error"]).inc();
        self.failures.with_label_values(&[error.metric_label()]).inc();
        self.duration
            .with_label_values(&["error"])
            .observe(elapsed.as_secs_f64());
    }

    /// Flip `/readyz` to 200 once watches are running
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    fn render(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ControllerError::Metrics(e.to_string()))
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> (StatusCode, String) {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn ready_handler(State(metrics): State<Metrics>) -> StatusCode {
    if metrics.ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Serve probes and metrics until the process exits
pub async fn serve(addr: SocketAddr, metrics: Metrics) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Metrics(format!("bind {addr}: {e}")))?;
    info!("Serving probes and metrics on {}", addr);
    axum::serve(listener, router(metrics))
        .await
        .map_err(|e| ControllerError::Metrics(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_observed_series() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_success(Duration::from_millis(20));
        metrics.observe_failure(&ControllerError::MultiplePods("ns/box".to_string()), Duration::from_millis(5));

        let body = metrics.render().unwrap();
        assert!(body.contains("devbox_controller_reconciliations_total{result=\"success\"} 1"));
        assert!(body.contains("devbox_controller_reconcile_failures_total{error=\"multiple_pods\"} 1"));
    }

    #[tokio::test]
    async fn test_ready_handler_follows_flag() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(ready_handler(State(metrics.clone())).await, StatusCode::SERVICE_UNAVAILABLE);

        metrics.mark_ready();
        assert_eq!(ready_handler(State(metrics)).await, StatusCode::OK);
    }
}
