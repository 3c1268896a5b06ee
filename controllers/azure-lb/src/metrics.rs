//! Prometheus metrics and the `/metrics` + `/healthz` endpoint.
//!
//! Metrics live in a registry owned by [`Metrics`] rather than the process
//! default registry, so tests can build as many as they like.

use crate::error::ControllerError;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

const METRICS_NAMESPACE: &str = "azure_lb_controller";

/// Default port for the metrics server
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Controller metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: CounterVec,
    reconcile_duration: HistogramVec,
    cloud_operations: CounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_reconciliations_total"),
                "Service reconciliations by operation and result",
            ),
            &["operation", "result"],
        )?;
        registry.register(Box::new(reconciliations.clone()))?;

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{METRICS_NAMESPACE}_reconcile_duration_seconds"),
                "Duration of Service reconciliations in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["operation"],
        )?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        let cloud_operations = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_cloud_operations_total"),
                "Azure Resource Manager writes by resource, operation and result",
            ),
            &["resource", "operation", "result"],
        )?;
        registry.register(Box::new(cloud_operations.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            cloud_operations,
        })
    }

    /// Record one reconcile of `operation` (`ensure` or `delete`)
    pub fn record_reconcile(&self, operation: &str, success: bool, duration: Duration) {
        let result = if success { "success" } else { "error" };
        self.reconciliations.with_label_values(&[operation, result]).inc();
        self.reconcile_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Record one cloud write
    pub fn record_cloud_operation(&self, resource: &str, operation: &str, success: bool) {
        let result = if success { "success" } else { "error" };
        self.cloud_operations
            .with_label_values(&[resource, operation, result])
            .inc();
    }

    /// Text exposition of every registered metric
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("UTF-8 error: {e}")))
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.gather() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Routes served on the metrics port
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Serve metrics and health until the process exits
pub async fn serve(metrics: Arc<Metrics>, port: u16) -> Result<(), ControllerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("cannot bind metrics server on {}: {}", addr, e)))?;
    info!("Metrics server listening on {}", addr);
    axum::serve(listener, router(metrics))
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_gather_contains_recorded_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile("ensure", true, Duration::from_millis(300));
        metrics.record_cloud_operation("loadBalancer", "createOrUpdate", false);

        let text = metrics.gather().unwrap();
        assert!(text.contains("azure_lb_controller_reconciliations_total{operation=\"ensure\",result=\"success\"} 1"));
        assert!(text.contains("azure_lb_controller_cloud_operations_total"));
        assert!(text.contains("azure_lb_controller_reconcile_duration_seconds_bucket"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_reconcile("delete", false, Duration::from_secs(1));
        assert!(!second.gather().unwrap().contains("result=\"error\""));
    }

    #[tokio::test]
    async fn test_router_serves_metrics_and_health() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.record_reconcile("ensure", true, Duration::from_millis(10));

        let response = router(metrics.clone())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router(metrics)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("reconciliations_total"));
    }
}
