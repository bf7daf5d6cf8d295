//! Diagnostics sidecar.
//!
//! Serves process and runtime information on its own listener. It carries no
//! authentication and no rate limiting, so it should only be bound where
//! operators can reach it.

use std::sync::OnceLock;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::warn;

use crate::error::Result;

/// Per-request timeout on the sidecar.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

const ENDPOINTS: [&str; 4] = [
    "/debug/pprof/",
    "/debug/pprof/cmdline",
    "/debug/runtime",
    "/metrics",
];

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Installs the process-wide Prometheus recorder on first use.
///
/// Returns `None` if another recorder was installed first.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "metrics recorder not installed");
                None
            }
        })
        .as_ref()
}

/// Route table of the sidecar.
pub fn router() -> Router {
    Router::new()
        .route("/debug/pprof/", get(index))
        .route("/debug/pprof/cmdline", get(cmdline))
        .route("/debug/runtime", get(runtime))
        .route("/metrics", get(metrics))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

/// Serves the sidecar until `shutdown` fires.
///
/// # Errors
/// Returns an error if the server stops abnormally.
pub async fn serve(listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    prometheus_handle();
    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn index() -> impl IntoResponse {
    Json(json!({ "endpoints": ENDPOINTS }))
}

async fn cmdline() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        std::env::args().collect::<Vec<_>>().join("\0"),
    )
}

async fn runtime() -> impl IntoResponse {
    let metrics = tokio::runtime::Handle::current().metrics();
    Json(json!({
        "workers": metrics.num_workers(),
        "alive_tasks": metrics.num_alive_tasks(),
        "global_queue_depth": metrics.global_queue_depth(),
    }))
}

async fn metrics() -> impl IntoResponse {
    match prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            "metrics recorder unavailable\n".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    async fn get_json(path: &str) -> serde_json::Value {
        let response = router()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn index_lists_endpoints() {
        let json = get_json("/debug/pprof/").await;
        assert_eq!(json["endpoints"].as_array().unwrap().len(), ENDPOINTS.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runtime_reports_workers() {
        let json = get_json("/debug/runtime").await;
        assert_eq!(json["workers"], 2);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let response = router()
            .oneshot(Request::get("/debug/heap").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
