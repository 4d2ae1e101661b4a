use anyhow::{Context, Result};
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus recorder.
/// Returns a handle that renders the current metrics for scraping
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Initialize admission metrics to zero so they show up before the first event
pub fn initialize_admission_metrics(initial_quota: u64) {
    metrics::counter!("letter.rps").absolute(0);

    metrics::counter!("admission.pull_requests_total", "source" => "probe").absolute(0);
    metrics::counter!("admission.pull_requests_total", "source" => "ingest").absolute(0);
    metrics::counter!("admission.probe_panics_total").absolute(0);
    metrics::gauge!("admission.quota.remaining").set(initial_quota as f64);

    metrics::counter!("letters.decoded_total").absolute(0);
    metrics::counter!("letters.decode_failed_total").absolute(0);
    metrics::counter!("letters.forwarded_total").absolute(0);

    metrics::counter!("puller.http_error_total").absolute(0);
    metrics::counter!("puller.dropped_total").absolute(0);
    metrics::counter!("sink.http_error_total").absolute(0);
}

/// Router exposing `/metrics` for the given handle
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

/// Start a standalone metrics server on the specified port
pub async fn start_metrics_server(port: u16, handle: PrometheusHandle) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", addr))?;

    info!("Starting metrics server on http://{}/metrics", addr);
    axum::serve(listener, metrics_router(handle))
        .await
        .context("Metrics server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_route_renders_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("letter.rps").increment(3);
        });

        let response = metrics_router(handle)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("letter_rps"));
    }
}
