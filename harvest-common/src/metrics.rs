//! # Metrics
//!
//! The probe and Prometheus router every long running stage serves.
use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{Request, StatusCode},
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;

use crate::health::HealthRegistry;

/// `/_liveness` reports the health registry, `/_readiness` turns 503 once `shutdown` is
/// cancelled so no new traffic is routed to a draining process.
pub fn status_router(liveness: HealthRegistry, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/_readiness",
            get(move || {
                let status = if shutdown.is_cancelled() {
                    (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
                } else {
                    (StatusCode::OK, "ready")
                };
                std::future::ready(status)
            }),
        )
}

pub async fn index() -> &'static str {
    "harvest"
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 60000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn spawn_router(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_readiness_turns_unavailable_on_shutdown() {
        let shutdown = CancellationToken::new();
        let router = status_router(HealthRegistry::new("liveness"), shutdown.clone());
        let base = spawn_router(router).await;

        let ready = reqwest::get(format!("{base}/_readiness")).await.unwrap();
        assert_eq!(ready.status().as_u16(), 200);

        shutdown.cancel();
        let draining = reqwest::get(format!("{base}/_readiness")).await.unwrap();
        assert_eq!(draining.status().as_u16(), 503);
    }

    #[tokio::test]
    async fn test_liveness_follows_registry() {
        let liveness = HealthRegistry::new("liveness");
        let handle = liveness.register("worker-0", Duration::from_secs(30));
        let base = spawn_router(status_router(liveness, CancellationToken::new())).await;

        let starting = reqwest::get(format!("{base}/_liveness")).await.unwrap();
        assert_eq!(starting.status().as_u16(), 500);

        handle.report_healthy();
        let healthy = reqwest::get(format!("{base}/_liveness")).await.unwrap();
        assert_eq!(healthy.status().as_u16(), 200);
    }
}
