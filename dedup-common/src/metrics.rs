//! Operator-facing HTTP surface: the Prometheus scrape endpoint and the health checks.
use std::io;
use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;

use crate::health::HealthRegistry;

/// Histogram bounds in seconds. The tail covers events whose search and commit both run slow.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0,
];

const BANNER: &str = "customer duplicate detection worker";

/// Install the process-wide Prometheus recorder. Can only succeed once per process.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS)?
        .install_recorder()
}

/// Routes for scraping and for the orchestrator's checks.
///
/// Readiness only says the server is up. Liveness turns unhealthy once the consumer stops
/// reporting in.
pub fn operator_router(liveness: HealthRegistry, recorder: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/_readiness", get(banner))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .route("/metrics", get(move || std::future::ready(recorder.render())))
        .layer(middleware::from_fn(observe_request))
}

pub async fn serve(router: Router, bind: &str) -> io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(bind, "serving health checks and metrics");

    axum::serve(listener, router).await
}

async fn banner() -> &'static str {
    BANNER
}

async fn observe_request(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();

    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_owned(), |p| p.as_str().to_owned());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_str().to_owned()),
    ];
    metrics::counter!("dedup_http_requests_total", &labels).increment(1);
    metrics::histogram!("dedup_http_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}
