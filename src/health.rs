//! Health HTTP server for uptime monitors.
//!
//! `/health` and `/ping` answer liveness checks; `/stats` returns the
//! relay's counters as JSON.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use crate::pipeline::stats::RelayStats;
use crate::shutdown::Shutdown;

/// Build the health router.
pub fn health_routes(stats: Arc<RelayStats>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/stats", get(stats_snapshot))
        .with_state(stats)
}

/// Serve the health router on `0.0.0.0:port` until shutdown.
pub async fn serve(
    port: u16,
    stats: Arc<RelayStats>,
    mut shutdown: Shutdown,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Health server started");
    axum::serve(listener, health_routes(stats))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

async fn health(State(stats): State<Arc<RelayStats>>) -> impl IntoResponse {
    let snapshot = stats.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "service": "tg-relay",
        "streaming": snapshot.any_streaming(),
        "uptime_secs": snapshot.uptime_secs,
    }))
}

async fn ping() -> &'static str {
    "pong"
}

async fn stats_snapshot(State(stats): State<Arc<RelayStats>>) -> impl IntoResponse {
    Json(stats.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let stats = Arc::new(RelayStats::new());
        let body = get_json(health_routes(stats), "/health").await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["streaming"], false);
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let app = health_routes(Arc::new(RelayStats::new()));
        let resp = app
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"pong");
    }

    #[tokio::test]
    async fn stats_exposes_counters() {
        let stats = Arc::new(RelayStats::new());
        stats.register_source("-1001", "Weather A");
        stats.record_received();
        stats.record_forwarded("-1001");

        let body = get_json(health_routes(stats), "/stats").await;
        assert_eq!(body["received"], 1);
        assert_eq!(body["forwarded"], 1);
        assert_eq!(body["sources"]["-1001"]["name"], "Weather A");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = health_routes(Arc::new(RelayStats::new()));
        let resp = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
