//! Metrics HTTP server
//!
//! Exposes the shared snapshot as JSON on `GET /metrics`.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::{MetricsSnapshot, SharedMetrics};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("failed to serve metrics: {0}")]
    Io(#[from] std::io::Error),
}

/// Handler for GET /metrics
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with metrics endpoint
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Serve metrics on `listen` until `cancel` fires.
pub async fn run_metrics_server(
    metrics: SharedMetrics,
    listen: &str,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| ServerError::InvalidAddress(listen.to_string()))?;
    let app = create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{new_shared_metrics, RunningJob};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_metrics_returns_json() {
        let metrics = new_shared_metrics();
        {
            let mut snapshot = metrics.write().await;
            snapshot.timestamp_unix_ms = 1701388800000;
            snapshot.ingest.inserted = 7;
            snapshot.scheduler.completed = 42;
            snapshot.scheduler.failed = 2;
            snapshot.table.pending = 5;
            snapshot.running.push(RunningJob {
                id: 9,
                input_path: "/in/video.mp4".to_string(),
                output_path: "/out/compressed_video.mp4".to_string(),
                encoder: "hevc_qsv".to_string(),
                started_at_unix_ms: 1701388790000,
                size_in_bytes_before: 5368709120,
            });
        }

        let app = create_metrics_router(metrics.clone());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let snapshot: MetricsSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to MetricsSnapshot");

        assert_eq!(snapshot.timestamp_unix_ms, 1701388800000);
        assert_eq!(snapshot.ingest.inserted, 7);
        assert_eq!(snapshot.scheduler.completed, 42);
        assert_eq!(snapshot.table.pending, 5);
        assert_eq!(snapshot.running.len(), 1);
        assert_eq!(snapshot.running[0].encoder, "hevc_qsv");
    }

    #[tokio::test]
    async fn test_get_metrics_empty_snapshot() {
        let app = create_metrics_router(new_shared_metrics());

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        for key in ["timestamp_unix_ms", "running", "ingest", "scheduler", "table"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["running"].as_array().map(|a| a.len()), Some(0));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = create_metrics_router(new_shared_metrics());
        let response = app
            .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_listen_address() {
        let err = run_metrics_server(new_shared_metrics(), "not-an-addr", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidAddress(_)));
    }
}
