//! HTTP server for image proxy endpoints
//!
//! Provides /health and /image?url=<image url>.

use crate::error::Result;
use crate::types::HealthResponse;
use aimage::{Loader, RawDecoder};
use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use url::Url;

/// Shared state for the HTTP server
pub struct ServerState {
    pub loader: Loader<RawDecoder>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(loader: Loader<RawDecoder>) -> Self {
        Self {
            loader,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct ImageQuery {
    url: Option<String>,
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/image", get(get_image))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: state.loader.stats(),
    })
}

/// Get an image through the loader's memory, disk and network tiers
async fn get_image(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> Response {
    let Some(url) = query.url.filter(|u| !u.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing url parameter");
    };
    match Url::parse(&url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid url parameter"),
    }

    let from_cache = state.loader.memory().contains(&url);
    match fetch_image(&state, &url).await {
        Ok(data) => {
            let cache_header = if from_cache { "HIT" } else { "MISS" };
            let content_type = sniff_content_type(&data);

            (
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "public, max-age=86400"),
                    (HeaderName::from_static("x-cache"), cache_header),
                ],
                Body::from(data),
            )
                .into_response()
        }
        Err(e) => {
            warn!(url = %url, error = %e, "Failed to load image");
            error_response(StatusCode::NOT_FOUND, "Image not found")
        }
    }
}

/// Resolve an image, waiting at most the loader's configured timeout
async fn fetch_image(state: &ServerState, url: &str) -> Result<Bytes> {
    let payload = state.loader.load(url).await?;
    Ok(Bytes::clone(&payload))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Content type from the leading bytes of common image formats
fn sniff_content_type(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(&[0xff, 0xd8, 0xff]) {
        "image/jpeg"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "image/gif"
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aimage::{ByteStream, FetchError, InlineNotifier, LoaderConfig, Transport};
    use async_trait::async_trait;
    use axum::http::Request;
    use futures::StreamExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";

    /// Serves a PNG for `.png` URLs and 404 for everything else
    struct StaticTransport;

    #[async_trait]
    impl Transport for StaticTransport {
        async fn fetch(&self, key: &str) -> aimage::Result<ByteStream> {
            if !key.ends_with(".png") {
                return Err(FetchError::Status(404));
            }
            let chunks = vec![Ok(Bytes::from_static(PNG))];
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    async fn create_test_state(cache_dir: &Path) -> SharedState {
        let config = LoaderConfig {
            cache_dir: Some(cache_dir.to_path_buf()),
            load_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let loader = Loader::open(
            config,
            Arc::new(StaticTransport),
            RawDecoder,
            Arc::new(InlineNotifier),
        )
        .await
        .unwrap();
        Arc::new(ServerState::new(loader))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);

        let response = router.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].as_u64().is_some());
        assert_eq!(json["cache"]["memory_entries"], 0);
        assert_eq!(json["cache"]["memory_capacity"], 32 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_image_endpoint_miss_then_hit() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);
        let uri = "/image?url=http%3A%2F%2Fexample.com%2Fcat.png";

        let response = router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(response.headers()["x-cache"], "MISS");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], PNG);

        let response = router.oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "HIT");
    }

    #[tokio::test]
    async fn test_image_endpoint_not_found() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);

        let response = router
            .oneshot(get("/image?url=http%3A%2F%2Fexample.com%2Fmissing.jpg"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_image_endpoint_rejects_bad_urls() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);

        for uri in [
            "/image",
            "/image?url=",
            "/image?url=not-a-url",
            "/image?url=ftp%3A%2F%2Fx%2Fa.png",
        ] {
            let response = router.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(PNG), "image/png");
        assert_eq!(sniff_content_type(&[0xff, 0xd8, 0xff, 0xe0]), "image/jpeg");
        assert_eq!(sniff_content_type(b"GIF89a...."), "image/gif");
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_content_type(b"hello"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_server_state_new() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path()).await;

        // started_at should be close to now
        let diff = (Utc::now() - state.started_at).num_seconds();
        assert!((0..5).contains(&diff));
    }
}
