use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::trace;
use uuid::Uuid;

use streamgate_core::{StreamCoordinator, StreamStatus};

use crate::api_error::ApiError;

#[derive(Clone)]
struct AppState {
    coordinator: Arc<StreamCoordinator>,
}

pub fn router(coordinator: Arc<StreamCoordinator>) -> Router {
    let state = AppState { coordinator };

    Router::new()
        .route("/stream", post(create_stream))
        .route("/stream/:id/status", get(stream_status))
        .route("/stream/:id", get(get_playlist).delete(delete_stream))
        .route("/hls/:id/:file", get(get_hls_file))
        .route("/health", get(health))
        .with_state(state)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::default().allow_origin(AllowOrigin::predicate(|_, _| true))
}

#[derive(Deserialize)]
struct CreateStreamRequest {
    #[serde(rename = "magnetUrl")]
    magnet_url: Option<String>,
}

#[derive(Serialize)]
struct CreateStreamResponse {
    #[serde(rename = "streamId")]
    stream_id: Uuid,
    status: &'static str,
    #[serde(rename = "hlsUrl")]
    hls_url: String,
    #[serde(rename = "statusUrl")]
    status_url: String,
}

async fn create_stream(
    State(state): State<AppState>,
    Json(req): Json<CreateStreamRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let magnet_url = req
        .magnet_url
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::invalid_input("magnetUrl is required"))?;

    let stream_id = state
        .coordinator
        .create_stream(magnet_url)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(CreateStreamResponse {
        stream_id,
        status: "initializing",
        hls_url: format!("/stream/{stream_id}"),
        status_url: format!("/stream/{stream_id}/status"),
    }))
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(rename = "streamId")]
    stream_id: Uuid,
    status: StreamStatus,
    progress: u8,
    error: Option<String>,
    #[serde(rename = "createdAt")]
    created_at: u64,
    #[serde(rename = "updatedAt")]
    updated_at: u64,
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::not_found("stream not found"))
}

async fn stream_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let stream = state
        .coordinator
        .status(id)
        .ok_or_else(|| ApiError::not_found("stream not found"))?;

    Ok(Json(StatusResponse {
        stream_id: stream.id,
        status: stream.status,
        progress: stream.progress,
        error: stream.error,
        created_at: unix_secs(stream.created_at),
        updated_at: unix_secs(stream.updated_at),
    }))
}

#[derive(Serialize)]
struct PendingResponse {
    status: StreamStatus,
    progress: u8,
    message: &'static str,
}

async fn get_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let stream = state
        .coordinator
        .status(id)
        .ok_or_else(|| ApiError::not_found("stream not found"))?;

    if stream.status != StreamStatus::Ready {
        let body = PendingResponse {
            status: stream.status,
            progress: stream.progress,
            message: "stream is not ready yet",
        };
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let playlist_path = state.coordinator.paths().playlist_path(id);
    let bytes = tokio::fs::read(&playlist_path)
        .await
        .map_err(|_| ApiError::not_found("playlist not found"))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/vnd.apple.mpegurl"),
    );
    headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    Ok((StatusCode::OK, headers, bytes).into_response())
}

async fn delete_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    if state.coordinator.status(id).is_none() {
        return Err(ApiError::not_found("stream not found"));
    }
    state.coordinator.cancel_stream(id).await;
    Ok(StatusCode::ACCEPTED)
}

fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if name.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    }
}

async fn get_hls_file(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    if !file.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-') {
        return Err(ApiError::invalid_input("invalid file name"));
    }

    let path = state.coordinator.paths().segment_path(id, &file);
    let mut f = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let total_len = f
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let mut output_headers = HeaderMap::new();
    output_headers.insert(http::header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    output_headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&file)),
    );
    let cache = if file.ends_with(".m3u8") {
        "no-cache"
    } else {
        "public, max-age=31536000"
    };
    output_headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static(cache));

    let range_header = headers.get(http::header::RANGE);
    trace!(stream_id=%id, file=%file, range=?range_header, "hls file request");

    let parsed_range = range_header.and_then(|r| r.to_str().ok()).and_then(|s| parse_byte_range(s, total_len));

    let (status, body_len) = match parsed_range {
        Some((start, end)) => {
            f.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?;
            let len = end - start + 1;
            output_headers.insert(
                http::header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {start}-{end}/{total_len}")).unwrap(),
            );
            (StatusCode::PARTIAL_CONTENT, len)
        }
        None => (StatusCode::OK, total_len),
    };
    output_headers.insert(
        http::header::CONTENT_LENGTH,
        HeaderValue::from_str(&body_len.to_string()).unwrap(),
    );

    let stream = tokio_util::io::ReaderStream::new(f.take(body_len));
    let body = Body::from_stream(stream);
    Ok((status, output_headers, body).into_response())
}

/// Parses an HTTP `Range: bytes=...` value, supporting both the open-ended (`bytes=N-`) and
/// closed (`bytes=N-M`) forms. Returns `(start, end)` inclusive byte offsets, clamped to the
/// file's actual length, or `None` for anything unsatisfiable or not a single-range request.
fn parse_byte_range(value: &str, total_len: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    let start: u64 = start_str.parse().ok()?;
    if start >= total_len {
        return None;
    }
    let end = if end_str.is_empty() {
        total_len - 1
    } else {
        end_str.parse::<u64>().ok()?.min(total_len - 1)
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod range_tests {
    use super::parse_byte_range;

    #[test]
    fn parses_closed_range() {
        assert_eq!(parse_byte_range("bytes=0-1023", 10240), Some((0, 1023)));
    }

    #[test]
    fn parses_open_ended_range() {
        assert_eq!(parse_byte_range("bytes=1024-", 10240), Some((1024, 10239)));
    }

    #[test]
    fn clamps_closed_range_end_to_file_length() {
        assert_eq!(parse_byte_range("bytes=0-99999", 10240), Some((0, 10239)));
    }

    #[test]
    fn rejects_start_past_end_of_file() {
        assert_eq!(parse_byte_range("bytes=10240-", 10240), None);
    }

    #[test]
    fn rejects_multi_range_requests() {
        assert_eq!(parse_byte_range("bytes=0-99,200-299", 10240), None);
    }

    #[test]
    fn rejects_malformed_range() {
        assert_eq!(parse_byte_range("not-a-range", 10240), None);
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: u64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "OK",
        timestamp: unix_secs(SystemTime::now()),
    })
}
