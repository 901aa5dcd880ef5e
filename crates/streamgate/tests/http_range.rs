use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use http::{Request, StatusCode};
use tower::ServiceExt;

use streamgate_core::engine::fake::{FakeEngine, FakeTorrent};
use streamgate_core::engine::{SwarmStats, TorrentEngine};
use streamgate_core::{Acquirer, Config, HlsPackager, PathService, Registry, StreamCoordinator, StreamStatus};

/// Builds a coordinator with a single `Ready` stream whose HLS directory already contains a
/// real segment file, bypassing the download/packaging orchestration entirely so the HTTP
/// layer's Range handling can be exercised in isolation.
async fn ready_stream_with_segment(segment_bytes: &[u8]) -> (Arc<StreamCoordinator>, uuid::Uuid, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::new());
    let paths = Arc::new(PathService::new(tmp.path()));
    let torrent = Arc::new(FakeTorrent::new(vec![], SwarmStats::default()));
    let engine: Arc<dyn TorrentEngine> = Arc::new(FakeEngine { torrent });
    let acquirer = Arc::new(Acquirer::new(engine, registry.clone(), Duration::from_secs(60)));
    let packager = Arc::new(HlsPackager::new(PathBuf::from("ffmpeg"), registry.clone()));
    let config = Arc::new(Config::default());
    let coordinator = StreamCoordinator::new(paths.clone(), registry.clone(), acquirer, packager, config);

    let stream = registry.create("magnet:?xt=urn:btih:deadbeefdeadbeefdeadbeefdeadbeefdeadbeef");
    paths.ensure_stream_dirs(stream.id).await.unwrap();
    let segment_path = paths.segment_path(stream.id, "segment000.ts");
    tokio::fs::write(&segment_path, segment_bytes).await.unwrap();
    registry.update_status(stream.id, StreamStatus::Ready, None);

    (coordinator, stream.id, tmp)
}

fn segment_request(stream_id: uuid::Uuid, range: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("GET")
        .uri(format!("/hls/{stream_id}/segment000.ts"));
    if let Some(range) = range {
        builder = builder.header(http::header::RANGE, range);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn closed_range_returns_partial_content_with_exact_bounds() {
    let body_bytes = vec![7u8; 10 * 1024];
    let (coordinator, stream_id, _tmp) = ready_stream_with_segment(&body_bytes).await;
    let app = streamgate::http_api::router(coordinator);

    let response = app
        .oneshot(segment_request(stream_id, Some("bytes=0-1023")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get(http::header::CONTENT_RANGE).unwrap(),
        "bytes 0-1023/10240"
    );
    assert_eq!(response.headers().get(http::header::CONTENT_LENGTH).unwrap(), "1024");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 1024);
    assert!(bytes.iter().all(|&b| b == 7));
}

#[tokio::test]
async fn open_ended_range_returns_remainder_of_file() {
    let body_bytes = vec![9u8; 10 * 1024];
    let (coordinator, stream_id, _tmp) = ready_stream_with_segment(&body_bytes).await;
    let app = streamgate::http_api::router(coordinator);

    let response = app
        .oneshot(segment_request(stream_id, Some("bytes=1024-")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get(http::header::CONTENT_RANGE).unwrap(),
        "bytes 1024-10239/10240"
    );

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 10 * 1024 - 1024);
}

#[tokio::test]
async fn no_range_header_returns_full_body() {
    let body_bytes = vec![3u8; 2048];
    let (coordinator, stream_id, _tmp) = ready_stream_with_segment(&body_bytes).await;
    let app = streamgate::http_api::router(coordinator);

    let response = app.oneshot(segment_request(stream_id, None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(http::header::CONTENT_RANGE).is_none());
    assert_eq!(response.headers().get(http::header::CONTENT_LENGTH).unwrap(), "2048");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 2048);
}

#[tokio::test]
async fn disjoint_parallel_ranges_each_see_only_their_own_bytes() {
    let mut body_bytes = vec![0u8; 10 * 1024];
    for (i, b) in body_bytes.iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }
    let (coordinator, stream_id, _tmp) = ready_stream_with_segment(&body_bytes).await;
    let app = streamgate::http_api::router(coordinator);

    let first = app
        .clone()
        .oneshot(segment_request(stream_id, Some("bytes=0-511")))
        .await
        .unwrap();
    let second = app
        .clone()
        .oneshot(segment_request(stream_id, Some("bytes=8192-9215")))
        .await
        .unwrap();

    assert_eq!(first.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(second.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        first.headers().get(http::header::CONTENT_RANGE).unwrap(),
        "bytes 0-511/10240"
    );
    assert_eq!(
        second.headers().get(http::header::CONTENT_RANGE).unwrap(),
        "bytes 8192-9215/10240"
    );

    let first_bytes = to_bytes(first.into_body(), usize::MAX).await.unwrap();
    let second_bytes = to_bytes(second.into_body(), usize::MAX).await.unwrap();
    assert_eq!(first_bytes.as_ref(), &body_bytes[0..512]);
    assert_eq!(second_bytes.as_ref(), &body_bytes[8192..9216]);
}
