mod common;

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Request, StatusCode},
};
use base64::Engine as _;
use futures::StreamExt;
use tower::ServiceExt;
use veilcast::broker::events::{ChunkIn, ChunkWire, ContentData, ContentIn, EncryptionMetadata, JoinIn};
use veilcast::config::Config;
use veilcast::download::{download_content, DownloadState};
use veilcast::server::build_router;

use common::fixture;

fn content_data(id: &str, size: u64, file_name: &str) -> ContentData {
    ContentData {
        content_id: id.to_string(),
        sender_id: String::new(),
        sender_name: String::new(),
        content_type: "file".to_string(),
        timestamp: chrono::Utc::now(),
        metadata: serde_json::json!({ "fileName": file_name }),
        is_chunked: false,
        total_chunks: Some(1),
        total_size: size,
        encryption_metadata: EncryptionMetadata { iv: vec![3; 12] },
        mime_type: Some("application/octet-stream".to_string()),
        is_large_file: None,
    }
}

fn chunked_content_data(id: &str, size: u64, total_chunks: u32, file_name: &str) -> ContentData {
    ContentData {
        is_chunked: true,
        total_chunks: Some(total_chunks),
        ..content_data(id, size, file_name)
    }
}

#[tokio::test]
async fn download_requires_credentials() {
    let f = fixture().await;
    let config = Config::default();
    let app = build_router(&config, f.sessions.clone(), f.store.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/download/does-not-matter")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn full_download_round_trip_with_valid_token() {
    let f = fixture().await;
    let conn = common::next_conn();

    let join_ack = f
        .broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-dl".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;
    let token = join_ack.token.unwrap();

    let payload = b"the quick brown fox";
    let data = base64::engine::general_purpose::STANDARD.encode(payload);

    let content_ack = f
        .broker
        .handle_content(
            conn,
            ContentIn {
                session_id: "sess-dl".to_string(),
                content: content_data("file-1", payload.len() as u64, "fox.txt"),
                data: Some(data),
            },
        )
        .await;
    assert!(content_ack.success, "{:?}", content_ack.error);

    let client_id = f
        .sessions
        .get_session("sess-dl")
        .unwrap()
        .members()
        .await
        .first()
        .unwrap()
        .0
        .clone();

    let config = Config::default();
    let app = build_router(&config, f.sessions.clone(), f.store.clone());

    let uri = format!("/download/file-1?clientId={client_id}&token={token}");
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], payload);
}

#[tokio::test]
async fn download_with_wrong_token_is_forbidden() {
    let f = fixture().await;
    let conn = common::next_conn();

    f.broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-dl2".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    let data = base64::engine::general_purpose::STANDARD.encode(b"abc");
    f.broker
        .handle_content(
            conn,
            ContentIn {
                session_id: "sess-dl2".to_string(),
                content: content_data("file-2", 3, "a.bin"),
                data: Some(data),
            },
        )
        .await;

    let client_id = f
        .sessions
        .get_session("sess-dl2")
        .unwrap()
        .members()
        .await
        .first()
        .unwrap()
        .0
        .clone();

    let config = Config::default();
    let app = build_router(&config, f.sessions.clone(), f.store.clone());

    let uri = format!("/download/file-2?clientId={client_id}&token=not-the-real-token");
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

/// S3: a large (over-threshold) file uploaded chunk by chunk never fans
/// `chunk` out to the room, and still downloads byte-for-byte complete.
#[tokio::test]
async fn large_file_chunks_are_never_broadcast_and_download_reassembles_all_bytes() {
    let f = common::fixture_with_limits(20, 20, 50).await; // 20-byte large-file threshold
    let conn = common::next_conn();

    let join_ack = f
        .broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-large".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;
    let token = join_ack.token.unwrap();

    let chunks: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 10]).collect(); // 4 * 10 = 40 bytes > 20
    let whole: Vec<u8> = chunks.iter().flatten().copied().collect();

    let content_ack = f
        .broker
        .handle_content(
            conn,
            ContentIn {
                session_id: "sess-large".to_string(),
                content: chunked_content_data("big-1", whole.len() as u64, chunks.len() as u32, "big.bin"),
                data: None,
            },
        )
        .await;
    assert!(content_ack.success, "{:?}", content_ack.error);

    for (index, bytes) in chunks.iter().enumerate() {
        let ack = f
            .broker
            .handle_chunk(
                conn,
                ChunkIn {
                    session_id: "sess-large".to_string(),
                    chunk: ChunkWire {
                        content_id: "big-1".to_string(),
                        chunk_index: index as u32,
                        total_chunks: chunks.len() as u32,
                        encrypted_data: bytes.clone(),
                        iv: vec![4; 12],
                    },
                },
            )
            .await;
        assert!(ack.success, "{:?}", ack.error);
    }

    let meta = f.store.get_content("big-1".to_string()).await.unwrap().unwrap();
    assert!(meta.is_large_file);
    assert!(meta.is_complete);

    assert!(
        !f.transport.broadcasts().iter().any(|(event, _)| event == "chunk"),
        "large-file chunks must not be fanned out"
    );

    let client_id = f
        .sessions
        .get_session("sess-large")
        .unwrap()
        .members()
        .await
        .first()
        .unwrap()
        .0
        .clone();

    let mut query = HashMap::new();
    query.insert("clientId".to_string(), client_id);
    query.insert("token".to_string(), token);

    let state = DownloadState {
        sessions: f.sessions.clone(),
        store: f.store.clone(),
    };
    let response = download_content(State(state), Path("big-1".to_string()), Query(query), HeaderMap::new()).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], &whole[..]);
}

/// The Range variant of the same download: a partial request for the
/// second 10-byte chunk returns exactly that slice with a 206 status.
#[tokio::test]
async fn range_request_against_download_route_returns_partial_content() {
    let f = common::fixture_with_limits(20, 20, 50).await;
    let conn = common::next_conn();

    let join_ack = f
        .broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-range".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;
    let token = join_ack.token.unwrap();

    let chunks: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 10]).collect();

    f.broker
        .handle_content(
            conn,
            ContentIn {
                session_id: "sess-range".to_string(),
                content: chunked_content_data("big-2", 40, 4, "big.bin"),
                data: None,
            },
        )
        .await;

    for (index, bytes) in chunks.iter().enumerate() {
        f.broker
            .handle_chunk(
                conn,
                ChunkIn {
                    session_id: "sess-range".to_string(),
                    chunk: ChunkWire {
                        content_id: "big-2".to_string(),
                        chunk_index: index as u32,
                        total_chunks: chunks.len() as u32,
                        encrypted_data: bytes.clone(),
                        iv: vec![4; 12],
                    },
                },
            )
            .await;
    }

    let client_id = f
        .sessions
        .get_session("sess-range")
        .unwrap()
        .members()
        .await
        .first()
        .unwrap()
        .0
        .clone();

    let mut query = HashMap::new();
    query.insert("clientId".to_string(), client_id);
    query.insert("token".to_string(), token);

    let mut headers = HeaderMap::new();
    headers.insert(header::RANGE, "bytes=10-19".parse().unwrap());

    let state = DownloadState {
        sessions: f.sessions.clone(),
        store: f.store.clone(),
    };
    let response = download_content(State(state), Path("big-2".to_string()), Query(query), headers).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let content_range = response
        .headers()
        .get(header::CONTENT_RANGE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(content_range, "bytes 10-19/40");

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], &chunks[1][..]);
}

/// S6: content removed while its download is still streaming surfaces as a
/// clean stream error rather than a panic, a hang, or corrupted bytes.
#[tokio::test]
async fn content_removed_mid_download_stream_surfaces_as_stream_error() {
    let f = fixture().await;
    let conn = common::next_conn();

    let join_ack = f
        .broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-gone".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;
    let token = join_ack.token.unwrap();

    let chunks: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; 5]).collect();

    f.broker
        .handle_content(
            conn,
            ContentIn {
                session_id: "sess-gone".to_string(),
                content: chunked_content_data("vanishing", 15, 3, "gone.bin"),
                data: None,
            },
        )
        .await;

    for (index, bytes) in chunks.iter().enumerate() {
        f.broker
            .handle_chunk(
                conn,
                ChunkIn {
                    session_id: "sess-gone".to_string(),
                    chunk: ChunkWire {
                        content_id: "vanishing".to_string(),
                        chunk_index: index as u32,
                        total_chunks: chunks.len() as u32,
                        encrypted_data: bytes.clone(),
                        iv: vec![5; 12],
                    },
                },
            )
            .await;
    }

    let client_id = f
        .sessions
        .get_session("sess-gone")
        .unwrap()
        .members()
        .await
        .first()
        .unwrap()
        .0
        .clone();

    let mut query = HashMap::new();
    query.insert("clientId".to_string(), client_id);
    query.insert("token".to_string(), token);

    let state = DownloadState {
        sessions: f.sessions.clone(),
        store: f.store.clone(),
    };
    let response = download_content(State(state), Path("vanishing".to_string()), Query(query), HeaderMap::new()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut stream = response.into_body().into_data_stream();

    // Read the first chunk before the content disappears out from under the
    // in-flight stream.
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(&first[..], &chunks[0][..]);

    f.store
        .remove_content("sess-gone".to_string(), "vanishing".to_string())
        .await
        .unwrap();

    // The remaining chunks are no longer on disk; the stream must report an
    // error instead of silently ending or yielding garbage bytes.
    let mut saw_error = false;
    while let Some(next) = stream.next().await {
        if next.is_err() {
            saw_error = true;
            break;
        }
    }
    assert!(saw_error, "expected the stream to surface an error after mid-stream removal");
}
