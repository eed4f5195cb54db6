mod common;

use common::{fixture, fixture_with_limits, next_conn};
use veilcast::broker::events::{
    ChunkIn, ChunkWire, ContentData, ContentIn, EncryptionMetadata, JoinIn, LeaveIn, ListContentIn,
    PinContentIn, PingIn, RemoveContentIn,
};

fn content_data(id: &str, size: u64) -> ContentData {
    ContentData {
        content_id: id.to_string(),
        sender_id: String::new(),
        sender_name: String::new(),
        content_type: "text".to_string(),
        timestamp: chrono::Utc::now(),
        metadata: serde_json::json!({}),
        is_chunked: false,
        total_chunks: Some(1),
        total_size: size,
        encryption_metadata: EncryptionMetadata { iv: vec![1; 12] },
        mime_type: None,
        is_large_file: None,
    }
}

#[tokio::test]
async fn join_establishes_session_and_issues_a_token() {
    let f = fixture().await;
    let conn = next_conn();

    let ack = f
        .broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"passphrase-hash".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    assert!(ack.success);
    assert!(ack.token.is_some());
    assert_eq!(ack.clients.unwrap().len(), 1);
}

#[tokio::test]
async fn second_join_with_wrong_fingerprint_is_rejected() {
    let f = fixture().await;

    f.broker
        .handle_join(
            next_conn(),
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp-a".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    let ack = f
        .broker
        .handle_join(
            next_conn(),
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Bob".to_string(),
                fingerprint: b"fp-b".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    assert!(!ack.success);
    assert_eq!(ack.error.as_deref(), Some("INVALID_PASSPHRASE"));
}

#[tokio::test]
async fn join_broadcasts_client_joined_to_existing_members() {
    let f = fixture().await;
    let alice = next_conn();
    let bob = next_conn();

    f.broker
        .handle_join(
            alice,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    f.broker
        .handle_join(
            bob,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Bob".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    let broadcasts = f.transport.broadcasts();
    assert!(broadcasts.iter().any(|(event, _)| event == "client-joined"));
}

#[tokio::test]
async fn inline_small_content_is_stored_and_fanned_out_complete() {
    let f = fixture().await;
    let conn = next_conn();
    let join = f
        .broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;
    assert!(join.success);

    use base64::{engine::general_purpose, Engine as _};
    let data = general_purpose::STANDARD.encode(b"hello world");

    let ack = f
        .broker
        .handle_content(
            conn,
            ContentIn {
                session_id: "sess-1".to_string(),
                content: content_data("c1", 11),
                data: Some(data),
            },
        )
        .await;

    assert!(ack.success, "{:?}", ack.error);

    let meta = f.store.get_content("c1".to_string()).await.unwrap().unwrap();
    assert!(meta.is_complete);
    assert!(!meta.is_large_file);

    let broadcasts = f.transport.broadcasts();
    assert!(broadcasts.iter().any(|(event, _)| event == "content"));
}

#[tokio::test]
async fn content_over_threshold_is_classified_large_and_not_broadcast_as_chunk() {
    let f = fixture_with_limits(10, 20, 50).await; // 10-byte threshold
    let conn = next_conn();
    f.broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    let ack = f
        .broker
        .handle_content(
            conn,
            ContentIn {
                session_id: "sess-1".to_string(),
                content: content_data("big1", 1024),
                data: None,
            },
        )
        .await;
    assert!(ack.success);

    let chunk_ack = f
        .broker
        .handle_chunk(
            conn,
            ChunkIn {
                session_id: "sess-1".to_string(),
                chunk: ChunkWire {
                    content_id: "big1".to_string(),
                    chunk_index: 0,
                    total_chunks: 1,
                    encrypted_data: vec![0u8; 1024],
                    iv: vec![2; 12],
                },
            },
        )
        .await;
    assert!(chunk_ack.success);

    let meta = f.store.get_content("big1".to_string()).await.unwrap().unwrap();
    assert!(meta.is_large_file);
    assert!(meta.is_complete);

    let broadcasts = f.transport.broadcasts();
    assert!(!broadcasts.iter().any(|(event, _)| event == "chunk"));
}

#[tokio::test]
async fn chunk_without_prior_content_event_is_rejected_without_auth() {
    let f = fixture().await;
    let conn = next_conn();

    let ack = f
        .broker
        .handle_chunk(
            conn,
            ChunkIn {
                session_id: "sess-1".to_string(),
                chunk: ChunkWire {
                    content_id: "c1".to_string(),
                    chunk_index: 0,
                    total_chunks: 1,
                    encrypted_data: vec![1, 2, 3],
                    iv: vec![0; 12],
                },
            },
        )
        .await;

    assert!(!ack.success);
    assert_eq!(ack.error.as_deref(), Some("AUTH_REQUIRED"));
}

#[tokio::test]
async fn out_of_range_chunk_index_is_bad_request() {
    let f = fixture().await;
    let conn = next_conn();
    f.broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    f.broker
        .handle_content(
            conn,
            ContentIn {
                session_id: "sess-1".to_string(),
                content: content_data("c1", 10),
                data: None,
            },
        )
        .await;

    let ack = f
        .broker
        .handle_chunk(
            conn,
            ChunkIn {
                session_id: "sess-1".to_string(),
                chunk: ChunkWire {
                    content_id: "c1".to_string(),
                    chunk_index: 5,
                    total_chunks: 1,
                    encrypted_data: vec![1],
                    iv: vec![0; 12],
                },
            },
        )
        .await;

    assert!(!ack.success);
    assert_eq!(ack.error.as_deref(), Some("BAD_REQUEST"));
}

#[tokio::test]
async fn pin_remove_and_list_content_round_trip() {
    let f = fixture().await;
    let conn = next_conn();
    f.broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    for i in 0..3 {
        let id = format!("item-{i}");
        f.broker
            .handle_content(
                conn,
                ContentIn {
                    session_id: "sess-1".to_string(),
                    content: content_data(&id, 4),
                    data: Some(base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        b"abcd",
                    )),
                },
            )
            .await;
    }

    let pin_ack = f
        .broker
        .handle_pin_content(
            conn,
            PinContentIn {
                session_id: "sess-1".to_string(),
                content_id: "item-0".to_string(),
            },
        )
        .await;
    assert!(pin_ack.success);

    let list_ack = f
        .broker
        .handle_list_content(
            conn,
            ListContentIn {
                session_id: "sess-1".to_string(),
                offset: None,
                limit: None,
            },
        )
        .await;
    assert!(list_ack.success);
    assert_eq!(list_ack.total_count, 3);
    assert!(list_ack
        .content
        .iter()
        .find(|c| c.content_id == "item-0")
        .unwrap()
        .is_pinned);

    let remove_ack = f
        .broker
        .handle_remove_content(
            conn,
            RemoveContentIn {
                session_id: "sess-1".to_string(),
                content_id: "item-1".to_string(),
            },
        )
        .await;
    assert!(remove_ack.success);

    let remaining = f.store.list_content("sess-1".to_string(), None).await.unwrap();
    assert_eq!(remaining.len(), 2);
}

#[tokio::test]
async fn removing_unknown_content_is_content_not_found() {
    let f = fixture().await;
    let conn = next_conn();
    f.broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    let ack = f
        .broker
        .handle_remove_content(
            conn,
            RemoveContentIn {
                session_id: "sess-1".to_string(),
                content_id: "ghost".to_string(),
            },
        )
        .await;

    assert!(!ack.success);
    assert_eq!(ack.error.as_deref(), Some("CONTENT_NOT_FOUND"));
}

#[tokio::test]
async fn leave_removes_membership_and_broadcasts_client_left() {
    let f = fixture().await;
    let conn = next_conn();
    f.broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    let ack = f
        .broker
        .handle_leave(
            conn,
            LeaveIn {
                session_id: "sess-1".to_string(),
                cleanup_content: false,
            },
        )
        .await;

    assert!(ack.success);
    let session = f.sessions.get_session("sess-1").unwrap();
    assert_eq!(session.client_count().await, 0);

    let broadcasts = f.transport.broadcasts();
    assert!(broadcasts.iter().any(|(event, _)| event == "client-left"));
}

#[tokio::test]
async fn disconnect_is_treated_like_an_implicit_leave() {
    let f = fixture().await;
    let conn = next_conn();
    f.broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    f.broker.handle_disconnect(conn).await;

    let session = f.sessions.get_session("sess-1").unwrap();
    assert_eq!(session.client_count().await, 0);
}

#[tokio::test]
async fn ping_refreshes_activity_and_requires_auth() {
    let f = fixture().await;
    let conn = next_conn();
    f.broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    let ack = f
        .broker
        .handle_ping(
            conn,
            PingIn {
                session_id: "sess-1".to_string(),
            },
        )
        .await;
    assert!(ack.valid);

    let unauth_ack = f
        .broker
        .handle_ping(
            next_conn(),
            PingIn {
                session_id: "sess-1".to_string(),
            },
        )
        .await;
    assert!(!unauth_ack.valid);
}

#[tokio::test]
async fn quota_enforcement_evicts_oldest_non_pinned_content() {
    let f = fixture_with_limits(10 * 1024 * 1024, 2, 50).await;
    let conn = next_conn();
    f.broker
        .handle_join(
            conn,
            JoinIn {
                session_id: "sess-1".to_string(),
                client_name: "Alice".to_string(),
                fingerprint: b"fp".to_vec(),
                cached_content_ids: Vec::new(),
            },
        )
        .await;

    for i in 0..4 {
        let id = format!("item-{i}");
        f.broker
            .handle_content(
                conn,
                ContentIn {
                    session_id: "sess-1".to_string(),
                    content: content_data(&id, 1),
                    data: Some(base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        b"x",
                    )),
                },
            )
            .await;
    }

    let removed = f.broker.enforce_quota("sess-1").await.unwrap();
    assert_eq!(removed.len(), 2);

    let remaining = f.store.list_content("sess-1".to_string(), None).await.unwrap();
    assert_eq!(remaining.len(), 2);
}
