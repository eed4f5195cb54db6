//! Back-fill: replay of existing session content to a client at join time or
//! on explicit pagination (§4.3 "Join back-fill" and "Pagination beyond
//! first page").

use std::sync::Arc;

use super::events::{ChunkOut, ChunkWire, ContentData, ContentOut, EncryptionMetadata};
use super::transport::{ConnId, Transport};
use crate::errors::AppError;
use crate::store::{ChunkStore, ContentMeta};

pub struct Page {
    pub items: Vec<ContentMeta>,
    pub total_count: usize,
    pub has_more: bool,
}

/// Slice the session's completed content by `offset`/`limit`. Both are
/// sanitized per spec: `offset := max(0, offset)`, `limit := max(1, limit)`.
pub async fn paginate(
    store: &ChunkStore,
    session_id: &str,
    offset: i64,
    limit: i64,
) -> Result<Page, AppError> {
    let offset = offset.max(0) as usize;
    let limit = limit.max(1) as usize;

    let all = store.list_content(session_id.to_string(), None).await?;
    let total_count = all.len();
    let items: Vec<ContentMeta> = all.into_iter().skip(offset).take(limit).collect();
    let has_more = offset + items.len() < total_count;

    Ok(Page {
        items,
        total_count,
        has_more,
    })
}

/// Replay `items` to `conn_id`: one `content` event per item (metadata only
/// for large files), then — for non-large items — one `chunk` event per
/// chunk index in ascending order.
///
/// `senderId`/`senderName` are not part of persisted content metadata (§3
/// records no sender), so back-filled items substitute the empty string per
/// the spec's note that this field is "non-deterministic ... substituted by
/// the server".
pub async fn emit_items(
    transport: &Arc<dyn Transport>,
    conn_id: ConnId,
    session_id: &str,
    store: &ChunkStore,
    items: &[ContentMeta],
) -> Result<(), AppError> {
    for meta in items {
        let content_out = ContentOut {
            session_id: session_id.to_string(),
            content: ContentData {
                content_id: meta.content_id.clone(),
                sender_id: String::new(),
                sender_name: String::new(),
                content_type: meta.content_type.as_str().to_string(),
                timestamp: meta.created_at,
                metadata: meta.additional_metadata.clone(),
                is_chunked: meta.total_chunks > 1,
                total_chunks: Some(meta.total_chunks),
                total_size: meta.total_size,
                encryption_metadata: EncryptionMetadata {
                    iv: meta.encryption_iv.to_vec(),
                },
                mime_type: Some(meta.mime_type.clone()),
                is_large_file: Some(meta.is_large_file),
            },
            data: None,
        };

        transport
            .emit_to_conn(
                conn_id,
                "content",
                serde_json::to_value(&content_out).map_err(AppError::internal)?,
            )
            .await;

        if meta.is_large_file {
            continue;
        }

        for chunk_index in 0..meta.total_chunks {
            let Some(chunk_meta) = store
                .get_chunk_metadata(meta.content_id.clone(), chunk_index)
                .await?
            else {
                continue;
            };
            let Some(bytes) = store
                .get_chunk(session_id, &meta.content_id, chunk_index)
                .await?
            else {
                continue;
            };

            let chunk_out = ChunkOut {
                session_id: session_id.to_string(),
                chunk: ChunkWire {
                    content_id: meta.content_id.clone(),
                    chunk_index,
                    total_chunks: meta.total_chunks,
                    encrypted_data: bytes,
                    iv: chunk_meta.iv.to_vec(),
                },
            };

            transport
                .emit_to_conn(
                    conn_id,
                    "chunk",
                    serde_json::to_value(&chunk_out).map_err(AppError::internal)?,
                )
                .await;
        }
    }

    Ok(())
}
