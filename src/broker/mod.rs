//! Realtime Broker: per-connection event handlers, content & chunk ingress,
//! selective fan-out, and pagination-aware back-fill on join.

pub mod auth;
mod backfill;
pub mod events;
pub mod transport;

use std::sync::Arc;

use auth::{ConnState, ConnStateMap};
use events::*;
use transport::{ConnId, Transport};

use crate::errors::AppError;
use crate::session::SessionManager;
use crate::store::{ChunkStore, NewChunk, NewContent};

const DEFAULT_PAGE_SIZE: usize = 5;

#[derive(Clone)]
pub struct Broker {
    sessions: SessionManager,
    store: ChunkStore,
    transport: Arc<dyn Transport>,
    conn_states: Arc<ConnStateMap>,
    max_items_per_session: usize,
}

impl Broker {
    pub fn new(
        sessions: SessionManager,
        store: ChunkStore,
        transport: Arc<dyn Transport>,
        max_items_per_session: usize,
    ) -> Self {
        Self {
            sessions,
            store,
            transport,
            conn_states: Arc::new(ConnStateMap::new()),
            max_items_per_session,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    async fn require_auth(&self, conn_id: ConnId, claimed_session_id: &str) -> Result<ConnState, AppError> {
        auth::require_active_session(&self.sessions, &self.conn_states, conn_id, claimed_session_id).await
    }

    /// `join`: establishes auth for every subsequent event from this connection.
    pub async fn handle_join(&self, conn_id: ConnId, payload: JoinIn) -> JoinAck {
        let client_id = uuid::Uuid::new_v4().to_string();

        let result = self
            .sessions
            .join_session(
                &payload.session_id,
                payload.fingerprint,
                client_id.clone(),
                payload.client_name,
                conn_id,
            )
            .await;

        let (session, token) = match result {
            Ok(pair) => pair,
            Err(err) => {
                return JoinAck {
                    success: false,
                    error: Some(err.code().to_string()),
                    ..Default::default()
                }
            }
        };

        self.conn_states.insert(
            conn_id,
            ConnState {
                session_id: payload.session_id.clone(),
                client_id: client_id.clone(),
                token: token.clone(),
            },
        );
        self.transport.join_room(conn_id, &payload.session_id).await;

        let members = session.members().await;
        let clients = members
            .iter()
            .map(|(id, name, joined_at)| ClientSummary {
                id: id.clone(),
                name: name.clone(),
                joined_at: *joined_at,
            })
            .collect();

        if let Err(err) = self.run_join_backfill(conn_id, &payload.session_id, &payload.cached_content_ids).await {
            tracing::warn!(session_id = %payload.session_id, error = %err, "join back-fill failed");
        }

        self.transport
            .broadcast_to_room(
                &payload.session_id,
                "client-joined",
                serde_json::to_value(ClientJoined {
                    client_id,
                    client_name: members
                        .last()
                        .map(|(_, name, _)| name.clone())
                        .unwrap_or_default(),
                    joined_at: chrono::Utc::now(),
                })
                .unwrap_or_default(),
                Some(conn_id),
            )
            .await;

        JoinAck {
            success: true,
            token: Some(token),
            clients: Some(clients),
            error: None,
        }
    }

    async fn run_join_backfill(
        &self,
        conn_id: ConnId,
        session_id: &str,
        cached_content_ids: &[String],
    ) -> Result<(), AppError> {
        let page = backfill::paginate(&self.store, session_id, 0, DEFAULT_PAGE_SIZE as i64).await?;

        let to_emit: Vec<_> = page
            .items
            .into_iter()
            .filter(|item| !cached_content_ids.contains(&item.content_id))
            .collect();

        backfill::emit_items(&self.transport, conn_id, session_id, &self.store, &to_emit).await?;

        self.transport
            .emit_to_conn(
                conn_id,
                "content-pagination-info",
                serde_json::to_value(ContentPaginationInfo {
                    total_count: page.total_count,
                    current_page: 1,
                    page_size: DEFAULT_PAGE_SIZE,
                    has_more: page.has_more,
                })
                .map_err(AppError::internal)?,
            )
            .await;

        Ok(())
    }

    pub async fn handle_leave(&self, conn_id: ConnId, payload: LeaveIn) -> Ack {
        let state = match self.require_auth(conn_id, &payload.session_id).await {
            Ok(state) => state,
            Err(err) => return Ack::err(err.code()),
        };

        self.sessions
            .remove_client_from_session(&state.session_id, &state.client_id)
            .await;
        self.transport.leave_room(conn_id, &state.session_id).await;
        self.conn_states.remove(&conn_id);

        if payload.cleanup_content {
            if let Err(err) = self.store.cleanup_all_session_content(state.session_id.clone()).await {
                tracing::warn!(session_id = %state.session_id, error = %err, "session content cleanup failed");
            }
        }

        self.transport
            .broadcast_to_room(
                &state.session_id,
                "client-left",
                serde_json::to_value(ClientLeft {
                    client_id: state.client_id,
                })
                .unwrap_or_default(),
                None,
            )
            .await;

        Ack::ok()
    }

    pub async fn handle_disconnect(&self, conn_id: ConnId) {
        let Some((_, state)) = self.conn_states.remove(&conn_id) else {
            return;
        };

        self.sessions
            .remove_client_from_session(&state.session_id, &state.client_id)
            .await;

        self.transport
            .broadcast_to_room(
                &state.session_id,
                "client-left",
                serde_json::to_value(ClientLeft {
                    client_id: state.client_id,
                })
                .unwrap_or_default(),
                None,
            )
            .await;
    }

    pub async fn handle_content(&self, conn_id: ConnId, payload: ContentIn) -> Ack {
        let state = match self.require_auth(conn_id, &payload.session_id).await {
            Ok(state) => state,
            Err(err) => return Ack::err(err.code()),
        };

        if let Err(err) = self.ingest_content(conn_id, &state, payload).await {
            return Ack::err(err.code());
        }

        Ack::ok()
    }

    async fn ingest_content(&self, conn_id: ConnId, state: &ConnState, payload: ContentIn) -> Result<(), AppError> {
        let total_chunks = payload.content.total_chunks.unwrap_or(1).max(1);
        let threshold = self.store.large_file_threshold();
        let is_large_file = payload.content.total_size > threshold;

        let new_content = NewContent {
            content_id: payload.content.content_id.clone(),
            session_id: payload.session_id.clone(),
            content_type: crate::store::ContentType::parse(&payload.content.content_type),
            mime_type: payload
                .content
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            total_chunks,
            total_size: payload.content.total_size,
            encryption_iv: iv_from_vec(&payload.content.encryption_metadata.iv),
            additional_metadata: payload.content.metadata.clone(),
            declared_complete: is_large_file && payload.data.is_some(),
        };

        // Inline (non-chunked) content carries its bytes in `data`.
        if let Some(data_b64) = &payload.data {
            if is_large_file {
                // Unusual but handled: large inline content is persisted as
                // metadata only, bytes are dropped, but it's still marked
                // complete at creation since no `chunk` events will follow.
                self.store.save_content(new_content).await?;
            } else {
                let bytes = {
                    use base64::{engine::general_purpose, Engine as _};
                    general_purpose::STANDARD
                        .decode(data_b64)
                        .map_err(|e| AppError::BadRequest(format!("invalid base64 data: {e}")))?
                };
                self.store.save_content(new_content).await?;
                self.store
                    .save_chunk(NewChunk {
                        content_id: payload.content.content_id.clone(),
                        session_id: payload.session_id.clone(),
                        chunk_index: 0,
                        total_chunks,
                        iv: iv_from_vec(&payload.content.encryption_metadata.iv),
                        bytes,
                    })
                    .await?;
                self.store
                    .mark_content_complete(payload.content.content_id.clone())
                    .await?;
            }
        } else {
            // Chunked content: metadata arrives now, bytes arrive via `chunk` events.
            self.store.save_content(new_content).await?;
        }

        let meta = self
            .store
            .get_content(payload.content.content_id.clone())
            .await?
            .ok_or_else(|| AppError::internal("content metadata vanished after save"))?;

        let fanout = ContentOut {
            session_id: payload.session_id.clone(),
            content: ContentData {
                sender_id: state.client_id.clone(),
                is_large_file: Some(meta.is_large_file),
                mime_type: Some(meta.mime_type.clone()),
                total_chunks: Some(meta.total_chunks),
                ..payload.content
            },
            data: if meta.is_large_file { None } else { payload.data },
        };

        self.transport
            .broadcast_to_room(
                &payload.session_id,
                "content",
                serde_json::to_value(&fanout).map_err(AppError::internal)?,
                Some(conn_id),
            )
            .await;

        Ok(())
    }

    pub async fn handle_chunk(&self, conn_id: ConnId, payload: ChunkIn) -> Ack {
        if let Err(err) = self.require_auth(conn_id, &payload.session_id).await {
            return Ack::err(err.code());
        }

        if let Err(err) = self.ingest_chunk(conn_id, &payload).await {
            return Ack::err(err.code());
        }

        Ack::ok()
    }

    async fn ingest_chunk(&self, conn_id: ConnId, payload: &ChunkIn) -> Result<(), AppError> {
        let chunk = &payload.chunk;
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(AppError::BadRequest(format!(
                "chunkIndex {} >= totalChunks {}",
                chunk.chunk_index, chunk.total_chunks
            )));
        }

        let (_, _became_complete) = self
            .store
            .save_chunk(NewChunk {
                content_id: chunk.content_id.clone(),
                session_id: payload.session_id.clone(),
                chunk_index: chunk.chunk_index,
                total_chunks: chunk.total_chunks,
                iv: iv_from_vec(&chunk.iv),
                bytes: chunk.encrypted_data.clone(),
            })
            .await?;

        let is_large = self
            .store
            .is_large_file(chunk.content_id.clone())
            .await?
            .unwrap_or(false);

        if !is_large {
            self.transport
                .broadcast_to_room(
                    &payload.session_id,
                    "chunk",
                    serde_json::to_value(ChunkOut {
                        session_id: payload.session_id.clone(),
                        chunk: chunk.clone(),
                    })
                    .map_err(AppError::internal)?,
                    Some(conn_id),
                )
                .await;
        }

        Ok(())
    }

    pub async fn handle_remove_content(&self, conn_id: ConnId, payload: RemoveContentIn) -> Ack {
        let state = match self.require_auth(conn_id, &payload.session_id).await {
            Ok(state) => state,
            Err(err) => return Ack::err(err.code()),
        };

        let result = self
            .store
            .remove_content(payload.session_id.clone(), payload.content_id.clone())
            .await;

        match result {
            Ok(outcome) if outcome.removed => {
                let session_id = payload.session_id.clone();
                self.transport
                    .broadcast_to_room(
                        &session_id,
                        "content-removed",
                        serde_json::to_value(ContentRemoved {
                            session_id: payload.session_id,
                            content_id: payload.content_id,
                            removed_by: state.client_id,
                        })
                        .unwrap_or_default(),
                        Some(conn_id),
                    )
                    .await;
                Ack::ok()
            }
            Ok(_) => Ack::err(AppError::ContentNotFound.code()),
            Err(err) => Ack::err(err.code()),
        }
    }

    pub async fn handle_pin_content(&self, conn_id: ConnId, payload: PinContentIn) -> Ack {
        if self.require_auth(conn_id, &payload.session_id).await.is_err() {
            return Ack::err(AppError::AuthRequired.code());
        };

        if let Err(err) = self
            .store
            .pin_content(payload.content_id.clone(), payload.session_id.clone())
            .await
        {
            return Ack::err(err.code());
        }

        self.transport
            .broadcast_to_room(
                &payload.session_id,
                "content-pinned",
                serde_json::to_value(ContentPinned {
                    content_id: payload.content_id,
                })
                .unwrap_or_default(),
                None,
            )
            .await;

        Ack::ok()
    }

    pub async fn handle_unpin_content(&self, conn_id: ConnId, payload: PinContentIn) -> Ack {
        if self.require_auth(conn_id, &payload.session_id).await.is_err() {
            return Ack::err(AppError::AuthRequired.code());
        };

        if let Err(err) = self.store.unpin_content(payload.content_id.clone()).await {
            return Ack::err(err.code());
        }

        self.transport
            .broadcast_to_room(
                &payload.session_id,
                "content-unpinned",
                serde_json::to_value(ContentUnpinned {
                    content_id: payload.content_id,
                })
                .unwrap_or_default(),
                None,
            )
            .await;

        Ack::ok()
    }

    pub async fn handle_list_content(&self, conn_id: ConnId, payload: ListContentIn) -> ListContentAck {
        if self.require_auth(conn_id, &payload.session_id).await.is_err() {
            return ListContentAck {
                success: false,
                content: Vec::new(),
                total_count: 0,
                has_more: false,
                error: Some(AppError::AuthRequired.code().to_string()),
            };
        };

        let page = match backfill::paginate(
            &self.store,
            &payload.session_id,
            payload.offset.unwrap_or(0),
            payload.limit.unwrap_or(DEFAULT_PAGE_SIZE as i64),
        )
        .await
        {
            Ok(page) => page,
            Err(err) => {
                return ListContentAck {
                    success: false,
                    content: Vec::new(),
                    total_count: 0,
                    has_more: false,
                    error: Some(err.code().to_string()),
                }
            }
        };

        if let Err(err) = backfill::emit_items(&self.transport, conn_id, &payload.session_id, &self.store, &page.items).await {
            tracing::warn!(session_id = %payload.session_id, error = %err, "list-content back-fill failed");
        }

        let summaries = page
            .items
            .iter()
            .map(|meta| ContentSummary {
                content_id: meta.content_id.clone(),
                content_type: meta.content_type.as_str().to_string(),
                mime_type: meta.mime_type.clone(),
                total_chunks: meta.total_chunks,
                total_size: meta.total_size,
                is_pinned: meta.is_pinned,
                is_large_file: meta.is_large_file,
            })
            .collect();

        ListContentAck {
            success: true,
            content: summaries,
            total_count: page.total_count,
            has_more: page.has_more,
            error: None,
        }
    }

    pub async fn handle_ping(&self, conn_id: ConnId, payload: PingIn) -> PingAck {
        match self.require_auth(conn_id, &payload.session_id).await {
            Ok(state) => {
                self.sessions.refresh_activity(&state.session_id).await;
                PingAck {
                    valid: true,
                    error: None,
                }
            }
            Err(err) => PingAck {
                valid: false,
                error: Some(err.code().to_string()),
            },
        }
    }

    /// Evict non-pinned completed content past `max_items_per_session` for
    /// `session_id`. Exposed for the periodic cleanup sweep in `main`.
    pub async fn enforce_quota(&self, session_id: &str) -> Result<Vec<String>, AppError> {
        let outcome = self
            .store
            .cleanup_old_content(session_id.to_string(), self.max_items_per_session)
            .await?;
        Ok(outcome.removed)
    }
}

fn iv_from_vec(bytes: &[u8]) -> [u8; 12] {
    let mut iv = [0u8; 12];
    let n = bytes.len().min(12);
    iv[..n].copy_from_slice(&bytes[..n]);
    iv
}
