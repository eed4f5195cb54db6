//! Chunk Store: content-addressed, encrypted-at-rest persistence of content
//! and its chunks, with completion tracking, pinning, large-file
//! classification, and quota-driven eviction.

mod db;
mod files;
pub mod model;
mod schema;

pub use model::{ChunkMeta, ContentMeta, ContentType, Iv, NewChunk, NewContent};

use futures::stream::{self, Stream};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::errors::AppError;

#[derive(Clone)]
pub struct ChunkStore {
    conn: Arc<Mutex<Connection>>,
    storage_root: PathBuf,
    large_file_threshold: u64,
    max_pinned_items_per_session: usize,
}

/// Result of removing content: whether a record existed.
pub struct RemoveOutcome {
    pub removed: bool,
}

pub struct CleanupOutcome {
    pub removed: Vec<String>,
}

impl ChunkStore {
    pub fn open(
        storage_root: PathBuf,
        large_file_threshold: u64,
        max_pinned_items_per_session: usize,
    ) -> Result<Self, AppError> {
        std::fs::create_dir_all(&storage_root)
            .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;

        let db_path = storage_root.join("metadata.db");
        let conn = Connection::open(&db_path)
            .map_err(|e| AppError::StorageUnavailable(e.to_string()))?;
        schema::init(&conn).map_err(|e| AppError::StorageUnavailable(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            storage_root,
            large_file_threshold,
            max_pinned_items_per_session,
        })
    }

    pub fn large_file_threshold(&self) -> u64 {
        self.large_file_threshold
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("chunk store mutex poisoned");
            f(&guard)
        })
        .await
        .map_err(|e| AppError::internal(e))?
        .map_err(AppError::from)
    }

    async fn with_conn_mut<F, T>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().expect("chunk store mutex poisoned");
            f(&mut guard)
        })
        .await
        .map_err(|e| AppError::internal(e))?
        .map_err(AppError::from)
    }

    /// Create or replace the metadata record without writing chunk bytes.
    pub async fn save_content(&self, content: NewContent) -> Result<ContentMeta, AppError> {
        let threshold = self.large_file_threshold;
        self.with_conn(move |conn| db::save_content(conn, &content, threshold))
            .await
    }

    pub async fn update_content_metadata(
        &self,
        content_id: String,
        additional_metadata: serde_json::Value,
    ) -> Result<(), AppError> {
        self.with_conn(move |conn| {
            db::update_additional_metadata(conn, &content_id, &additional_metadata)
        })
        .await?;
        Ok(())
    }

    pub async fn mark_content_complete(&self, content_id: String) -> Result<(), AppError> {
        self.with_conn(move |conn| db::mark_content_complete(conn, &content_id))
            .await?;
        Ok(())
    }

    pub async fn get_content(&self, content_id: String) -> Result<Option<ContentMeta>, AppError> {
        self.with_conn(move |conn| db::get_content(conn, &content_id))
            .await
    }

    pub async fn get_received_chunk_count(&self, content_id: String) -> Result<u32, AppError> {
        self.with_conn(move |conn| db::get_received_chunk_count(conn, &content_id))
            .await
    }

    pub async fn get_chunk_metadata(
        &self,
        content_id: String,
        chunk_index: u32,
    ) -> Result<Option<ChunkMeta>, AppError> {
        self.with_conn(move |conn| db::get_chunk_metadata(conn, &content_id, chunk_index))
            .await
    }

    pub async fn get_chunk(
        &self,
        session_id: &str,
        content_id: &str,
        chunk_index: u32,
    ) -> Result<Option<Vec<u8>>, AppError> {
        let root = self.storage_root.clone();
        let session_id = session_id.to_string();
        let content_id = content_id.to_string();
        tokio::task::spawn_blocking(move || {
            files::read_chunk(&root, &session_id, &content_id, chunk_index)
        })
        .await
        .map_err(|e| AppError::internal(e))?
        .map_err(AppError::from)
    }

    /// Upsert chunk metadata, write bytes, and — transactionally with the
    /// completion check — mark content complete once the received count
    /// equals `total_chunks`. Returns `(received_count, became_complete)`.
    pub async fn save_chunk(&self, chunk: NewChunk) -> Result<(u32, bool), AppError> {
        let root = self.storage_root.clone();
        let session_id = chunk.session_id;
        let content_id = chunk.content_id;
        let chunk_index = chunk.chunk_index;
        let iv = chunk.iv;
        let bytes = chunk.bytes;
        let size = bytes.len() as u64;

        let write_session_id = session_id.clone();
        let write_content_id = content_id.clone();
        tokio::task::spawn_blocking(move || {
            files::write_chunk(&root, &write_session_id, &write_content_id, chunk_index, &bytes)
        })
        .await
        .map_err(|e| AppError::internal(e))?
        .map_err(AppError::from)?;

        self.with_conn_mut(move |conn| {
            db::save_chunk_metadata_and_maybe_complete(conn, &content_id, chunk_index, size, &iv)
        })
        .await
    }

    pub async fn list_content(
        &self,
        session_id: String,
        limit: Option<usize>,
    ) -> Result<Vec<ContentMeta>, AppError> {
        self.with_conn(move |conn| db::list_content(conn, &session_id, limit))
            .await
    }

    pub async fn is_large_file(&self, content_id: String) -> Result<Option<bool>, AppError> {
        self.with_conn(move |conn| db::is_large_file(conn, &content_id))
            .await
    }

    pub async fn pin_content(&self, content_id: String, session_id: String) -> Result<(), AppError> {
        let already_pinned = self
            .get_content(content_id.clone())
            .await?
            .map(|meta| meta.is_pinned)
            .unwrap_or(false);
        if already_pinned {
            return Ok(());
        }

        let pinned_count = self
            .with_conn({
                let session_id = session_id.clone();
                move |conn| db::count_pinned(conn, &session_id)
            })
            .await?;

        if pinned_count >= self.max_pinned_items_per_session {
            return Err(AppError::BadRequest(format!(
                "session already has the maximum of {} pinned items",
                self.max_pinned_items_per_session
            )));
        }

        self.with_conn(move |conn| db::set_pinned(conn, &content_id, true))
            .await?;
        Ok(())
    }

    pub async fn unpin_content(&self, content_id: String) -> Result<(), AppError> {
        self.with_conn(move |conn| db::set_pinned(conn, &content_id, false))
            .await?;
        Ok(())
    }

    /// Finite, non-restartable lazy sequence of `(bytes, meta)` in ascending
    /// `chunkIndex` order, starting at `from_index`. Re-reads each chunk
    /// independently — it holds no content-wide lock between yields, so a
    /// concurrent `remove_content` surfaces as `Gone` on the next chunk
    /// rather than corrupting an in-flight read.
    pub fn stream_content_for_download(
        &self,
        session_id: String,
        content_id: String,
        total_chunks: u32,
        from_index: u32,
    ) -> impl Stream<Item = Result<(Vec<u8>, ChunkMeta), AppError>> {
        let store = self.clone();
        stream::unfold(
            (store, session_id, content_id, from_index, total_chunks),
            |(store, session_id, content_id, index, total)| async move {
                if index >= total {
                    return None;
                }

                let meta = match store
                    .get_chunk_metadata(content_id.clone(), index)
                    .await
                {
                    Ok(Some(meta)) => meta,
                    Ok(None) => return Some((Err(AppError::Gone), (store, session_id, content_id, index + 1, total))),
                    Err(e) => return Some((Err(e), (store, session_id, content_id, index + 1, total))),
                };

                let bytes = match store.get_chunk(&session_id, &content_id, index).await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => return Some((Err(AppError::Gone), (store, session_id, content_id, index + 1, total))),
                    Err(e) => return Some((Err(e), (store, session_id, content_id, index + 1, total))),
                };

                Some((Ok((bytes, meta)), (store, session_id, content_id, index + 1, total)))
            },
        )
    }

    /// Atomically delete metadata, chunk-metadata rows, and payload files.
    pub async fn remove_content(
        &self,
        session_id: String,
        content_id: String,
    ) -> Result<RemoveOutcome, AppError> {
        let removed = self
            .with_conn_mut({
                let content_id = content_id.clone();
                move |conn| db::remove_content(conn, &content_id)
            })
            .await?;

        if removed {
            let root = self.storage_root.clone();
            tokio::task::spawn_blocking(move || {
                files::remove_content_dir(&root, &session_id, &content_id)
            })
            .await
            .map_err(|e| AppError::internal(e))?
            .map_err(AppError::from)?;
        }

        Ok(RemoveOutcome { removed })
    }

    /// Evict non-pinned completed content past `max_items`, newest first.
    /// Pinned content is never counted and never evicted.
    pub async fn cleanup_old_content(
        &self,
        session_id: String,
        max_items: usize,
    ) -> Result<CleanupOutcome, AppError> {
        let candidates = self
            .with_conn({
                let session_id = session_id.clone();
                move |conn| db::list_non_pinned_completed(conn, &session_id)
            })
            .await?;

        let to_remove: Vec<String> = candidates.into_iter().skip(max_items).collect();

        for content_id in &to_remove {
            self.remove_content(session_id.clone(), content_id.clone())
                .await?;
        }

        Ok(CleanupOutcome { removed: to_remove })
    }

    /// Delete all content for a session, pinned or not.
    pub async fn cleanup_all_session_content(&self, session_id: String) -> Result<(), AppError> {
        let ids = self
            .with_conn({
                let session_id = session_id.clone();
                move |conn| db::list_all_content_ids(conn, &session_id)
            })
            .await?;

        for content_id in ids {
            self.remove_content(session_id.clone(), content_id).await?;
        }

        let root = self.storage_root.clone();
        let session_id_for_dir = session_id.clone();
        tokio::task::spawn_blocking(move || files::remove_session_dir(&root, &session_id_for_dir))
            .await
            .map_err(|e| AppError::internal(e))?
            .map_err(AppError::from)
    }

    /// One-shot migration recomputing `is_large_file` across all records.
    /// Idempotent by construction, so re-running it on every startup is safe.
    pub async fn fix_large_file_metadata(&self) -> Result<usize, AppError> {
        let threshold = self.large_file_threshold;
        self.with_conn(move |conn| schema::fix_large_file_metadata(conn, threshold))
            .await
    }
}
