//! Blocking rusqlite helpers. Every function here runs inside a
//! `tokio::task::spawn_blocking` closure in `store::ChunkStore` — none of it
//! is async itself.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::model::{ChunkMeta, ContentMeta, ContentType, NewContent};

fn row_to_content(row: &Row) -> rusqlite::Result<ContentMeta> {
    let iv_blob: Vec<u8> = row.get("encryption_iv")?;
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&iv_blob[..12.min(iv_blob.len())]);

    let created_at: String = row.get("created_at")?;
    let additional_metadata: String = row.get("additional_metadata")?;

    Ok(ContentMeta {
        content_id: row.get("content_id")?,
        session_id: row.get("session_id")?,
        content_type: ContentType::parse(&row.get::<_, String>("content_type")?),
        mime_type: row.get("mime_type")?,
        total_chunks: row.get::<_, i64>("total_chunks")? as u32,
        total_size: row.get::<_, i64>("total_size")? as u64,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        is_complete: row.get::<_, i64>("is_complete")? != 0,
        is_pinned: row.get::<_, i64>("is_pinned")? != 0,
        is_large_file: row.get::<_, i64>("is_large_file")? != 0,
        encryption_iv: iv,
        additional_metadata: serde_json::from_str(&additional_metadata)
            .unwrap_or(serde_json::Value::Null),
    })
}

/// Create-or-replace the metadata row. `created_at` and `is_pinned` are
/// preserved across a replace; every other field (including the derived
/// `is_large_file`) is refreshed from `content`.
pub fn save_content(
    conn: &Connection,
    content: &NewContent,
    large_file_threshold: u64,
) -> rusqlite::Result<ContentMeta> {
    let is_large_file = content.total_size > large_file_threshold;
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO content_metadata
            (content_id, session_id, content_type, mime_type, total_chunks, total_size,
             created_at, is_complete, is_pinned, is_large_file, encryption_iv, additional_metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11)
         ON CONFLICT(content_id) DO UPDATE SET
            session_id = excluded.session_id,
            content_type = excluded.content_type,
            mime_type = excluded.mime_type,
            total_chunks = excluded.total_chunks,
            total_size = excluded.total_size,
            is_large_file = excluded.is_large_file,
            encryption_iv = excluded.encryption_iv,
            additional_metadata = excluded.additional_metadata,
            is_complete = CASE WHEN excluded.is_complete = 1 THEN 1 ELSE content_metadata.is_complete END",
        params![
            content.content_id,
            content.session_id,
            content.content_type.as_str(),
            content.mime_type,
            content.total_chunks,
            content.total_size as i64,
            now,
            content.declared_complete as i64,
            is_large_file as i64,
            &content.encryption_iv[..],
            content.additional_metadata.to_string(),
        ],
    )?;

    get_content(conn, &content.content_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

pub fn update_additional_metadata(
    conn: &Connection,
    content_id: &str,
    additional_metadata: &serde_json::Value,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE content_metadata SET additional_metadata = ?1 WHERE content_id = ?2",
        params![additional_metadata.to_string(), content_id],
    )
}

pub fn mark_content_complete(conn: &Connection, content_id: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE content_metadata SET is_complete = 1 WHERE content_id = ?1",
        params![content_id],
    )
}

pub fn get_content(conn: &Connection, content_id: &str) -> rusqlite::Result<Option<ContentMeta>> {
    conn.query_row(
        "SELECT * FROM content_metadata WHERE content_id = ?1",
        params![content_id],
        row_to_content,
    )
    .optional()
}

pub fn get_received_chunk_count(conn: &Connection, content_id: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM chunk_metadata WHERE content_id = ?1",
        params![content_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as u32)
}

pub fn get_chunk_metadata(
    conn: &Connection,
    content_id: &str,
    chunk_index: u32,
) -> rusqlite::Result<Option<ChunkMeta>> {
    conn.query_row(
        "SELECT content_id, chunk_index, size, iv FROM chunk_metadata
         WHERE content_id = ?1 AND chunk_index = ?2",
        params![content_id, chunk_index],
        |row| {
            let iv_blob: Vec<u8> = row.get("iv")?;
            let mut iv = [0u8; 12];
            iv.copy_from_slice(&iv_blob[..12.min(iv_blob.len())]);
            Ok(ChunkMeta {
                content_id: row.get("content_id")?,
                chunk_index: row.get::<_, i64>("chunk_index")? as u32,
                size: row.get::<_, i64>("size")? as u64,
                iv,
            })
        },
    )
    .optional()
}

/// Upsert chunk metadata, then — inside the same transaction — flip
/// `is_complete` if this write brought the received count up to
/// `total_chunks`. Returns `(received_count, became_complete)`.
pub fn save_chunk_metadata_and_maybe_complete(
    conn: &mut Connection,
    content_id: &str,
    chunk_index: u32,
    size: u64,
    iv: &[u8; 12],
) -> rusqlite::Result<(u32, bool)> {
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO chunk_metadata (content_id, chunk_index, size, iv)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(content_id, chunk_index) DO UPDATE SET
            size = excluded.size,
            iv = excluded.iv",
        params![content_id, chunk_index, size as i64, &iv[..]],
    )?;

    let received: i64 = tx.query_row(
        "SELECT COUNT(*) FROM chunk_metadata WHERE content_id = ?1",
        params![content_id],
        |row| row.get(0),
    )?;

    let total_chunks: Option<i64> = tx
        .query_row(
            "SELECT total_chunks FROM content_metadata WHERE content_id = ?1",
            params![content_id],
            |row| row.get(0),
        )
        .optional()?;

    let mut became_complete = false;
    if let Some(total) = total_chunks {
        if received >= total {
            tx.execute(
                "UPDATE content_metadata SET is_complete = 1 WHERE content_id = ?1",
                params![content_id],
            )?;
            became_complete = true;
        }
    }

    tx.commit()?;
    Ok((received as u32, became_complete))
}

pub fn list_content(
    conn: &Connection,
    session_id: &str,
    limit: Option<usize>,
) -> rusqlite::Result<Vec<ContentMeta>> {
    let sql = match limit {
        Some(_) => {
            "SELECT * FROM content_metadata
             WHERE session_id = ?1 AND is_complete = 1
             ORDER BY is_pinned DESC, created_at DESC
             LIMIT ?2"
        }
        None => {
            "SELECT * FROM content_metadata
             WHERE session_id = ?1 AND is_complete = 1
             ORDER BY is_pinned DESC, created_at DESC"
        }
    };

    let mut stmt = conn.prepare(sql)?;
    let rows = if let Some(limit) = limit {
        stmt.query_map(params![session_id, limit as i64], row_to_content)?
    } else {
        stmt.query_map(params![session_id], row_to_content)?
    };

    rows.collect()
}

pub fn is_large_file(conn: &Connection, content_id: &str) -> rusqlite::Result<Option<bool>> {
    conn.query_row(
        "SELECT is_large_file FROM content_metadata WHERE content_id = ?1",
        params![content_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.map(|v| v != 0))
}

pub fn set_pinned(conn: &Connection, content_id: &str, pinned: bool) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE content_metadata SET is_pinned = ?1 WHERE content_id = ?2",
        params![pinned as i64, content_id],
    )
}

pub fn count_pinned(conn: &Connection, session_id: &str) -> rusqlite::Result<usize> {
    conn.query_row(
        "SELECT COUNT(*) FROM content_metadata WHERE session_id = ?1 AND is_pinned = 1",
        params![session_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as usize)
}

pub fn remove_content(conn: &mut Connection, content_id: &str) -> rusqlite::Result<bool> {
    let tx = conn.transaction()?;
    let deleted = tx.execute(
        "DELETE FROM content_metadata WHERE content_id = ?1",
        params![content_id],
    )?;
    tx.execute(
        "DELETE FROM chunk_metadata WHERE content_id = ?1",
        params![content_id],
    )?;
    tx.commit()?;
    Ok(deleted > 0)
}

/// Non-pinned completed content for a session, newest first — the candidate
/// set `cleanup_old_content` evicts from past `max_items`.
pub fn list_non_pinned_completed(
    conn: &Connection,
    session_id: &str,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT content_id FROM content_metadata
         WHERE session_id = ?1 AND is_pinned = 0 AND is_complete = 1
         ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
    rows.collect()
}

pub fn list_all_content_ids(conn: &Connection, session_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT content_id FROM content_metadata WHERE session_id = ?1")?;
    let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
    rows.collect()
}
