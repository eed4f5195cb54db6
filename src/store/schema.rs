//! Metadata database schema and the one-shot `fixLargeFileMetadata` migration.

use rusqlite::Connection;

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS content_metadata (
            content_id          TEXT PRIMARY KEY,
            session_id          TEXT NOT NULL,
            content_type        TEXT NOT NULL,
            mime_type           TEXT NOT NULL,
            total_chunks        INTEGER NOT NULL,
            total_size          INTEGER NOT NULL,
            created_at          TEXT NOT NULL,
            is_complete         INTEGER NOT NULL DEFAULT 0,
            is_pinned           INTEGER NOT NULL DEFAULT 0,
            is_large_file       INTEGER NOT NULL DEFAULT 0,
            encryption_iv       BLOB NOT NULL,
            additional_metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS chunk_metadata (
            content_id  TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            size        INTEGER NOT NULL,
            iv          BLOB NOT NULL,
            PRIMARY KEY (content_id, chunk_index)
        );

        CREATE INDEX IF NOT EXISTS idx_content_session_pin_created
            ON content_metadata (session_id, is_pinned, created_at);
        ",
    )?;

    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();

    if version.is_none() {
        conn.execute(
            "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
            [CURRENT_SCHEMA_VERSION.to_string()],
        )?;
    }

    Ok(())
}

/// Recompute `is_large_file` from `total_size > threshold` across every
/// record. Idempotent by construction — safe to run on every startup even
/// though it is conceptually a one-shot migration.
pub fn fix_large_file_metadata(conn: &Connection, threshold: u64) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE content_metadata SET is_large_file = (total_size > ?1)",
        [threshold as i64],
    )
}
