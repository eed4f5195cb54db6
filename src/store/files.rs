//! Chunk payload bytes on disk: `storageRoot/<sessionId>/<contentId>/<chunkIndex>`,
//! fsync-on-write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn chunk_path(root: &Path, session_id: &str, content_id: &str, chunk_index: u32) -> PathBuf {
    root.join(session_id).join(content_id).join(chunk_index.to_string())
}

pub fn write_chunk(
    root: &Path,
    session_id: &str,
    content_id: &str,
    chunk_index: u32,
    bytes: &[u8],
) -> std::io::Result<()> {
    let path = chunk_path(root, session_id, content_id, chunk_index);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(&path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

pub fn read_chunk(
    root: &Path,
    session_id: &str,
    content_id: &str,
    chunk_index: u32,
) -> std::io::Result<Option<Vec<u8>>> {
    let path = chunk_path(root, session_id, content_id, chunk_index);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove every chunk file belonging to `content_id`, plus its now-empty
/// directory. Safe to call when no files exist.
pub fn remove_content_dir(root: &Path, session_id: &str, content_id: &str) -> std::io::Result<()> {
    let dir = root.join(session_id).join(content_id);
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove every content directory for a session, plus the session directory
/// itself if left empty.
pub fn remove_session_dir(root: &Path, session_id: &str) -> std::io::Result<()> {
    let dir = root.join(session_id);
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
