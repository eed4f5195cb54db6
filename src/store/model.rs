//! Content and chunk metadata types shared by the store, the broker, and the
//! download endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    File,
    Pdf,
    Other,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::File => "file",
            ContentType::Pdf => "pdf",
            ContentType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "text" => ContentType::Text,
            "image" => ContentType::Image,
            "file" => ContentType::File,
            "pdf" => ContentType::Pdf,
            _ => ContentType::Other,
        }
    }
}

/// The 12-byte AES-GCM-style IV the client attaches to content or a chunk.
/// The server persists and echoes it but never uses it cryptographically.
pub type Iv = [u8; 12];

#[derive(Debug, Clone)]
pub struct ContentMeta {
    pub content_id: String,
    pub session_id: String,
    pub content_type: ContentType,
    pub mime_type: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
    pub is_complete: bool,
    pub is_pinned: bool,
    pub is_large_file: bool,
    pub encryption_iv: Iv,
    pub additional_metadata: serde_json::Value,
}

/// Fields needed to create or replace a content metadata record.
/// `is_large_file` is derived once from `total_size`, not carried by callers.
pub struct NewContent {
    pub content_id: String,
    pub session_id: String,
    pub content_type: ContentType,
    pub mime_type: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub encryption_iv: Iv,
    pub additional_metadata: serde_json::Value,
    /// Set true when the caller is declaring the content already complete at
    /// creation (e.g. metadata-only saves for zero-byte content).
    pub declared_complete: bool,
}

#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub content_id: String,
    pub chunk_index: u32,
    pub size: u64,
    pub iv: Iv,
}

pub struct NewChunk {
    pub content_id: String,
    pub session_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub iv: Iv,
    pub bytes: Vec<u8>,
}
