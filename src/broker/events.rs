//! JSON payload shapes for every inbound/outbound WebSocket event (§6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinIn {
    pub session_id: String,
    pub client_name: String,
    pub fingerprint: Vec<u8>,
    #[serde(default)]
    pub cached_content_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub name: String,
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<ClientSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientJoined {
    pub client_id: String,
    pub client_name: String,
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientLeft {
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveIn {
    pub session_id: String,
    #[serde(default)]
    pub cleanup_content: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionMetadata {
    pub iv: Vec<u8>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ContentData {
    pub content_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content_type: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub is_chunked: bool,
    #[serde(default)]
    pub total_chunks: Option<u32>,
    pub total_size: u64,
    pub encryption_metadata: EncryptionMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_large_file: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentIn {
    pub session_id: String,
    pub content: ContentData,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentOut {
    pub session_id: String,
    pub content: ContentData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChunkWire {
    pub content_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub encrypted_data: Vec<u8>,
    pub iv: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkIn {
    pub session_id: String,
    pub chunk: ChunkWire,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOut {
    pub session_id: String,
    pub chunk: ChunkWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveContentIn {
    pub session_id: String,
    pub content_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRemoved {
    pub session_id: String,
    pub content_id: String,
    pub removed_by: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinContentIn {
    pub session_id: String,
    pub content_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPinned {
    pub content_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentUnpinned {
    pub content_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListContentIn {
    pub session_id: String,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSummary {
    pub content_id: String,
    pub content_type: String,
    pub mime_type: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub is_pinned: bool,
    pub is_large_file: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListContentAck {
    pub success: bool,
    pub content: Vec<ContentSummary>,
    pub total_count: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPaginationInfo {
    pub total_count: usize,
    pub current_page: usize,
    pub page_size: usize,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingIn {
    pub session_id: String,
}

#[derive(Debug, Serialize, Default)]
pub struct Ack {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Ack {
            success: true,
            error: None,
        }
    }

    pub fn err(code: &str) -> Self {
        Ack {
            success: false,
            error: Some(code.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PingAck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
