//! `GET /download/{contentId}`: the one HTTP data-plane route. Streams
//! persisted chunks straight through to the response body without ever
//! decrypting or inspecting them.

pub mod range;

use std::collections::HashMap;
use std::pin::Pin;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::errors::AppError;
use crate::session::SessionManager;
use crate::store::{ChunkMeta, ChunkStore};

#[derive(Clone)]
pub struct DownloadState {
    pub sessions: SessionManager,
    pub store: ChunkStore,
}

/// Resolve `clientId`/token from either the `Authorization: Bearer` header
/// plus a `clientId` query param, or both fully in the query string — the
/// "signed query parameter" alternative named in the download contract for
/// clients that can't set headers (e.g. a plain `<a href>` download link).
fn extract_credentials(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<(String, String)> {
    let client_id = query.get("clientId")?.clone();

    let token = if let Some(auth) = headers.get(header::AUTHORIZATION) {
        auth.to_str().ok()?.strip_prefix("Bearer ")?.to_string()
    } else {
        query.get("token")?.clone()
    };

    Some((client_id, token))
}

pub async fn download_content(
    State(state): State<DownloadState>,
    Path(content_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    match serve(state, content_id, query, headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve(
    state: DownloadState,
    content_id: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let meta = state
        .store
        .get_content(content_id.clone())
        .await?
        .ok_or(AppError::ContentNotFound)?;

    if !meta.is_complete {
        return Err(AppError::ContentNotFound);
    }

    let (client_id, token) =
        extract_credentials(&headers, &query).ok_or(AppError::AuthRequired)?;

    if !state
        .sessions
        .validate_session_token(&meta.session_id, &client_id, &token)
        .await
    {
        return Err(AppError::InvalidToken);
    }

    let file_name = meta
        .additional_metadata
        .get("fileName")
        .and_then(|v| v.as_str())
        .unwrap_or("download");

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| range::parse_range(v, meta.total_size));

    let (status, byte_range) = match range_header {
        Some(r) => (StatusCode::PARTIAL_CONTENT, Some(r)),
        None => (StatusCode::OK, None),
    };

    let chunks = state.store.stream_content_for_download(
        meta.session_id.clone(),
        content_id.clone(),
        meta.total_chunks,
        0,
    );

    let body_stream: Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>> = match byte_range {
        Some(r) => Box::pin(slice_to_range(chunks, r.start, r.end))
            as Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>>,
        None => Box::pin(chunks.map(|res| res.map(|(bytes, _)| Bytes::from(bytes))))
            as Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>>,
    };

    let body = Body::from_stream(
        body_stream.map(|res| res.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
    );

    let mut response = Response::builder()
        .status(status)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .header(header::CONTENT_TYPE, meta.mime_type.clone());

    response = match byte_range {
        Some(r) => response
            .header(header::CONTENT_RANGE, r.content_range_header(meta.total_size))
            .header(header::CONTENT_LENGTH, r.len().to_string())
            .header(header::ACCEPT_RANGES, "bytes"),
        None => response
            .header(header::CONTENT_LENGTH, meta.total_size.to_string())
            .header(header::ACCEPT_RANGES, "bytes"),
    };

    response
        .body(body)
        .map_err(AppError::internal)
}

/// Trim a chunk stream down to the inclusive byte range `[start, end]`,
/// tracking the running byte offset as chunks arrive so no assumption about
/// uniform chunk size is needed.
fn slice_to_range<S>(chunks: S, start: u64, end: u64) -> impl Stream<Item = Result<Bytes, AppError>>
where
    S: Stream<Item = Result<(Vec<u8>, ChunkMeta), AppError>> + Send + 'static,
{
    let initial = (Box::pin(chunks), 0u64);
    futures::stream::unfold(initial, move |(mut stream, offset)| async move {
        loop {
            let (bytes, _meta) = match stream.next().await {
                None => return None,
                Some(Err(e)) => return Some((Err(e), (stream, offset))),
                Some(Ok(pair)) => pair,
            };

            let chunk_len = bytes.len() as u64;
            let chunk_start = offset;
            let chunk_end = chunk_start + chunk_len.saturating_sub(1);
            let next_offset = offset + chunk_len;

            if chunk_len == 0 || chunk_end < start {
                return Some((Ok(Bytes::new()), (stream, next_offset)));
            }
            if chunk_start > end {
                return None;
            }

            let lo = start.saturating_sub(chunk_start) as usize;
            let hi = (end.min(chunk_end) - chunk_start) as usize;
            let slice = Bytes::copy_from_slice(&bytes[lo..=hi]);

            return Some((Ok(slice), (stream, next_offset)));
        }
    })
    .filter(|res| futures::future::ready(!matches!(res, Ok(b) if b.is_empty())))
}
