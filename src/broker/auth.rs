//! Authentication middleware: every event but `join`/`disconnect` must carry
//! a session/token pair minted by a prior successful join.

use dashmap::DashMap;

use super::transport::ConnId;
use crate::errors::AppError;
use crate::session::SessionManager;

/// What a connection is authenticated as, once it has joined a session.
#[derive(Clone)]
pub struct ConnState {
    pub session_id: String,
    pub client_id: String,
    pub token: String,
}

pub type ConnStateMap = DashMap<ConnId, ConnState>;

/// Validate that `conn_id` is authenticated for `claimed_session_id`.
///
/// Fails with `AUTH_REQUIRED` if the connection never joined, `NOT_IN_SESSION`
/// if the event names a different session than the one it joined,
/// `INVALID_TOKEN` if the token no longer validates, and
/// `SESSION_NOT_FOUND` if the session has since been torn down.
pub async fn require_active_session(
    sessions: &SessionManager,
    conn_states: &ConnStateMap,
    conn_id: ConnId,
    claimed_session_id: &str,
) -> Result<ConnState, AppError> {
    let state = conn_states
        .get(&conn_id)
        .map(|s| s.clone())
        .ok_or(AppError::AuthRequired)?;

    if state.session_id != claimed_session_id {
        return Err(AppError::NotInSession);
    }

    if sessions.get_session(&state.session_id).is_none() {
        return Err(AppError::SessionNotFound);
    }

    if !sessions
        .validate_session_token(&state.session_id, &state.client_id, &state.token)
        .await
    {
        return Err(AppError::InvalidToken);
    }

    Ok(state)
}
