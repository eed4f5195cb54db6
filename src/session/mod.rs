//! Session Manager: membership, fingerprint authentication, token lifecycle,
//! idle eviction.

mod token;

pub use token::{constant_time_eq, generate_token};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::broker::transport::ConnId;
use crate::errors::AppError;

pub type ClientId = String;

/// A connection's membership record within a session.
pub struct Client {
    pub client_id: ClientId,
    pub client_name: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub conn_id: ConnId,
    pub token: String,
}

/// A named room whose members share a passphrase, verified via `fingerprint`.
pub struct Session {
    pub session_id: String,
    pub fingerprint: Vec<u8>,
    pub created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    clients: RwLock<HashMap<ClientId, Client>>,
}

impl Session {
    fn new(session_id: String, fingerprint: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            fingerprint,
            created_at: now,
            last_activity: RwLock::new(now),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub async fn touch(&self) {
        *self.last_activity.write().await = Utc::now();
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().await
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn get_token(&self, client_id: &str) -> Option<String> {
        self.clients
            .read()
            .await
            .get(client_id)
            .map(|c| c.token.clone())
    }

    pub async fn members(&self) -> Vec<(ClientId, String, DateTime<Utc>)> {
        self.clients
            .read()
            .await
            .values()
            .map(|c| (c.client_id.clone(), c.client_name.clone(), c.connected_at))
            .collect()
    }

    pub async fn conn_ids(&self, exclude: Option<ConnId>) -> Vec<ConnId> {
        self.clients
            .read()
            .await
            .values()
            .map(|c| c.conn_id)
            .filter(|id| Some(*id) != exclude)
            .collect()
    }
}

/// Membership, authentication, token issuance, idle cleanup over all sessions.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, Arc<Session>>>,
}

/// Outcome of `expire_idle`, handed to the chunk store so it can optionally
/// purge session-scoped content.
pub struct ExpiredSession {
    pub session_id: String,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Join `session_id`, creating it lazily with `fingerprint` as the
    /// session's fingerprint if it doesn't already exist.
    ///
    /// Concurrent first-joins to the same `session_id` race on
    /// `DashMap::entry`, which resolves to exactly one inserted session —
    /// the equivalent of `INSERT OR IGNORE` at the storage layer.
    pub async fn join_session(
        &self,
        session_id: &str,
        fingerprint: Vec<u8>,
        client_id: ClientId,
        client_name: String,
        conn_id: ConnId,
    ) -> Result<(Arc<Session>, String), AppError> {
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Session::new(session_id.to_string(), fingerprint.clone())))
            .clone();

        if !constant_time_eq(&session.fingerprint, &fingerprint) {
            return Err(AppError::InvalidPassphrase);
        }

        let token = generate_token();
        let now = Utc::now();
        let client = Client {
            client_id: client_id.clone(),
            client_name,
            connected_at: now,
            last_activity: now,
            conn_id,
            token: token.clone(),
        };

        session.clients.write().await.insert(client_id, client);
        session.touch().await;

        Ok((session, token))
    }

    /// Constant-time token validation. Any mismatch — wrong token, unknown
    /// client, unknown session — returns `false`.
    pub async fn validate_session_token(
        &self,
        session_id: &str,
        client_id: &str,
        token: &str,
    ) -> bool {
        let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return false;
        };
        let Some(expected) = session.get_token(client_id).await else {
            return false;
        };
        constant_time_eq(expected.as_bytes(), token.as_bytes())
    }

    pub async fn remove_client_from_session(&self, session_id: &str, client_id: &str) {
        if let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) {
            session.clients.write().await.remove(client_id);
            session.touch().await;
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Snapshot of currently tracked session ids, for the periodic quota
    /// sweep in the server's background task.
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn refresh_activity(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) {
            session.touch().await;
        }
    }

    /// Periodic sweep: drop any session with zero clients that has been idle
    /// longer than `session_expiry_ms`. Returns the sessions removed so
    /// callers (e.g. the chunk store) can react.
    pub async fn expire_idle(&self, session_expiry_ms: u64) -> Vec<ExpiredSession> {
        let now = Utc::now();
        let mut expired = Vec::new();

        let candidates: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in candidates {
            let Some(session) = self.sessions.get(&session_id).map(|s| s.clone()) else {
                continue;
            };
            if session.client_count().await != 0 {
                continue;
            }
            let idle_ms = (now - session.last_activity().await).num_milliseconds();
            if idle_ms >= 0 && idle_ms as u64 > session_expiry_ms {
                self.sessions.remove(&session_id);
                expired.push(ExpiredSession { session_id });
            }
        }

        expired
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
