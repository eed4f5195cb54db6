use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use veilcast::broker::transport::{ConnId, Transport};
use veilcast::broker::Broker;
use veilcast::session::SessionManager;
use veilcast::store::ChunkStore;

/// In-memory `Transport` for tests: records every emitted/broadcast frame
/// instead of pushing bytes over a socket.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub sent: Arc<std::sync::Mutex<Vec<(Option<ConnId>, String, Value)>>>,
    rooms: Arc<dashmap::DashMap<String, std::collections::HashSet<ConnId>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_for(&self, conn: ConnId) -> Vec<(String, Value)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| *c == Some(conn))
            .map(|(_, event, payload)| (event.clone(), payload.clone()))
            .collect()
    }

    pub fn broadcasts(&self) -> Vec<(String, Value)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| c.is_none())
            .map(|(_, event, payload)| (event.clone(), payload.clone()))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn emit_to_conn(&self, conn: ConnId, event: &str, payload: Value) {
        self.sent
            .lock()
            .unwrap()
            .push((Some(conn), event.to_string(), payload));
    }

    async fn broadcast_to_room(&self, room: &str, event: &str, payload: Value, exclude: Option<ConnId>) {
        let members: Vec<ConnId> = self
            .rooms
            .get(room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        for conn in members {
            if Some(conn) == exclude {
                continue;
            }
            self.emit_to_conn(conn, event, payload.clone()).await;
        }
        self.sent.lock().unwrap().push((None, event.to_string(), payload));
    }

    async fn join_room(&self, conn: ConnId, room: &str) {
        self.rooms.entry(room.to_string()).or_default().insert(conn);
    }

    async fn leave_room(&self, conn: ConnId, room: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&conn);
        }
    }

    async fn emit_ack(&self, conn: ConnId, _request_id: Option<String>, body: Value) {
        self.sent.lock().unwrap().push((Some(conn), "ack".to_string(), body));
    }
}

pub struct Fixture {
    pub _dir: TempDir,
    pub broker: Broker,
    pub transport: RecordingTransport,
    pub sessions: SessionManager,
    pub store: ChunkStore,
}

pub async fn fixture() -> Fixture {
    fixture_with_limits(10 * 1024 * 1024, 20, 50).await
}

pub async fn fixture_with_limits(
    large_file_threshold: u64,
    max_items_per_session: usize,
    max_pinned_items_per_session: usize,
) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::open(dir.path().to_path_buf(), large_file_threshold, max_pinned_items_per_session)
        .unwrap();
    let sessions = SessionManager::new();
    let transport = RecordingTransport::new();
    let broker = Broker::new(
        sessions.clone(),
        store.clone(),
        Arc::new(transport.clone()) as Arc<dyn Transport>,
        max_items_per_session,
    );

    Fixture {
        _dir: dir,
        broker,
        transport,
        sessions,
        store,
    }
}

/// Unused in most tests but kept here for suites that need a raw inbound
/// channel rather than going through `Broker` directly.
#[allow(dead_code)]
pub fn unbounded_channel() -> (mpsc::UnboundedSender<Value>, mpsc::UnboundedReceiver<Value>) {
    mpsc::unbounded_channel()
}

pub fn next_conn() -> ConnId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1000);
    ConnId::new(NEXT.fetch_add(1, Ordering::Relaxed))
}
