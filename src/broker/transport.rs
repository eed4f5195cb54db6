//! The realtime transport capability the broker depends on, plus an
//! `axum` WebSocket-backed implementation.
//!
//! Per the design notes, the broker only ever talks to this trait — it has
//! no idea whether connections are WebSockets, a message queue, or anything
//! else. Rooms correspond 1:1 to session ids.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stable identity for a single live connection, assigned on upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(raw: u64) -> Self {
        ConnId(raw)
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> ConnId {
    ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
}

/// An inbound event as received from a connection: event name, JSON payload,
/// and the request id the sender wants echoed back with the ack (socket.io's
/// implicit ack callback, made explicit since our wire format is plain JSON
/// lines rather than a framed RPC protocol).
pub struct InboundEvent {
    pub conn_id: ConnId,
    pub name: String,
    pub payload: Value,
    pub request_id: Option<String>,
}

/// Capability set the broker needs from whatever bidirectional transport is
/// wired in underneath it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn emit_to_conn(&self, conn: ConnId, event: &str, payload: Value);
    async fn broadcast_to_room(&self, room: &str, event: &str, payload: Value, exclude: Option<ConnId>);
    async fn join_room(&self, conn: ConnId, room: &str);
    async fn leave_room(&self, conn: ConnId, room: &str);

    /// Reply to one inbound event with its ack body, correlated by
    /// `request_id`. A `None` request id (the sender didn't ask for an ack)
    /// makes this a no-op.
    async fn emit_ack(&self, conn: ConnId, request_id: Option<String>, body: Value);
}

struct ConnHandle {
    outbound: mpsc::UnboundedSender<Message>,
}

/// WebSocket-backed `Transport`. One task per upgraded connection reads
/// frames and forwards them onto a shared inbound queue; writes go through a
/// per-connection `mpsc` channel so broadcasts never block on one slow peer.
#[derive(Clone)]
pub struct WsTransport {
    conns: Arc<DashMap<ConnId, ConnHandle>>,
    rooms: Arc<DashMap<String, HashSet<ConnId>>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            conns: Arc::new(DashMap::new()),
            rooms: Arc::new(DashMap::new()),
        }
    }

    /// Drive one upgraded socket until it closes, forwarding decoded events
    /// onto `inbound`. Returns the assigned `ConnId` to the caller via the
    /// `on_connect` callback before entering the read loop.
    pub async fn run_connection(
        &self,
        socket: WebSocket,
        inbound: mpsc::UnboundedSender<InboundEvent>,
    ) {
        let conn_id = next_conn_id();
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        self.conns.insert(conn_id, ConnHandle { outbound: out_tx });

        let write_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(msg)) = ws_rx.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            let Ok(envelope) = serde_json::from_str::<WireEnvelope>(&text) else {
                continue;
            };
            let _ = inbound.send(InboundEvent {
                conn_id,
                name: envelope.event,
                payload: envelope.payload,
                request_id: envelope.request_id,
            });
        }

        let _ = inbound.send(InboundEvent {
            conn_id,
            name: "disconnect".to_string(),
            payload: Value::Null,
            request_id: None,
        });

        self.disconnect(conn_id).await;
        write_task.abort();
    }

    async fn disconnect(&self, conn_id: ConnId) {
        self.conns.remove(&conn_id);
        for mut room in self.rooms.iter_mut() {
            room.remove(&conn_id);
        }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(serde::Deserialize)]
struct WireEnvelope {
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, rename = "requestId")]
    request_id: Option<String>,
}

#[derive(serde::Serialize)]
struct WireOutbound<'a> {
    event: &'a str,
    payload: Value,
    #[serde(skip_serializing_if = "Option::is_none", rename = "requestId")]
    request_id: Option<String>,
}

fn frame(event: &str, payload: Value, request_id: Option<String>) -> Message {
    let envelope = WireOutbound {
        event,
        payload,
        request_id,
    };
    Message::Text(serde_json::to_string(&envelope).unwrap_or_default())
}

#[async_trait]
impl Transport for WsTransport {
    async fn emit_to_conn(&self, conn: ConnId, event: &str, payload: Value) {
        if let Some(handle) = self.conns.get(&conn) {
            let _ = handle.outbound.send(frame(event, payload, None));
        }
    }

    async fn emit_ack(&self, conn: ConnId, request_id: Option<String>, body: Value) {
        let Some(request_id) = request_id else {
            return;
        };
        if let Some(handle) = self.conns.get(&conn) {
            let _ = handle
                .outbound
                .send(frame("ack", body, Some(request_id)));
        }
    }

    async fn broadcast_to_room(
        &self,
        room: &str,
        event: &str,
        payload: Value,
        exclude: Option<ConnId>,
    ) {
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
    }

    async fn join_room(&self, conn: ConnId, room: &str) {
        self.rooms.entry(room.to_string()).or_default().insert(conn);
    }

    async fn leave_room(&self, conn: ConnId, room: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&conn);
        }
    }
}
