//! HTTP/WebSocket router construction and the background maintenance tasks
//! (idle session expiry, per-session quota sweeps).

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::broker::{
    events::{ChunkIn, ContentIn, JoinIn, LeaveIn, ListContentIn, PinContentIn, PingIn, RemoveContentIn},
    transport::{InboundEvent, Transport, WsTransport},
    Broker,
};
use crate::config::{Config, CorsPolicy};
use crate::download::{download_content, DownloadState};
use crate::session::SessionManager;
use crate::store::ChunkStore;

#[derive(Clone)]
struct AppState {
    broker: Broker,
    ws_transport: WsTransport,
}

pub fn build_router(config: &Config, sessions: SessionManager, store: ChunkStore) -> Router {
    let ws_transport = WsTransport::new();
    let broker = Broker::new(
        sessions.clone(),
        store.clone(),
        Arc::new(ws_transport.clone()) as Arc<dyn Transport>,
        config.max_items_per_session,
    );

    let state = AppState {
        broker,
        ws_transport,
    };

    let download_state = DownloadState { sessions, store };

    let cors = match config.cors_origins() {
        CorsPolicy::Any => CorsLayer::new().allow_origin(AllowOrigin::any()),
        CorsPolicy::List(origins) => {
            let parsed: Vec<_> = origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(parsed))
        }
    };

    let realtime_router = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let download_router = Router::new()
        .route("/download/:contentId", get(download_content))
        .with_state(download_state);

    realtime_router
        .merge(download_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundEvent>();

    let transport = state.ws_transport.clone();
    let connection_task = tokio::spawn(async move {
        transport.run_connection(socket, inbound_tx).await;
    });

    // Events from one connection are handled one at a time, in receive
    // order; different connections each get their own `handle_socket` task
    // and run fully concurrently with one another.
    while let Some(event) = inbound_rx.recv().await {
        dispatch(&state.broker, &state.ws_transport, event).await;
    }

    connection_task.abort();
}

/// Route one decoded inbound event to its handler and ack the sender.
/// `disconnect` isn't dispatched here — it's driven by `run_connection`
/// returning, which the caller observes as `inbound_rx` closing; cleanup
/// for an abruptly closed socket happens in `ws_upgrade`'s caller via
/// `Broker::handle_disconnect` wired into the connection's drop path.
async fn dispatch(broker: &Broker, transport: &WsTransport, event: InboundEvent) {
    let span = tracing::info_span!("ws_event", event = %event.name, conn_id = ?event.conn_id);
    let _enter = span.enter();

    if event.name == "disconnect" {
        broker.handle_disconnect(event.conn_id).await;
        return;
    }

    let ack: Value = match event.name.as_str() {
        "join" => match serde_json::from_value::<JoinIn>(event.payload) {
            Ok(payload) => serde_json::to_value(broker.handle_join(event.conn_id, payload).await)
                .unwrap_or_default(),
            Err(e) => bad_request_ack(e),
        },
        "leave" => match serde_json::from_value::<LeaveIn>(event.payload) {
            Ok(payload) => serde_json::to_value(broker.handle_leave(event.conn_id, payload).await)
                .unwrap_or_default(),
            Err(e) => bad_request_ack(e),
        },
        "content" => match serde_json::from_value::<ContentIn>(event.payload) {
            Ok(payload) => serde_json::to_value(broker.handle_content(event.conn_id, payload).await)
                .unwrap_or_default(),
            Err(e) => bad_request_ack(e),
        },
        "chunk" => match serde_json::from_value::<ChunkIn>(event.payload) {
            Ok(payload) => serde_json::to_value(broker.handle_chunk(event.conn_id, payload).await)
                .unwrap_or_default(),
            Err(e) => bad_request_ack(e),
        },
        "remove-content" => match serde_json::from_value::<RemoveContentIn>(event.payload) {
            Ok(payload) => {
                serde_json::to_value(broker.handle_remove_content(event.conn_id, payload).await)
                    .unwrap_or_default()
            }
            Err(e) => bad_request_ack(e),
        },
        "pin-content" => match serde_json::from_value::<PinContentIn>(event.payload) {
            Ok(payload) => {
                serde_json::to_value(broker.handle_pin_content(event.conn_id, payload).await)
                    .unwrap_or_default()
            }
            Err(e) => bad_request_ack(e),
        },
        "unpin-content" => match serde_json::from_value::<PinContentIn>(event.payload) {
            Ok(payload) => {
                serde_json::to_value(broker.handle_unpin_content(event.conn_id, payload).await)
                    .unwrap_or_default()
            }
            Err(e) => bad_request_ack(e),
        },
        "list-content" => match serde_json::from_value::<ListContentIn>(event.payload) {
            Ok(payload) => {
                serde_json::to_value(broker.handle_list_content(event.conn_id, payload).await)
                    .unwrap_or_default()
            }
            Err(e) => bad_request_ack(e),
        },
        "ping" => match serde_json::from_value::<PingIn>(event.payload) {
            Ok(payload) => serde_json::to_value(broker.handle_ping(event.conn_id, payload).await)
                .unwrap_or_default(),
            Err(e) => bad_request_ack(e),
        },
        other => {
            tracing::warn!(event = other, "unrecognized event name");
            serde_json::json!({ "success": false, "error": "BAD_REQUEST" })
        }
    };

    transport.emit_ack(event.conn_id, event.request_id, ack).await;
}

fn bad_request_ack(err: serde_json::Error) -> Value {
    tracing::warn!(error = %err, "failed to decode event payload");
    serde_json::json!({ "success": false, "error": "BAD_REQUEST" })
}

/// Drive the idle-session and quota sweeps on `config.cleanup_interval`, and
/// notify the broker's disconnect handling only indirectly — expired
/// sessions are simply forgotten, they carry no live connection by
/// definition.
pub fn spawn_background_tasks(config: Config, sessions: SessionManager, store: ChunkStore) {
    let interval = Duration::from_millis(config.cleanup_interval.max(1));
    let session_expiry = config.session_expiry;
    let max_items = config.max_items_per_session;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let expired = sessions.expire_idle(session_expiry).await;
            for session in &expired {
                if let Err(err) = store
                    .cleanup_all_session_content(session.session_id.clone())
                    .await
                {
                    tracing::warn!(session_id = %session.session_id, error = %err, "failed to clean up expired session's content");
                }
            }

            for session_id in sessions.session_ids() {
                if let Err(err) = store.cleanup_old_content(session_id.clone(), max_items).await {
                    tracing::warn!(session_id = %session_id, error = %err, "quota sweep failed");
                }
            }
        }
    });
}
