//! Stateless per-room WebSocket relay.
//!
//! Every frame a connection sends is forwarded untouched to every other
//! connection in the same room. The relay never decodes payloads and keeps
//! no document state; a room exists only while it has members.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Room used when `/ws` is hit without a `room` query parameter
pub const DEFAULT_ROOM: &str = "default";

pub type ConnectionId = Uuid;

/// Outbound queue of one connection. Unbounded: a slow reader grows it
/// without limit.
pub type MemberSender = mpsc::UnboundedSender<Message>;

/// Room membership shared by every connection handler
#[derive(Clone, Default)]
pub struct RelayHub {
    rooms: Arc<DashMap<String, HashMap<ConnectionId, MemberSender>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to `room`, creating the room on first join
    pub fn join(&self, room: &str, tx: MemberSender) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut members = self.rooms.entry(room.to_string()).or_default();
        members.insert(id, tx);
        debug!(room, %id, members = members.len(), "Connection joined room");
        id
    }

    /// Remove a connection; the room is dropped once its last member leaves
    pub fn leave(&self, room: &str, id: ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&id);
        }
        if self
            .rooms
            .remove_if(room, |_, members| members.is_empty())
            .is_some()
        {
            debug!(room, "Room closed");
        }
    }

    /// Forward `message` to every member of `room` except `from`.
    /// Returns the number of members it was queued for.
    pub fn broadcast(&self, room: &str, from: ConnectionId, message: Message) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, tx) in members.iter() {
            if *id == from {
                continue;
            }
            // A closed queue belongs to a handler that is already leaving
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|members| members.len()).unwrap_or(0)
    }

    /// Room name to member count
    pub fn stats(&self) -> BTreeMap<String, usize> {
        self.rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("rooms", &self.room_count())
            .finish()
    }
}

/// Shared application state
struct AppState {
    hub: RelayHub,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub rooms: BTreeMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct RoomQuery {
    room: Option<String>,
}

/// Build the relay router around `hub`
pub fn router(hub: RelayHub) -> Router {
    let state = Arc::new(AppState {
        hub,
        started_at: Instant::now(),
        started_at_utc: Utc::now(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/ws", get(ws_query_handler))
        .route("/ws/:room", get(ws_path_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: state.started_at_utc,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        rooms: state.hub.stats(),
    })
}

async fn ws_path_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket upgrade request for room: {}", room);
    ws.on_upgrade(move |socket| handle_websocket(socket, room, state))
}

async fn ws_query_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<RoomQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let room = query.room.unwrap_or_else(|| DEFAULT_ROOM.to_string());
    info!("WebSocket upgrade request for room: {}", room);
    ws.on_upgrade(move |socket| handle_websocket(socket, room, state))
}

async fn handle_websocket(socket: WebSocket, room: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let hub = state.hub.clone();
    let id = hub.join(&room, tx);
    info!(room = %room, %id, "Connection opened");

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let recv_hub = hub.clone();
    let recv_room = room.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(message @ (Message::Binary(_) | Message::Text(_))) => {
                    let delivered = recv_hub.broadcast(&recv_room, id, message);
                    debug!(room = %recv_room, %id, delivered, "Relayed frame");
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(room = %recv_room, %id, "WebSocket error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.leave(&room, id);
    info!(room = %room, %id, "Connection closed");
}
