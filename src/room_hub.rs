//! Per-room WebSocket registry, presence, chat and signaling relay, agent
//! registration (§4.2). Grounded on teacher `api.rs`'s `handle_ws`/`presence.rs`
//! shape, generalized from a single global gateway to one endpoint per room.

use std::collections::{HashMap, HashSet};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth;
use crate::ids;
use crate::model::{now_ms, PresenceView, Signal, SignalKind};
use crate::state::AppState;

const OUTBOUND_QUEUE_CAPACITY: usize = 128;

/// Live membership of a single room: connections, agent flags, and the display
/// name each connection presented on `join`. Modified only from the room hub read
/// loop of the joining/leaving socket; readers snapshot by copy before iterating
/// (§5 "Shared-resource policy").
#[derive(Default)]
struct RoomMembers {
    members: HashSet<Uuid>,
    agents: HashSet<Uuid>,
    display_names: HashMap<Uuid, String>,
    agent_owner: HashMap<Uuid, Uuid>,
    senders: HashMap<Uuid, mpsc::Sender<String>>,
}

impl RoomMembers {
    fn is_empty(&self) -> bool {
        self.members.is_empty() && self.agents.is_empty()
    }
}

/// Registry of every room's live membership, scoped to this process.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: dashmap::DashMap<Uuid, RoomMembers>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn join(&self, room_id: Uuid, conn_id: Uuid, display_name: String, sender: mpsc::Sender<String>) {
        let mut entry = self.rooms.entry(room_id).or_default();
        entry.members.insert(conn_id);
        entry.display_names.insert(conn_id, display_name);
        entry.senders.insert(conn_id, sender);
    }

    fn set_agent(&self, room_id: Uuid, conn_id: Uuid, owner: Uuid) {
        if let Some(mut entry) = self.rooms.get_mut(&room_id) {
            entry.agents.insert(conn_id);
            entry.agent_owner.insert(conn_id, owner);
        }
    }

    /// Removes `conn_id` from the room; drops the room entry entirely once empty.
    fn leave(&self, room_id: Uuid, conn_id: Uuid) {
        let empty = self.rooms.get_mut(&room_id).map(|mut entry| {
            entry.members.remove(&conn_id);
            entry.agents.remove(&conn_id);
            entry.display_names.remove(&conn_id);
            entry.agent_owner.remove(&conn_id);
            entry.senders.remove(&conn_id);
            entry.is_empty()
        });
        if empty == Some(true) {
            self.rooms.remove_if(&room_id, |_, v| v.is_empty());
        }
    }

    fn presence_view(&self, room_id: Uuid) -> PresenceView {
        match self.rooms.get(&room_id) {
            Some(entry) => PresenceView {
                users: entry.members.iter().copied().collect(),
                user_names: entry.display_names.clone(),
                agent_ids: entry.agents.iter().copied().collect(),
            },
            None => PresenceView::default(),
        }
    }

    fn senders_snapshot(&self, room_id: Uuid) -> Vec<mpsc::Sender<String>> {
        self.rooms
            .get(&room_id)
            .map(|e| e.senders.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Best-effort local broadcast (presence only — chat/signal go through
    /// `SignalBus` so they also reach other processes).
    fn broadcast(&self, room_id: Uuid, payload: &str) {
        for tx in self.senders_snapshot(room_id) {
            let _ = tx.try_send(payload.to_string());
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RoomQuery {
    token: Option<String>,
    #[serde(default)]
    agent: u8,
}

pub async fn ws_room(
    ws: WebSocketUpgrade,
    Path(room_raw): Path<String>,
    Query(params): Query<RoomQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_room_socket(socket, room_raw, params, state))
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "fromUserId")]
    from_user_id: Option<Uuid>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "signalType")]
    signal_type: Option<String>,
    #[serde(default, rename = "targetUserId")]
    target_user_id: Option<Uuid>,
    #[serde(default)]
    sdp: Option<String>,
    #[serde(default)]
    candidate: Option<serde_json::Value>,
}

async fn handle_room_socket(mut socket: WebSocket, room_raw: String, params: RoomQuery, state: AppState) {
    let room_id = ids::canonical_room_id(&room_raw);

    let identity = auth::resolve_identity(
        &state.config.auth,
        state.config.server.allows_unauthenticated(),
        params.token.as_deref(),
    );
    let (user_id, mut display_name) = match identity {
        Ok(v) => v,
        Err(_) => {
            close_with(&mut socket, 4401, "unauthorized").await;
            return;
        }
    };

    let is_agent = params.agent == 1;
    let conn_id = if is_agent {
        ids::agent_conn_id(room_id, user_id)
    } else {
        Uuid::new_v4()
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    let mut joined = false;

    let mut signal_sub = state.signal_bus.subscribe(room_id).await;
    let mut chat_sub = state.signal_bus.subscribe_chat(room_id).await;

    loop {
        tokio::select! {
            biased;

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match handle_inbound(
                            &text, room_id, &room_raw, conn_id, user_id, is_agent,
                            &mut display_name, &mut joined, &outbound_tx, &mut socket, &state,
                        ).await {
                            ControlFlow::Continue => {}
                            ControlFlow::Stop => break,
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }

            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(payload) => {
                        if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            signal = signal_sub.recv() => {
                let Some(signal) = signal else { continue };
                if socket.send(WsMessage::Text(signal_frame(&signal).into())).await.is_err() {
                    break;
                }
            }

            chat = chat_sub.recv() => {
                let Some(chat) = chat else { continue };
                if socket.send(WsMessage::Text(chat_frame(&chat).into())).await.is_err() {
                    break;
                }
            }
        }
    }

    if joined {
        if is_agent {
            state.summary.end_user_window(room_id, user_id);
        }
        state.room_registry.leave(room_id, conn_id);
        let presence = state.room_registry.presence_view(room_id);
        state
            .room_registry
            .broadcast(room_id, &presence_frame(&presence));
    }
}

enum ControlFlow {
    Continue,
    Stop,
}

#[allow(clippy::too_many_arguments)]
async fn handle_inbound(
    text: &str,
    room_id: Uuid,
    room_raw: &str,
    conn_id: Uuid,
    user_id: Uuid,
    is_agent: bool,
    display_name: &mut String,
    joined: &mut bool,
    outbound_tx: &mpsc::Sender<String>,
    socket: &mut WebSocket,
    state: &AppState,
) -> ControlFlow {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => {
            let _ = outbound_tx
                .send(error_frame("malformed frame"))
                .await;
            return ControlFlow::Continue;
        }
    };

    match frame.kind.as_str() {
        "ping" => {
            let _ = outbound_tx.try_send(json!({"type": "pong"}).to_string());
        }
        "join" => {
            if let Some(username) = frame.username {
                *display_name = username;
            }
            state
                .room_registry
                .join(room_id, conn_id, display_name.clone(), outbound_tx.clone());
            if is_agent {
                state.room_registry.set_agent(room_id, conn_id, user_id);
                state.summary.start_user_window(room_id, user_id);
            }
            *joined = true;
            if !crate::external_store::is_ephemeral_room(room_raw) {
                state.external_store.record_room_visit(room_raw, user_id).await;
            }
            let presence = state.room_registry.presence_view(room_id);
            state
                .room_registry
                .broadcast(room_id, &presence_frame(&presence));
        }
        "leave" => {
            close_with(socket, 1000, "leave").await;
            return ControlFlow::Stop;
        }
        "chat" => {
            let Some(content) = frame.content else {
                let _ = outbound_tx.send(error_frame("chat requires content")).await;
                return ControlFlow::Continue;
            };
            let author_id = frame.from_user_id.or(Some(user_id));
            state.summary.add_chat(room_id, author_id, Some(display_name.clone()), content.clone());
            let chat = crate::model::ChatMessage {
                room_id,
                author_id,
                author_name: Some(display_name.clone()),
                content,
                ts_ms: now_ms(),
            };
            state.signal_bus.publish_chat(room_id, chat).await;
        }
        "signal" => {
            let Some(raw_kind) = frame.signal_type.as_deref() else {
                let _ = outbound_tx.send(error_frame("signal requires signalType")).await;
                return ControlFlow::Continue;
            };
            let Some(kind) = SignalKind::normalize(raw_kind) else {
                let _ = outbound_tx.send(error_frame(&format!("unknown signalType: {raw_kind}"))).await;
                return ControlFlow::Continue;
            };
            let signal = Signal {
                kind,
                sender_id: frame.from_user_id.unwrap_or(user_id),
                target_id: frame.target_user_id,
                room_id,
                sdp: frame.sdp,
                candidate: frame.candidate,
                sent_at_ms: now_ms(),
            };
            state.signal_bus.publish(room_id, signal).await;
        }
        "agent_summary" => {
            let _ = outbound_tx
                .send(json!({"type": "agent_summary_ack", "data": {"status": "processing"}}).to_string())
                .await;
            let result = state.summary.build_personal_summary(room_id, user_id).await;
            let status = if result.is_empty() { "empty" } else { "done" };
            let source = if result.used_voice { "voice" } else { "chat" };
            let _ = outbound_tx
                .send(
                    json!({
                        "type": "agent_summary_ack",
                        "data": {
                            "status": status,
                            "source": source,
                            "finalized": true,
                            "result": result,
                        }
                    })
                    .to_string(),
                )
                .await;
        }
        other => {
            let _ = outbound_tx.send(error_frame(&format!("unknown frame type: {other}"))).await;
        }
    }
    ControlFlow::Continue
}

fn error_frame(message: &str) -> String {
    json!({"type": "error", "data": {"message": message}}).to_string()
}

fn presence_frame(presence: &PresenceView) -> String {
    json!({
        "type": "presence",
        "data": {
            "users": presence.users,
            "userNames": presence.user_names,
            "agentIds": presence.agent_ids,
        }
    })
    .to_string()
}

fn chat_frame(chat: &crate::model::ChatMessage) -> String {
    json!({
        "type": "chat",
        "data": {
            "fromUserId": chat.author_id,
            "authorName": chat.author_name,
            "content": chat.content,
        }
    })
    .to_string()
}

fn signal_frame(signal: &Signal) -> String {
    json!({
        "type": "signal",
        "data": {
            "fromUserId": signal.sender_id,
            "signalType": signal.kind,
            "sdp": signal.sdp,
            "candidate": signal.candidate,
            "targetUserId": signal.target_id,
        }
    })
    .to_string()
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_frame_serializes_expected_shape() {
        let presence = PresenceView {
            users: vec![Uuid::nil()],
            user_names: HashMap::new(),
            agent_ids: vec![],
        };
        let frame = presence_frame(&presence);
        assert!(frame.contains("\"type\":\"presence\""));
        assert!(frame.contains("\"users\""));
    }

    #[test]
    fn room_registry_tracks_join_and_leave() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);
        registry.join(room, conn, "Alice".into(), tx);
        let presence = registry.presence_view(room);
        assert_eq!(presence.users, vec![conn]);
        registry.leave(room, conn);
        assert!(registry.presence_view(room).users.is_empty());
    }

    #[test]
    fn agent_registration_is_reflected_in_presence() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);
        registry.join(room, conn, "Agent".into(), tx);
        registry.set_agent(room, conn, owner);
        let presence = registry.presence_view(room);
        assert_eq!(presence.agent_ids, vec![conn]);
    }
}
