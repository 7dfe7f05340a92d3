//! Per-user "friends" WebSocket hub: one live socket per user, presence broadcast to
//! that user's friend set, direct-message relay, and call-invite delivery.
//!
//! Grounded in `friends.py`'s `_register`/`_unregister`/`broadcast_user`/`broadcast_users`
//! shape and its `WS_REGISTER`/`WS_REPLACE`/`WS_UNREGISTER`/`WS_SEND`/`WS_SEND_FAIL` log
//! markers, reworked as `tracing` events per SPEC_FULL.md §4.3 (always-on, no optional
//! metrics feature toggle).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth;
use crate::call_invites::{CallInvite, CallInviteNotifier};
use crate::state::AppState;

/// Close code sent to a socket being displaced by a newer connection for the same user.
pub const WS_CLOSE_SUPERSEDED: u16 = 4000;

const OUTBOUND_QUEUE_CAPACITY: usize = 64;

static FRIENDS_WS_ACTIVE: AtomicI64 = AtomicI64::new(0);
static NEXT_REGISTRATION_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A frame pushed through a registered socket's outbound channel: either a text
/// payload to relay verbatim, or an actual protocol-level close (used to displace a
/// superseded socket with a real WS close frame rather than a JSON text message).
pub enum Outbound {
    Text(String),
    Close(u16, String),
}

struct Registration {
    tx: mpsc::Sender<Outbound>,
    /// Unique per-registration generation, so a stale socket's deferred `unregister`
    /// can never evict the socket that superseded it (`friends.py`'s `_ws_to_user`
    /// keys unregister on the specific `ws` object; this is the Rust equivalent).
    token: u64,
}

/// Registry of live per-user friends sockets plus a replay buffer of pending invites
/// delivered the moment a user connects (covers an invite sent while they were offline).
#[derive(Default)]
pub struct FriendsHub {
    sockets: DashMap<Uuid, Registration>,
}

impl FriendsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `user_id`'s outbound channel, superseding (and closing, via close-code
    /// `4000`) any prior connection for the same user. Returns the receiver the caller's
    /// write task should drain, plus this registration's token — the caller must pass
    /// that token back to `unregister` so it only ever removes its own registration.
    pub fn register(&self, user_id: Uuid) -> (mpsc::Receiver<Outbound>, u64) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let token = NEXT_REGISTRATION_TOKEN.fetch_add(1, Ordering::Relaxed);
        if let Some((_, prev)) = self.sockets.remove(&user_id) {
            tracing::info!(%user_id, "ws_replace");
            let _ = prev
                .tx
                .try_send(Outbound::Close(WS_CLOSE_SUPERSEDED, "superseded".to_string()));
        } else {
            FRIENDS_WS_ACTIVE.fetch_add(1, Ordering::Relaxed);
        }
        self.sockets.insert(user_id, Registration { tx, token });
        tracing::info!(%user_id, "ws_register");
        (rx, token)
    }

    /// Removes `user_id`'s registration only if it still matches `token` — a socket
    /// superseded before its own cleanup ran must not evict the socket that replaced it.
    pub fn unregister(&self, user_id: Uuid, token: u64) {
        let removed = self.sockets.remove_if(&user_id, |_, reg| reg.token == token);
        if removed.is_some() {
            FRIENDS_WS_ACTIVE.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(%user_id, "ws_unregister");
        }
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.sockets.contains_key(&user_id)
    }

    pub fn active_count() -> i64 {
        FRIENDS_WS_ACTIVE.load(Ordering::Relaxed)
    }

    /// Best-effort send to a single user; returns whether delivery was attempted (the
    /// user was registered), not whether the peer actually received the frame.
    pub fn send_to(&self, user_id: Uuid, payload: &str) -> bool {
        let Some(reg) = self.sockets.get(&user_id) else {
            return false;
        };
        match reg.tx.try_send(Outbound::Text(payload.to_string())) {
            Ok(()) => {
                tracing::debug!(%user_id, "ws_send");
                true
            }
            Err(_) => {
                tracing::warn!(%user_id, "ws_send_fail");
                false
            }
        }
    }

    pub fn broadcast_user(&self, user_id: Uuid, event: &str, data: serde_json::Value) {
        let payload = json!({"type": event, "data": data}).to_string();
        self.send_to(user_id, &payload);
    }

    pub fn broadcast_users(&self, user_ids: &[Uuid], event: &str, data: serde_json::Value) {
        let payload = json!({"type": event, "data": data}).to_string();
        for user_id in user_ids {
            self.send_to(*user_id, &payload);
        }
    }
}

/// Adapts `FriendsHub` to the `CallInviteNotifier` port so `CallInviteService` never
/// imports the friends WS layer directly (§9 redesign flag: break the cyclic import).
pub struct FriendsHubCallNotifier {
    hub: Arc<FriendsHub>,
}

impl FriendsHubCallNotifier {
    pub fn new(hub: Arc<FriendsHub>) -> Self {
        Self { hub }
    }
}

fn invite_payload(invite: &CallInvite) -> serde_json::Value {
    json!({
        "roomId": invite.room_id,
        "fromUserId": invite.from_user_id,
        "fromUsername": invite.from_username,
        "fromEmail": invite.from_email,
        "createdAt": invite.created_at_ms,
    })
}

#[async_trait]
impl CallInviteNotifier for FriendsHubCallNotifier {
    async fn notify_invite(&self, invite: &CallInvite) {
        // §8 scenario 5: delivered to both A and B, not just the callee.
        self.hub.broadcast_users(
            &[invite.from_user_id, invite.to_user_id],
            "call_invite",
            invite_payload(invite),
        );
    }

    async fn notify_accept(&self, invite: &CallInvite) {
        self.hub.broadcast_users(
            &[invite.from_user_id, invite.to_user_id],
            "call_accept",
            invite_payload(invite),
        );
    }

    async fn notify_decline(&self, invite: &CallInvite) {
        self.hub.broadcast_users(
            &[invite.from_user_id, invite.to_user_id],
            "call_decline",
            invite_payload(invite),
        );
    }

    async fn notify_cancel(&self, invite: &CallInvite) {
        self.hub.broadcast_users(
            &[invite.from_user_id, invite.to_user_id],
            "call_cancel",
            invite_payload(invite),
        );
    }
}

#[derive(Debug, Deserialize)]
pub struct FriendsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "roomId")]
    room_id: Option<String>,
    #[serde(default, rename = "toUserId")]
    to_user_id: Option<Uuid>,
    #[serde(default)]
    reason: Option<String>,
}

pub async fn ws_friends(
    ws: WebSocketUpgrade,
    Query(params): Query<FriendsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_friends_socket(socket, params, state))
}

fn pending_invite_payload(invite: &CallInvite) -> serde_json::Value {
    json!({
        "roomId": invite.room_id,
        "fromUserId": invite.from_user_id,
        "fromUsername": invite.from_username,
        "fromEmail": invite.from_email,
        "createdAt": invite.created_at_ms,
        "pendingReplay": true,
    })
}

async fn handle_friends_socket(mut socket: WebSocket, params: FriendsQuery, state: AppState) {
    let identity = auth::resolve_identity(
        &state.config.auth,
        state.config.server.allows_unauthenticated(),
        params.token.as_deref(),
    );
    let (user_id, _display_name) = match identity {
        Ok(v) => v,
        Err(_) => {
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: 4401,
                    reason: "unauthorized".into(),
                })))
                .await;
            return;
        }
    };

    let (mut rx, token) = state.friends_hub.register(user_id);

    for invite in state.call_invites.list_pending_for(user_id).await {
        let payload = json!({"type": "call_invite", "data": pending_invite_payload(&invite)}).to_string();
        if socket.send(WsMessage::Text(payload.into())).await.is_err() {
            state.friends_hub.unregister(user_id, token);
            return;
        }
    }

    loop {
        tokio::select! {
            biased;

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<InboundFrame>(&text) else { continue };
                        match frame.kind.as_str() {
                            "ping" => {
                                let _ = socket.send(WsMessage::Text(json!({"type": "pong"}).to_string().into())).await;
                            }
                            "call_end" => {
                                // §4.3 point 3: mutual broadcast to both participants,
                                // independent of (and not routed through) the pending-invite
                                // state machine — a call_end ends an already-accepted call.
                                if let Some(to) = frame.to_user_id {
                                    let reason = frame.reason.unwrap_or_else(|| "hangup".to_string());
                                    let payload = json!({
                                        "roomId": frame.room_id,
                                        "fromUserId": user_id,
                                        "toUserId": to,
                                        "reason": reason,
                                    });
                                    state.friends_hub.broadcast_users(&[user_id, to], "call_end", payload);
                                }
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }

            outgoing = rx.recv() => {
                match outgoing {
                    Some(Outbound::Text(payload)) => {
                        if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(code, reason)) => {
                        let _ = socket
                            .send(WsMessage::Close(Some(CloseFrame { code, reason: reason.into() })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.friends_hub.unregister(user_id, token);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_text(outbound: Outbound) -> String {
        match outbound {
            Outbound::Text(s) => s,
            Outbound::Close(code, reason) => panic!("expected text, got close({code}, {reason})"),
        }
    }

    #[tokio::test]
    async fn registering_twice_supersedes_the_first_socket() {
        let hub = FriendsHub::new();
        let user = Uuid::new_v4();
        let (mut first, _first_token) = hub.register(user);
        let (_second, _second_token) = hub.register(user);
        let msg = first.recv().await.unwrap();
        match msg {
            Outbound::Close(code, reason) => {
                assert_eq!(code, WS_CLOSE_SUPERSEDED);
                assert!(reason.contains("superseded"));
            }
            Outbound::Text(_) => panic!("expected a protocol-level close, not a text frame"),
        }
        assert!(hub.is_online(user));
    }

    #[tokio::test]
    async fn send_to_unregistered_user_is_a_no_op() {
        let hub = FriendsHub::new();
        assert!(!hub.send_to(Uuid::new_v4(), "hello"));
    }

    #[tokio::test]
    async fn unregister_removes_from_registry_and_decrements_count() {
        let hub = FriendsHub::new();
        let user = Uuid::new_v4();
        let before = FriendsHub::active_count();
        let (_rx, token) = hub.register(user);
        assert_eq!(FriendsHub::active_count(), before + 1);
        hub.unregister(user, token);
        assert!(!hub.is_online(user));
        assert_eq!(FriendsHub::active_count(), before);
    }

    /// §8 scenario 6: a stale socket's deferred `unregister` must not evict the
    /// socket that superseded it.
    #[tokio::test]
    async fn stale_unregister_after_supersede_does_not_evict_the_new_socket() {
        let hub = FriendsHub::new();
        let user = Uuid::new_v4();
        let (_first_rx, first_token) = hub.register(user);
        let (mut second_rx, _second_token) = hub.register(user);

        // The superseded socket's read loop eventually runs its own cleanup with its
        // own (now-stale) token.
        hub.unregister(user, first_token);

        assert!(hub.is_online(user));
        assert!(hub.send_to(user, "friend_request"));
        let msg = expect_text(second_rx.recv().await.unwrap());
        assert_eq!(msg, "friend_request");
    }

    #[tokio::test]
    async fn call_end_broadcasts_to_both_participants_with_default_reason() {
        let hub = FriendsHub::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (mut rx_a, _) = hub.register(a);
        let (mut rx_b, _) = hub.register(b);
        let payload = json!({"roomId": "call-7", "fromUserId": a, "toUserId": b, "reason": "hangup"});
        hub.broadcast_users(&[a, b], "call_end", payload);
        let msg_a = expect_text(rx_a.recv().await.unwrap());
        let msg_b = expect_text(rx_b.recv().await.unwrap());
        assert!(msg_a.contains("call_end") && msg_a.contains("hangup"));
        assert!(msg_b.contains("call_end") && msg_b.contains("hangup"));
    }

    #[tokio::test]
    async fn notifier_delivers_invite_to_both_participants_with_canonical_event_names() {
        let hub = Arc::new(FriendsHub::new());
        let caller = Uuid::new_v4();
        let callee = Uuid::new_v4();
        let (mut rx_caller, _) = hub.register(caller);
        let (mut rx_callee, _) = hub.register(callee);
        let notifier = FriendsHubCallNotifier::new(hub.clone());
        let invite = CallInvite {
            room_id: "call-1".into(),
            from_user_id: caller,
            to_user_id: callee,
            from_username: Some("alice".into()),
            from_email: None,
            created_at_ms: 0,
        };

        notifier.notify_invite(&invite).await;
        assert!(expect_text(rx_caller.recv().await.unwrap()).contains("call_invite"));
        assert!(expect_text(rx_callee.recv().await.unwrap()).contains("call_invite"));

        notifier.notify_accept(&invite).await;
        assert!(expect_text(rx_caller.recv().await.unwrap()).contains("call_accept"));
        assert!(expect_text(rx_callee.recv().await.unwrap()).contains("call_accept"));

        notifier.notify_decline(&invite).await;
        assert!(expect_text(rx_caller.recv().await.unwrap()).contains("call_decline"));
        assert!(expect_text(rx_callee.recv().await.unwrap()).contains("call_decline"));

        notifier.notify_cancel(&invite).await;
        assert!(expect_text(rx_caller.recv().await.unwrap()).contains("call_cancel"));
        assert!(expect_text(rx_callee.recv().await.unwrap()).contains("call_cancel"));
    }
}
