//! Voice-capture WebSocket ingest endpoint (§4.5). Start/stop/implicit-start
//! timers, finalize-with-meta, and the post-finalize auto-trigger are timer logic
//! not present in the original `voice_capture.py`'s simpler synchronous handler —
//! added per SPEC_FULL.md §4.5.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth;
use crate::ids;
use crate::model::{is_technical, now_ms};
use crate::state::AppState;
use crate::summary::session::{encode_meta, VoiceMeta};

const SPURIOUS_STOP_WINDOW: Duration = Duration::from_millis(800);
const STOP_GRACE: Duration = Duration::from_millis(1800);
const NO_AUDIO_DIAGNOSTIC_AFTER: Duration = Duration::from_millis(2500);
const TICK_INTERVAL: Duration = Duration::from_millis(250);
const AUTO_TRIGGER_DELAY: Duration = Duration::from_millis(400);

#[derive(Debug, Deserialize)]
pub struct VoiceCaptureQuery {
    token: Option<String>,
}

pub async fn ws_voice_capture(
    ws: WebSocketUpgrade,
    Path(room_raw): Path<String>,
    Query(params): Query<VoiceCaptureQuery>,
    State(state): State<AppState>,
) -> Response {
    let enabled = state.config.voice_capture.enabled;
    ws.on_upgrade(move |mut socket| async move {
        if !enabled {
            close_with(&mut socket, 4403, "voice capture disabled").await;
            return;
        }
        handle_capture_socket(socket, room_raw, params, state).await;
    })
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    session: Option<u64>,
    #[serde(default)]
    ts: Option<i64>,
}

struct CaptureState {
    key: String,
    started: bool,
    start_instant: Option<Instant>,
    total_bytes: u64,
    no_audio_sent: bool,
    stop_pending: bool,
    stop_deadline: Option<Instant>,
    session: Option<u64>,
    client_ts_ms: Option<i64>,
    start_ctrl_ts_ms: Option<i64>,
}

impl CaptureState {
    fn new(key: String) -> Self {
        Self {
            key,
            started: false,
            start_instant: None,
            total_bytes: 0,
            no_audio_sent: false,
            stop_pending: false,
            stop_deadline: None,
            session: None,
            client_ts_ms: None,
            start_ctrl_ts_ms: None,
        }
    }

    fn mark_started(&mut self, session: Option<u64>, client_ts_ms: Option<i64>, explicit: bool) {
        if self.started {
            return;
        }
        self.started = true;
        self.start_instant = Some(Instant::now());
        self.session = session;
        self.client_ts_ms = client_ts_ms;
        if explicit {
            self.start_ctrl_ts_ms = Some(now_ms());
        }
    }
}

async fn handle_capture_socket(
    mut socket: WebSocket,
    room_raw: String,
    params: VoiceCaptureQuery,
    state: AppState,
) {
    let room_id = ids::canonical_room_id(&room_raw);

    let identity = auth::resolve_identity(
        &state.config.auth,
        state.config.server.allows_unauthenticated(),
        params.token.as_deref(),
    );
    let (user_id, authenticated) = match (&identity, params.token.is_some()) {
        (Ok((uid, _)), has_token) => (Some(*uid), has_token),
        (Err(_), _) => {
            close_with(&mut socket, 4401, "unauthorized").await;
            return;
        }
    };

    let key = match (authenticated, user_id) {
        (true, Some(uid)) => format!("{room_id}:{uid}"),
        _ => room_id.to_string(),
    };
    let user_id = user_id.expect("identity resolved above");

    let mut capture = CaptureState::new(key);
    let max_bytes = state.config.voice_capture.max_total_mb * 1024 * 1024;

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(ctrl) = serde_json::from_str::<ControlFrame>(&text) {
                            match ctrl.kind.as_str() {
                                "start" => {
                                    capture.mark_started(ctrl.session, ctrl.ts, true);
                                }
                                "stop" => {
                                    if !capture.started {
                                        continue;
                                    }
                                    let elapsed = capture.start_instant.map(|i| i.elapsed()).unwrap_or_default();
                                    if capture.total_bytes == 0 && elapsed < SPURIOUS_STOP_WINDOW {
                                        continue; // spurious restart, ignored per §4.5
                                    }
                                    capture.stop_pending = true;
                                    capture.stop_deadline = Some(Instant::now() + STOP_GRACE);
                                }
                                _ => {}
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        let explicit = capture.started;
                        capture.mark_started(None, None, false);
                        let _ = explicit;
                        state.voice_collector.add_chunk(&capture.key, data.to_vec());
                        capture.total_bytes += data.len() as u64;
                        capture.no_audio_sent = false;
                        if capture.total_bytes > max_bytes {
                            close_with(&mut socket, 1009, "voice capture exceeded upload cap").await;
                            break;
                        }
                        if capture.stop_pending {
                            finalize(&mut capture, &state, room_id, user_id).await;
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }

            _ = tick.tick() => {
                if capture.started && !capture.stop_pending && capture.total_bytes == 0 && !capture.no_audio_sent {
                    if capture.start_instant.map(|i| i.elapsed() > NO_AUDIO_DIAGNOSTIC_AFTER).unwrap_or(false) {
                        capture.no_audio_sent = true;
                        let _ = socket
                            .send(WsMessage::Text(
                                json!({"type": "no-audio", "message": "no audio received yet"}).to_string().into(),
                            ))
                            .await;
                    }
                }
                if capture.stop_pending {
                    if let Some(deadline) = capture.stop_deadline {
                        if Instant::now() >= deadline {
                            finalize(&mut capture, &state, room_id, user_id).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    if capture.started && !capture.stop_pending {
        // socket closed mid-capture without an explicit stop: finalize whatever
        // was buffered so the chunks aren't orphaned past the collector's TTL.
        finalize(&mut capture, &state, room_id, user_id).await;
    }
}

async fn finalize(capture: &mut CaptureState, state: &AppState, room_id: Uuid, user_id: Uuid) {
    let chunks = state.voice_collector.get_and_clear_chunks(&capture.key);
    let text = crate::asr::transcribe_chunks(
        state.config.ai_summary.openai_api_key.as_deref(),
        &chunks,
    )
    .await;

    let meta = VoiceMeta {
        capture_ts_ms: now_ms(),
        session: capture.session,
        client_ts_ms: capture.client_ts_ms,
        start_ctrl_ts_ms: capture.start_ctrl_ts_ms,
    };
    let encoded = encode_meta(&meta, &text);
    state.voice_collector.store_transcript(&capture.key, encoded.clone());

    if !text.trim().is_empty() && !is_technical(&text) {
        state.summary.add_voice_transcript(room_id, user_id, &encoded);

        let orchestrator = state.summary.clone();
        tokio::spawn(async move {
            tokio::time::sleep(AUTO_TRIGGER_DELAY).await;
            let _ = orchestrator.build_personal_summary(room_id, user_id).await;
        });
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
