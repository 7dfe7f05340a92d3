//! Shared domain and wire types used across the signaling/presence/summary core.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current epoch milliseconds, matching the `ts`-in-milliseconds convention used
/// throughout the wire protocol and the summarization engine.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// Normalizes a client-supplied `signalType`: strips whitespace/underscores, lowercases,
    /// and folds `icecandidate`/`ICE_CANDIDATE`/etc. to the canonical `ice-candidate`.
    pub fn normalize(raw: &str) -> Option<Self> {
        let folded: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .flat_map(|c| c.to_lowercase())
            .collect();
        match folded.as_str() {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "icecandidate" => Some(Self::IceCandidate),
            _ => None,
        }
    }
}

/// A transient WebRTC signaling message relayed through the SignalBus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "signalType")]
    pub kind: SignalKind,
    #[serde(rename = "fromUserId")]
    pub sender_id: Uuid,
    #[serde(rename = "targetUserId", skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,
    pub room_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<serde_json::Value>,
    pub sent_at_ms: i64,
}

/// A chat message delivered to both the MessageLog and any active SummaryOrchestrator
/// sessions for the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub room_id: Uuid,
    pub author_id: Option<Uuid>,
    pub author_name: Option<String>,
    pub content: String,
    pub ts_ms: i64,
}

impl ChatMessage {
    /// `[ts] author: content`, the plain-text form fed to AI providers and heuristic
    /// fallbacks.
    pub fn to_plain(&self) -> String {
        let who = self.author_name.as_deref().unwrap_or("unknown");
        format!("[{}] {}: {}", self.ts_ms, who, self.content)
    }
}

const TECHNICAL_PATTERNS: [&str; 4] = [
    "(asr failed",
    "(asr exception",
    "(asr disabled",
    "(no audio",
];

/// Transcript/chat placeholders that must never be fed to an AI provider and must
/// never replace a prior valid voice segment.
pub fn is_technical(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    lower.is_empty() || TECHNICAL_PATTERNS.iter().any(|p| lower.starts_with(p))
}

/// The currently-joined set of connections in a room, recomputed on any join/leave.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PresenceView {
    pub users: Vec<Uuid>,
    pub user_names: HashMap<Uuid, String>,
    pub agent_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_variants_of_ice_candidate() {
        for raw in ["ice-candidate", "icecandidate", "ICE_CANDIDATE", "Ice Candidate"] {
            assert_eq!(SignalKind::normalize(raw), Some(SignalKind::IceCandidate));
        }
    }

    #[test]
    fn rejects_unknown_signal_types() {
        assert_eq!(SignalKind::normalize("bogus"), None);
    }

    #[test]
    fn detects_technical_placeholders() {
        assert!(is_technical("(no audio chunks)"));
        assert!(is_technical("(ASR FAILED http 400)"));
        assert!(is_technical(""));
        assert!(is_technical("   "));
        assert!(!is_technical("hello there, real transcript"));
    }

    #[test]
    fn chat_message_plain_form() {
        let m = ChatMessage {
            room_id: Uuid::nil(),
            author_id: None,
            author_name: Some("Alice".into()),
            content: "hi".into(),
            ts_ms: 1000,
        };
        assert_eq!(m.to_plain(), "[1000] Alice: hi");
    }
}
