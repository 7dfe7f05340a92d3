//! `UserAgentSession` (§3, §4.6): a per-(room,user) window over chat and voice data.
//!
//! Grounded in `summary_v2/user_agent.py`.

use std::sync::Arc;

use crate::ai_provider::AiProvider;
use crate::model::{is_technical, ChatMessage};

use super::models::{PlainMessage, SummaryResult};
use super::strategies::{self, StrategyConfig, StrategyKind};

/// Voice meta carried as a struct field alongside text (§9 redesign flag), rather than
/// parsed out of a string prefix at every call site. The `[meta …]` string form is used
/// only at the WS/storage boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceMeta {
    pub capture_ts_ms: i64,
    pub session: Option<u64>,
    pub client_ts_ms: Option<i64>,
    pub start_ctrl_ts_ms: Option<i64>,
}

/// Parses a `[meta captureTs=<ms> session=<n>? clientTs=<n>? startCtrlTs=<n>]`
/// prefix. Returns `(meta, remaining_text)`; `meta` is `None` when no prefix is present.
pub fn parse_meta(raw: &str) -> (Option<VoiceMeta>, &str) {
    let trimmed = raw.trim_start();
    let Some(rest) = trimmed.strip_prefix("[meta ") else {
        return (None, raw);
    };
    let Some(end) = rest.find(']') else {
        return (None, raw);
    };
    let (fields, after) = rest.split_at(end);
    let after = after[1..].trim_start();
    let mut meta = VoiceMeta::default();
    for field in fields.split_whitespace() {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "captureTs" => meta.capture_ts_ms = value.parse().unwrap_or(0),
            "session" => meta.session = value.parse().ok(),
            "clientTs" => meta.client_ts_ms = value.parse().ok(),
            "startCtrlTs" => meta.start_ctrl_ts_ms = value.parse().ok(),
            _ => {}
        }
    }
    (Some(meta), after)
}

/// Encodes a meta struct back to its WS-boundary string form.
pub fn encode_meta(meta: &VoiceMeta, text: &str) -> String {
    let mut out = format!("[meta captureTs={}", meta.capture_ts_ms);
    if let Some(s) = meta.session {
        out.push_str(&format!(" session={s}"));
    }
    if let Some(c) = meta.client_ts_ms {
        out.push_str(&format!(" clientTs={c}"));
    }
    if let Some(s) = meta.start_ctrl_ts_ms {
        out.push_str(&format!(" startCtrlTs={s}"));
    }
    out.push(']');
    out.push(' ');
    out.push_str(text);
    out
}

const NO_META_ACCEPT_WINDOW_MS: i64 = 10_000;
const STALE_TOLERANCE_MS: i64 = 150;

pub struct UserAgentSession {
    pub room_id: String,
    pub user_id: uuid::Uuid,
    pub start_ts_ms: i64,
    pub end_ts_ms: Option<i64>,
    pub messages: Vec<ChatMessage>,
    /// Text-only voice segments (meta already stripped).
    pub voice_segments: Vec<String>,
}

impl UserAgentSession {
    pub fn new(room_id: impl Into<String>, user_id: uuid::Uuid, start_ts_ms: i64) -> Self {
        Self {
            room_id: room_id.into(),
            user_id,
            start_ts_ms,
            end_ts_ms: None,
            messages: Vec::new(),
            voice_segments: Vec::new(),
        }
    }

    pub fn stop(&mut self, now_ms: i64) {
        self.end_ts_ms = Some(now_ms);
    }

    pub fn is_active(&self) -> bool {
        self.end_ts_ms.is_none()
    }

    pub fn in_window(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ts_ms && self.end_ts_ms.map_or(true, |end| ts_ms <= end)
    }

    /// Appends `msg` when it falls within `[startTs, endTs]`; returns whether it was
    /// accepted.
    pub fn add_chat(&mut self, msg: ChatMessage) -> bool {
        if !self.in_window(msg.ts_ms) {
            return false;
        }
        self.messages.push(msg);
        true
    }

    /// Applies §4.6's `addVoiceTranscript` acceptance rules for a single session.
    /// `raw_text` may carry a `[meta …]` prefix.
    pub fn add_voice_transcript(&mut self, raw_text: &str, now_ms: i64) -> bool {
        let (meta, text) = parse_meta(raw_text);
        let text = text.trim();
        if text.is_empty() || is_technical(text) {
            return false;
        }
        match meta {
            Some(m) => {
                if m.capture_ts_ms < self.start_ts_ms - STALE_TOLERANCE_MS {
                    return false; // stale: predates this session's window
                }
            }
            None => {
                let elapsed = now_ms - self.start_ts_ms;
                if elapsed > NO_META_ACCEPT_WINDOW_MS || !self.voice_segments.is_empty() {
                    return false;
                }
            }
        }
        self.append_segment(text.to_string());
        true
    }

    fn append_segment(&mut self, text: String) {
        if let Some(existing) = self.voice_segments.iter_mut().find(|s| text.contains(s.as_str())) {
            *existing = text;
            return;
        }
        if self.voice_segments.iter().any(|s| s.contains(&text)) {
            return; // existing segment is already a superset of the new text
        }
        self.voice_segments.push(text);
    }

    pub fn merged_voice_text(&self) -> String {
        self.voice_segments.join(" ")
    }

    fn chat_as_plain(&self) -> Vec<PlainMessage> {
        self.messages
            .iter()
            .filter(|m| self.end_ts_ms.map_or(true, |end| m.ts_ms <= end))
            .map(|m| PlainMessage {
                author: m.author_name.clone().unwrap_or_else(|| "unknown".to_string()),
                author_id: m.author_id,
                content: m.content.clone(),
                ts_ms: m.ts_ms,
            })
            .collect()
    }

    pub(crate) fn voice_as_pseudo_messages(&self) -> Vec<PlainMessage> {
        let merged = self.merged_voice_text();
        split_into_sentences(&merged, 5)
            .into_iter()
            .enumerate()
            .map(|(i, sentence)| PlainMessage {
                author: "voice".to_string(),
                author_id: None,
                content: sentence,
                ts_ms: self.start_ts_ms + i as i64,
            })
            .collect()
    }

    fn voice_is_informative(&self) -> bool {
        let merged = self.merged_voice_text();
        merged.trim().len() >= 10 && !is_technical(&merged)
    }

    /// Dispatches to the Chat or CombinedVoiceChat strategy per §4.6's rules.
    pub async fn build_summary(
        &self,
        ai: &Arc<dyn AiProvider>,
        config: &StrategyConfig<'_>,
        now_ms: i64,
    ) -> SummaryResult {
        let chat = self.chat_as_plain();
        let all_chat_technical = !chat.is_empty() && chat.iter().all(|m| is_technical(&m.content));
        let voice_informative = self.voice_is_informative();

        let (kind, messages): (StrategyKind, Vec<PlainMessage>) = if chat.is_empty() && voice_informative {
            (StrategyKind::CombinedVoiceChat, self.voice_as_pseudo_messages())
        } else if all_chat_technical && voice_informative {
            (StrategyKind::CombinedVoiceChat, self.voice_as_pseudo_messages())
        } else if voice_informative {
            let mut merged = chat.clone();
            merged.extend(self.voice_as_pseudo_messages());
            (StrategyKind::CombinedVoiceChat, merged)
        } else {
            (StrategyKind::Chat, chat.clone())
        };

        let used_voice = matches!(kind, StrategyKind::CombinedVoiceChat);
        let outcome = strategies::run(kind, &messages, ai, config).await;

        SummaryResult {
            room_id: self.room_id.clone(),
            user_id: self.user_id,
            message_count: messages.len(),
            generated_at_ms: now_ms,
            text: outcome.text,
            sources: outcome.sources,
            used_voice,
            participants: outcome.participants,
        }
    }
}

/// Splits `text` into up to `max` sentences by terminal punctuation (`.`, `!`, `?`).
fn split_into_sentences(text: &str, max: usize) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim().to_string();
            if !trimmed.is_empty() {
                sentences.push(trimmed);
            }
            current.clear();
            if sentences.len() == max {
                return sentences;
            }
        }
    }
    let trimmed = current.trim().to_string();
    if !trimmed.is_empty() && sentences.len() < max {
        sentences.push(trimmed);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_meta_prefix() {
        let (meta, text) = parse_meta("[meta captureTs=1000 session=2 clientTs=900 startCtrlTs=800] hello");
        let meta = meta.unwrap();
        assert_eq!(meta.capture_ts_ms, 1000);
        assert_eq!(meta.session, Some(2));
        assert_eq!(text, "hello");
    }

    #[test]
    fn text_without_meta_prefix_round_trips() {
        let (meta, text) = parse_meta("plain transcript");
        assert!(meta.is_none());
        assert_eq!(text, "plain transcript");
    }

    #[test]
    fn stale_voice_before_window_start_is_rejected() {
        let mut session = UserAgentSession::new("R", uuid::Uuid::nil(), 10_000);
        let accepted = session.add_voice_transcript("[meta captureTs=1000] too early", 10_500);
        assert!(!accepted);
    }

    #[test]
    fn no_meta_voice_after_ten_seconds_is_rejected() {
        let mut session = UserAgentSession::new("R", uuid::Uuid::nil(), 0);
        let accepted = session.add_voice_transcript("late transcript", 11_000);
        assert!(!accepted);
    }

    #[test]
    fn second_no_meta_voice_segment_is_rejected() {
        let mut session = UserAgentSession::new("R", uuid::Uuid::nil(), 0);
        assert!(session.add_voice_transcript("first", 100));
        assert!(!session.add_voice_transcript("second", 200));
    }

    #[test]
    fn overlapping_segment_replaces_the_older_one() {
        let mut session = UserAgentSession::new("R", uuid::Uuid::nil(), 0);
        session.append_segment("hello".to_string());
        session.append_segment("hello world".to_string());
        assert_eq!(session.voice_segments, vec!["hello world".to_string()]);
    }

    #[test]
    fn chat_outside_window_is_rejected() {
        let mut session = UserAgentSession::new("R", uuid::Uuid::nil(), 1000);
        session.stop(2000);
        let msg = ChatMessage {
            room_id: uuid::Uuid::nil(),
            author_id: None,
            author_name: Some("A".into()),
            content: "late".into(),
            ts_ms: 3000,
        };
        assert!(!session.add_chat(msg));
    }

    #[test]
    fn split_into_sentences_caps_at_max() {
        let text = "One. Two. Three. Four. Five. Six.";
        let sentences = split_into_sentences(text, 5);
        assert_eq!(sentences.len(), 5);
    }
}
