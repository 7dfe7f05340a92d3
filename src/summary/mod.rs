//! `SummaryOrchestrator` (§4.6): the hardest subsystem. Owns per-(room,user) sessions
//! and drives `buildPersonalSummary`'s emergency-recovery, successor-session,
//! lazy-attach, pending-wait, second-chance, and voice-fallback steps.
//!
//! Grounded in `summary_v2/orchestrator.py`.

pub mod models;
pub mod session;
pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use uuid::Uuid;

use crate::ai_provider::AiProvider;
use crate::external_store::ExternalStore;
use crate::message_log::MessageLog;
use crate::model::{is_technical, now_ms, ChatMessage};
use crate::voice_collector::VoiceCollector;

use models::SummaryResult;
use session::UserAgentSession;
use strategies::StrategyConfig;

/// Pending-wait poll interval and total budget (§4.6 step 5, §5 cancellation policy).
const PENDING_WAIT_POLL_MS: u64 = 350;
const PENDING_WAIT_BUDGET_MS: u64 = 2500;

/// A just-ended session's transcript is still eligible for opportunistic reuse by a
/// fresh `startUserWindow` within this many milliseconds (§4.6's "7-second reuse").
const FAST_RESTART_REUSE_MS: i64 = 7_000;

/// Lazy-attach freshness tolerance (§4.6 step 3).
const LAZY_ATTACH_TOLERANCE_MS: i64 = 100;

pub struct SummaryOrchestratorConfig {
    pub ai_enabled: bool,
    pub min_chars: usize,
    pub participant_breakdown: bool,
}

pub struct SummaryOrchestrator {
    sessions: DashMap<(Uuid, Uuid), UserAgentSession>,
    message_log: Arc<MessageLog>,
    voice_collector: Arc<VoiceCollector>,
    ai: Arc<dyn AiProvider>,
    external_store: Arc<dyn ExternalStore>,
    config: SummaryOrchestratorConfig,
}

impl SummaryOrchestrator {
    pub fn new(
        message_log: Arc<MessageLog>,
        voice_collector: Arc<VoiceCollector>,
        ai: Arc<dyn AiProvider>,
        external_store: Arc<dyn ExternalStore>,
        config: SummaryOrchestratorConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            message_log,
            voice_collector,
            ai,
            external_store,
            config,
        }
    }

    fn voice_key(room_id: Uuid, user_id: Uuid) -> String {
        format!("{room_id}:{user_id}")
    }

    /// Stops any existing session (recording `endTs`), carrying over voice-only
    /// segments orphaned by chat not yet arriving, and installs a fresh one. Then
    /// opportunistically reuses a transcript generated in the last 7s.
    pub fn start_user_window(&self, room_id: Uuid, user_id: Uuid) {
        let now = now_ms();
        let carried_voice = self.sessions.get_mut(&(room_id, user_id)).map(|mut prior| {
            prior.stop(now);
            if prior.messages.is_empty() {
                prior.voice_segments.clone()
            } else {
                Vec::new()
            }
        });

        let mut fresh = UserAgentSession::new(room_id.to_string(), user_id, now);
        if let Some(segments) = carried_voice {
            fresh.voice_segments = segments;
        }
        self.sessions.insert((room_id, user_id), fresh);

        let key = Self::voice_key(room_id, user_id);
        if let Some(transcript) = self.voice_collector.get_transcript(&key) {
            if !is_technical(&transcript.text) && now - transcript.generated_at_ms <= FAST_RESTART_REUSE_MS {
                if let Some(mut session) = self.sessions.get_mut(&(room_id, user_id)) {
                    session.add_voice_transcript(&transcript.text, now);
                }
            }
        }
    }

    pub fn end_user_window(&self, room_id: Uuid, user_id: Uuid) {
        if let Some(mut session) = self.sessions.get_mut(&(room_id, user_id)) {
            session.stop(now_ms());
        }
    }

    /// Appends to the room's `MessageLog` and to every active session of the room.
    pub fn add_chat(
        &self,
        room_id: Uuid,
        author_id: Option<Uuid>,
        author_name: Option<String>,
        content: String,
    ) {
        let msg = ChatMessage {
            room_id,
            author_id,
            author_name,
            content,
            ts_ms: now_ms(),
        };
        self.message_log.add(msg.clone());
        for mut entry in self.sessions.iter_mut() {
            if entry.key().0 == room_id && entry.value().is_active() {
                entry.value_mut().add_chat(msg.clone());
            }
        }
    }

    /// Creates or reuses the (room,user) session and attempts to attach `raw_text`.
    pub fn add_voice_transcript(&self, room_id: Uuid, user_id: Uuid, raw_text: &str) -> bool {
        let now = now_ms();
        let mut entry = self
            .sessions
            .entry((room_id, user_id))
            .or_insert_with(|| UserAgentSession::new(room_id.to_string(), user_id, now));
        entry.add_voice_transcript(raw_text, now)
    }

    /// §4.6's successor-session check: if the session ended and newer chat or voice
    /// exists, replace it with a fresh session seeded from the new data.
    fn maybe_create_successor(&self, room_id: Uuid, user_id: Uuid, now: i64) {
        let Some(end_ts) = self
            .sessions
            .get(&(room_id, user_id))
            .and_then(|s| s.end_ts_ms)
        else {
            return;
        };
        let new_chats: Vec<ChatMessage> = self
            .message_log
            .slice_since(room_id, end_ts)
            .into_iter()
            .filter(|m| m.ts_ms > end_ts)
            .collect();
        let key = Self::voice_key(room_id, user_id);
        let fresh_voice = self
            .voice_collector
            .get_transcript(&key)
            .filter(|t| t.generated_at_ms > end_ts);
        if new_chats.is_empty() && fresh_voice.is_none() {
            return;
        }
        let start_ts = new_chats.first().map(|m| m.ts_ms).unwrap_or(now).min(now);
        let mut successor = UserAgentSession::new(room_id.to_string(), user_id, start_ts);
        for msg in new_chats {
            successor.add_chat(msg);
        }
        if let Some(t) = fresh_voice {
            successor.add_voice_transcript(&t.text, now);
        }
        self.sessions.insert((room_id, user_id), successor);
    }

    /// §4.6 step 3: attach a fresh transcript when the session has no voice yet.
    fn maybe_lazy_attach(&self, room_id: Uuid, user_id: Uuid, now: i64) {
        let Some(mut session) = self.sessions.get_mut(&(room_id, user_id)) else {
            return;
        };
        if !session.voice_segments.is_empty() {
            return;
        }
        let key = Self::voice_key(room_id, user_id);
        if let Some(t) = self.voice_collector.get_transcript(&key) {
            if !is_technical(&t.text) && t.generated_at_ms >= session.start_ts_ms - LAZY_ATTACH_TOLERANCE_MS {
                session.add_voice_transcript(&t.text, now);
            }
        }
    }

    async fn build_from_session(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        system_prompt: Option<&str>,
        now: i64,
    ) -> SummaryResult {
        let Some(session) = self.sessions.get(&(room_id, user_id)) else {
            return SummaryResult::empty(&room_id.to_string(), user_id, now);
        };
        let config = StrategyConfig {
            ai_enabled: self.config.ai_enabled,
            min_chars: self.config.min_chars,
            participant_breakdown: self.config.participant_breakdown,
            system_prompt,
        };
        session.build_summary(&self.ai, &config, now).await
    }

    async fn voice_fallback_summary(&self, room_id: Uuid, user_id: Uuid, system_prompt: Option<&str>) -> SummaryResult {
        let Some(session) = self.sessions.get(&(room_id, user_id)) else {
            return SummaryResult::empty(&room_id.to_string(), user_id, now_ms());
        };
        let pseudo = session.voice_as_pseudo_messages();
        let plain: Vec<String> = pseudo.iter().map(|m| m.to_plain()).collect();
        let ai_text = if self.config.ai_enabled {
            self.ai.generate_summary(&plain, system_prompt).await
        } else {
            String::new()
        };
        let voice_sources: Vec<&String> = plain.iter().rev().take(5).collect();
        let sources_block = voice_sources
            .iter()
            .rev()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let body = if !ai_text.trim().is_empty() {
            ai_text
        } else {
            format!("Heuristic voice digest:\n{}", session.merged_voice_text())
        };
        let text = if sources_block.is_empty() {
            body
        } else {
            format!("{body}\n\nSources (voice):\n{sources_block}")
        };
        SummaryResult {
            room_id: session.room_id.clone(),
            user_id: session.user_id,
            message_count: pseudo.len(),
            generated_at_ms: now_ms(),
            text,
            sources: plain,
            used_voice: true,
            participants: None,
        }
    }

    /// `buildPersonalSummary` (§4.6): the full orchestration routine.
    pub async fn build_personal_summary(&self, room_id: Uuid, user_id: Uuid) -> SummaryResult {
        let now = now_ms();
        let key = Self::voice_key(room_id, user_id);

        if !self.sessions.contains_key(&(room_id, user_id)) {
            // step 1: emergency recovery from the voice collector alone.
            if let Some(transcript) = self.voice_collector.get_transcript(&key) {
                if !is_technical(&transcript.text) {
                    let mut session = UserAgentSession::new(room_id.to_string(), user_id, now);
                    session.add_voice_transcript(&transcript.text, now);
                    self.sessions.insert((room_id, user_id), session);
                }
            }
            if !self.sessions.contains_key(&(room_id, user_id)) {
                return SummaryResult::empty(&room_id.to_string(), user_id, now);
            }
        }

        self.maybe_create_successor(room_id, user_id, now);
        self.maybe_lazy_attach(room_id, user_id, now);

        let system_prompt = self.external_store.get_user_system_prompt(user_id).await;

        let result = self
            .build_from_session(room_id, user_id, system_prompt.as_deref(), now)
            .await;
        if !result.is_empty() {
            return result;
        }

        // step 5: pending-wait, polling the voice collector.
        let mut waited_ms = 0u64;
        while waited_ms < PENDING_WAIT_BUDGET_MS {
            tokio::time::sleep(Duration::from_millis(PENDING_WAIT_POLL_MS)).await;
            waited_ms += PENDING_WAIT_POLL_MS;
            let Some(transcript) = self.voice_collector.get_transcript(&key) else {
                continue;
            };
            if is_technical(&transcript.text) {
                continue;
            }
            let now2 = now_ms();
            let accepted = self
                .sessions
                .get_mut(&(room_id, user_id))
                .map(|mut s| s.add_voice_transcript(&transcript.text, now2))
                .unwrap_or(false);
            if accepted {
                let rebuilt = self
                    .build_from_session(room_id, user_id, system_prompt.as_deref(), now2)
                    .await;
                if !rebuilt.is_empty() {
                    return rebuilt;
                }
            }
        }

        // step 6: second-chance fetch reapplying the freshness rule.
        let now3 = now_ms();
        self.maybe_lazy_attach(room_id, user_id, now3);
        let second_chance = self
            .build_from_session(room_id, user_id, system_prompt.as_deref(), now3)
            .await;
        if !second_chance.is_empty() {
            return second_chance;
        }

        // step 7: voice-only fallback synthesis.
        let has_voice = self
            .sessions
            .get(&(room_id, user_id))
            .map(|s| !s.voice_segments.is_empty())
            .unwrap_or(false);
        if has_voice {
            return self
                .voice_fallback_summary(room_id, user_id, system_prompt.as_deref())
                .await;
        }

        SummaryResult::empty(&room_id.to_string(), user_id, now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_provider::HeuristicAiProvider;
    use crate::external_store::InMemoryExternalStore;

    fn orchestrator() -> SummaryOrchestrator {
        SummaryOrchestrator::new(
            Arc::new(MessageLog::new(100)),
            Arc::new(VoiceCollector::new()),
            Arc::new(HeuristicAiProvider),
            Arc::new(InMemoryExternalStore::new()),
            SummaryOrchestratorConfig {
                ai_enabled: true,
                min_chars: 20,
                participant_breakdown: false,
            },
        )
    }

    #[tokio::test]
    async fn restart_with_two_voice_segments_does_not_leak_across_windows() {
        let orch = orchestrator();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();

        orch.start_user_window(room, user);
        orch.add_voice_transcript(room, user, "[meta captureTs=1000] First session about weather");
        let first = orch.build_personal_summary(room, user).await;
        assert!(first.message_count >= 1);
        assert!(first.text.contains("First session") || first.sources.iter().any(|s| s.contains("First session")));

        orch.end_user_window(room, user);
        orch.start_user_window(room, user);
        orch.add_voice_transcript(room, user, "[meta captureTs=5000] Second session about tech");
        let second = orch.build_personal_summary(room, user).await;
        let haystack = format!("{} {}", second.text, second.sources.join(" "));
        assert!(haystack.contains("Second session"));
        assert!(!haystack.contains("First session"));
    }

    #[tokio::test]
    async fn auto_resume_after_stop_drops_pre_restart_messages() {
        let orch = orchestrator();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();

        orch.start_user_window(room, user);
        orch.add_chat(room, Some(user), Some("User".into()), "msg-1".into());
        let first = orch.build_personal_summary(room, user).await;
        assert_eq!(first.message_count, 1);

        orch.end_user_window(room, user);
        orch.add_chat(room, Some(user), Some("User".into()), "msg-2".into());
        orch.add_chat(room, Some(user), Some("User".into()), "msg-3".into());
        let second = orch.build_personal_summary(room, user).await;
        assert!(second.message_count >= 2);
        let haystack = format!("{} {}", second.text, second.sources.join(" "));
        assert!(!haystack.contains("msg-1"));
    }

    #[tokio::test]
    async fn lazy_voice_attach_on_restart_does_not_duplicate_sentences() {
        let orch = orchestrator();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        let text_a = "We discussed the quarterly roadmap in detail today.";

        orch.start_user_window(room, user);
        orch.add_voice_transcript(room, user, text_a);
        let first = orch.build_personal_summary(room, user).await;
        assert!(!first.is_empty());

        orch.end_user_window(room, user);
        orch.start_user_window(room, user);
        orch.add_voice_transcript(room, user, text_a);
        let second = orch.build_personal_summary(room, user).await;
        assert!(!second.is_empty());
        let occurrences = second.sources.iter().filter(|s| s.contains("quarterly roadmap")).count();
        assert!(occurrences <= 1);
    }

    #[tokio::test]
    async fn fast_restart_within_seven_seconds_reuses_last_transcript() {
        let orch = orchestrator();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        let text_x = "Quick note about the release timeline.";

        orch.start_user_window(room, user);
        orch.add_voice_transcript(room, user, text_x);
        let _ = orch.build_personal_summary(room, user).await;

        orch.end_user_window(room, user);
        orch.start_user_window(room, user);
        let rebuilt = orch.build_personal_summary(room, user).await;
        let haystack = format!("{} {}", rebuilt.text, rebuilt.sources.join(" "));
        assert!(haystack.contains("release timeline"));
    }
}
