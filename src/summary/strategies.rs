//! Chat and CombinedVoiceChat strategies (§4.6). Both share the same AI-vs-heuristic
//! decision and "Sources (last):" trailer; they differ only in the small-dialog-force
//! threshold grounded in `strategies.py`.

use std::sync::Arc;

use crate::ai_provider::AiProvider;
use crate::model::is_technical;

use super::models::{participant_breakdown, ParticipantStat, PlainMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Chat,
    CombinedVoiceChat,
}

impl StrategyKind {
    /// Small-dialog-force-AI threshold: Chat uses ≤5 messages, CombinedVoiceChat ≤8
    /// (ADDED distinction grounded in `strategies.py`'s differing thresholds).
    fn small_dialog_threshold(self) -> usize {
        match self {
            StrategyKind::Chat => 5,
            StrategyKind::CombinedVoiceChat => 8,
        }
    }
}

pub struct StrategyOutcome {
    pub text: String,
    pub sources: Vec<String>,
    pub participants: Option<Vec<ParticipantStat>>,
    pub used_ai: bool,
}

pub struct StrategyConfig<'a> {
    pub ai_enabled: bool,
    pub min_chars: usize,
    pub participant_breakdown: bool,
    pub system_prompt: Option<&'a str>,
}

pub async fn run(
    kind: StrategyKind,
    messages: &[PlainMessage],
    ai: &Arc<dyn AiProvider>,
    config: &StrategyConfig<'_>,
) -> StrategyOutcome {
    let non_technical: Vec<&PlainMessage> = messages
        .iter()
        .filter(|m| !is_technical(&m.content))
        .collect();

    let total_chars: usize = non_technical.iter().map(|m| m.content.len()).sum();
    let small_dialog_force = non_technical.len() <= kind.small_dialog_threshold() && total_chars >= 10;
    let should_use_ai = config.ai_enabled && (small_dialog_force || total_chars >= config.min_chars);

    let (text, used_ai) = if should_use_ai {
        let plain: Vec<String> = non_technical.iter().map(|m| m.to_plain()).collect();
        let summary = ai.generate_summary(&plain, config.system_prompt).await;
        (summary, true)
    } else {
        (heuristic_text(&non_technical), false)
    };

    let sources: Vec<String> = non_technical
        .iter()
        .rev()
        .take(5)
        .rev()
        .map(|m| m.to_plain())
        .collect();

    let participants = if config.participant_breakdown {
        let owned: Vec<PlainMessage> = non_technical.iter().map(|m| (*m).clone()).collect();
        Some(participant_breakdown(&owned))
    } else {
        None
    };

    // §4.6: "Always append a `Sources (last):` block listing the last up to 5 messages."
    let text = if sources.is_empty() {
        text
    } else {
        format!("{text}\n\nSources (last):\n{}", sources.join("\n"))
    };

    StrategyOutcome {
        text,
        sources,
        participants,
        used_ai,
    }
}

fn heuristic_text(messages: &[&PlainMessage]) -> String {
    if messages.is_empty() {
        return "Heuristic summary (AI not used): no content.".to_string();
    }
    let last_lines: Vec<String> = messages.iter().rev().take(10).rev().map(|m| m.to_plain()).collect();
    format!("Heuristic summary (AI not used):\n{}", last_lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_provider::HeuristicAiProvider;

    fn msg(author: &str, content: &str, ts: i64) -> PlainMessage {
        PlainMessage {
            author: author.to_string(),
            author_id: None,
            content: content.to_string(),
            ts_ms: ts,
        }
    }

    #[tokio::test]
    async fn small_dialog_forces_ai_even_below_min_chars() {
        let ai: Arc<dyn AiProvider> = Arc::new(HeuristicAiProvider);
        let messages = vec![msg("Alice", "hello there friend", 1)];
        let config = StrategyConfig {
            ai_enabled: true,
            min_chars: 10_000,
            participant_breakdown: false,
            system_prompt: None,
        };
        let out = run(StrategyKind::Chat, &messages, &ai, &config).await;
        assert!(out.used_ai);
    }

    #[tokio::test]
    async fn disabled_ai_always_uses_heuristic() {
        let ai: Arc<dyn AiProvider> = Arc::new(HeuristicAiProvider);
        let messages = vec![msg("Alice", "hello there friend", 1)];
        let config = StrategyConfig {
            ai_enabled: false,
            min_chars: 0,
            participant_breakdown: false,
            system_prompt: None,
        };
        let out = run(StrategyKind::Chat, &messages, &ai, &config).await;
        assert!(!out.used_ai);
        assert!(out.text.starts_with("Heuristic summary"));
    }

    #[tokio::test]
    async fn sources_trailer_caps_at_five_most_recent() {
        let ai: Arc<dyn AiProvider> = Arc::new(HeuristicAiProvider);
        let messages: Vec<PlainMessage> = (0..10).map(|i| msg("A", &format!("m{i}"), i)).collect();
        let config = StrategyConfig {
            ai_enabled: false,
            min_chars: 0,
            participant_breakdown: false,
            system_prompt: None,
        };
        let out = run(StrategyKind::CombinedVoiceChat, &messages, &ai, &config).await;
        assert_eq!(out.sources.len(), 5);
        assert!(out.sources[4].contains("m9"));
    }

    #[tokio::test]
    async fn participant_breakdown_is_only_computed_when_requested() {
        let ai: Arc<dyn AiProvider> = Arc::new(HeuristicAiProvider);
        let messages = vec![msg("Alice", "hi", 1)];
        let config = StrategyConfig {
            ai_enabled: false,
            min_chars: 0,
            participant_breakdown: true,
            system_prompt: None,
        };
        let out = run(StrategyKind::Chat, &messages, &ai, &config).await;
        assert!(out.participants.is_some());
    }
}
