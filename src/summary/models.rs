//! Value types shared by the orchestrator and its strategies.
//!
//! Grounded in `summary_v2/models.py`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message as seen by a strategy — either a real `ChatMessage` or a synthesized
/// pseudo-message built from a voice segment (`author = "voice"`).
#[derive(Debug, Clone)]
pub struct PlainMessage {
    pub author: String,
    pub author_id: Option<Uuid>,
    pub content: String,
    pub ts_ms: i64,
}

impl PlainMessage {
    pub fn to_plain(&self) -> String {
        format!("[{}] {}: {}", self.ts_ms, self.author, self.content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantStat {
    pub author: String,
    pub message_count: usize,
    pub last_samples: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    pub room_id: String,
    pub user_id: Uuid,
    pub message_count: usize,
    pub generated_at_ms: i64,
    pub text: String,
    pub sources: Vec<String>,
    pub used_voice: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<ParticipantStat>>,
}

impl SummaryResult {
    pub fn empty(room_id: &str, user_id: Uuid, now_ms: i64) -> Self {
        Self {
            room_id: room_id.to_string(),
            user_id,
            message_count: 0,
            generated_at_ms: now_ms,
            text: String::new(),
            sources: Vec::new(),
            used_voice: false,
            participants: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message_count == 0 && self.text.trim().is_empty()
    }
}

/// Per-author message counts + last-2 samples, sorted by descending count then name.
pub fn participant_breakdown(messages: &[PlainMessage]) -> Vec<ParticipantStat> {
    let mut by_author: HashMap<String, Vec<&PlainMessage>> = HashMap::new();
    for m in messages {
        by_author.entry(m.author.clone()).or_default().push(m);
    }
    let mut stats: Vec<ParticipantStat> = by_author
        .into_iter()
        .map(|(author, msgs)| {
            let last_samples = msgs
                .iter()
                .rev()
                .take(2)
                .rev()
                .map(|m| m.content.clone())
                .collect();
            ParticipantStat {
                author,
                message_count: msgs.len(),
                last_samples,
            }
        })
        .collect();
    stats.sort_by(|a, b| b.message_count.cmp(&a.message_count).then_with(|| a.author.cmp(&b.author)));
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_breakdown_sorts_by_count_then_name() {
        let msgs = vec![
            PlainMessage { author: "Bob".into(), author_id: None, content: "a".into(), ts_ms: 1 },
            PlainMessage { author: "Alice".into(), author_id: None, content: "b".into(), ts_ms: 2 },
            PlainMessage { author: "Alice".into(), author_id: None, content: "c".into(), ts_ms: 3 },
        ];
        let stats = participant_breakdown(&msgs);
        assert_eq!(stats[0].author, "Alice");
        assert_eq!(stats[0].message_count, 2);
        assert_eq!(stats[1].author, "Bob");
    }

    #[test]
    fn empty_summary_result_reports_empty() {
        let result = SummaryResult::empty("R", Uuid::nil(), 0);
        assert!(result.is_empty());
    }
}
