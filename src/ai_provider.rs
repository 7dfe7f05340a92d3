//! Pluggable AI summarization backend (ADDED, grounded in `ai_provider.py`).
//!
//! `HeuristicAiProvider` is always available and deterministic; it is also the
//! degradation target whenever `AI_SUMMARY_ENABLED=false` or the HTTP provider fails.
//! `HttpAiProvider` posts an OpenAI-compatible chat-completions request.

use std::collections::HashMap;

use async_trait::async_trait;

#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Produces a summary from plain `[ts] author: content` lines. Never returns an
    /// `Err` that should abort the surrounding flow — degrade internally instead, per
    /// §7 ("AI/ASR failures never cause an empty SummaryResult without an explanatory
    /// prefix").
    async fn generate_summary(&self, plain_messages: &[String], system_prompt: Option<&str>) -> String;
}

pub struct HeuristicAiProvider;

#[async_trait]
impl AiProvider for HeuristicAiProvider {
    async fn generate_summary(&self, plain_messages: &[String], _system_prompt: Option<&str>) -> String {
        if plain_messages.is_empty() {
            return "No data to analyze.".to_string();
        }
        let mut author_counts: HashMap<String, usize> = HashMap::new();
        for line in plain_messages {
            if let Some(author) = extract_author(line) {
                *author_counts.entry(author).or_insert(0) += 1;
            }
        }
        let mut authors: Vec<(String, usize)> = author_counts.into_iter().collect();
        authors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let top_authors = if authors.is_empty() {
            "-".to_string()
        } else {
            authors
                .into_iter()
                .take(5)
                .map(|(name, count)| format!("{name}({count})"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let last_lines = plain_messages
            .iter()
            .rev()
            .take(5)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Heuristic AI digest:\nTotal messages: {}\nActive participants: {top_authors}\nRecent lines:\n{last_lines}",
            plain_messages.len(),
        )
    }
}

fn extract_author(line: &str) -> Option<String> {
    let after = line.split_once("] ")?.1;
    let name = after.split_once(':')?.0.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are an assistant producing a concise, structured summary of a group chat: 1) Main topics 2) Decisions made 3) Open questions. Be terse, no preamble.";

pub struct HttpAiProvider {
    api_key: String,
    model: String,
    fallback_model: Option<String>,
    client: reqwest::Client,
}

impl HttpAiProvider {
    pub fn new(api_key: String, model: String, fallback_model: Option<String>) -> Self {
        Self {
            api_key,
            model,
            fallback_model,
            client: reqwest::Client::new(),
        }
    }

    async fn post_chat_completion(&self, model: &str, system: &str, joined: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_secs(30))
            .json(&serde_json::json!({
                "model": model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": format!("Chat messages:\n{joined}\n---\nProduce a summary.")},
                ],
                "temperature": 0.3,
                "max_tokens": 600,
            }))
            .send()
            .await
    }
}

#[async_trait]
impl AiProvider for HttpAiProvider {
    async fn generate_summary(&self, plain_messages: &[String], system_prompt: Option<&str>) -> String {
        if plain_messages.is_empty() {
            return "No data to analyze.".to_string();
        }
        // safety bound on prompt size, matching the original's last-500-lines cap.
        let bounded: Vec<&String> = plain_messages.iter().rev().take(500).collect();
        let joined = bounded.into_iter().rev().cloned().collect::<Vec<_>>().join("\n");
        let system = system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT);

        match self.post_chat_completion(&self.model, system, &joined).await {
            Ok(resp) if resp.status().is_success() => parse_chat_content(resp).await,
            Ok(resp) if matches!(resp.status().as_u16(), 400 | 404) => {
                if let Some(fallback) = &self.fallback_model {
                    match self.post_chat_completion(fallback, system, &joined).await {
                        Ok(resp2) if resp2.status().is_success() => parse_chat_content(resp2).await,
                        Ok(resp2) => error_fallback(&joined, &format!("OpenAI HTTP {}", resp2.status().as_u16())),
                        Err(e) => error_fallback(&joined, &format!("exc:{e}")),
                    }
                } else {
                    error_fallback(&joined, "OpenAI HTTP 400/404")
                }
            }
            Ok(resp) => error_fallback(&joined, &format!("OpenAI HTTP {}", resp.status().as_u16())),
            Err(e) => error_fallback(&joined, &format!("exc:{e}")),
        }
    }
}

async fn parse_chat_content(resp: reqwest::Response) -> String {
    #[derive(serde::Deserialize)]
    struct ChatResponse {
        choices: Vec<Choice>,
    }
    #[derive(serde::Deserialize)]
    struct Choice {
        message: Message,
    }
    #[derive(serde::Deserialize)]
    struct Message {
        content: String,
    }

    match resp.json::<ChatResponse>().await {
        Ok(body) => body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_else(|| "No data to analyze.".to_string()),
        Err(_) => "No data to analyze.".to_string(),
    }
}

fn error_fallback(joined: &str, reason: &str) -> String {
    let tail = joined.lines().rev().take(10).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
    format!("[AI error: {reason}]\n{tail}")
}

/// Builds the configured provider: `openai:<model>` selects the HTTP provider when an
/// API key is present; anything else selects the heuristic provider.
pub fn build_provider(
    model_provider: &str,
    model_fallback: Option<String>,
    api_key: Option<String>,
) -> std::sync::Arc<dyn AiProvider> {
    if let (Some(rest), Some(key)) = (model_provider.strip_prefix("openai:"), api_key) {
        let model = if rest.is_empty() { "gpt-4o-mini" } else { rest };
        return std::sync::Arc::new(HttpAiProvider::new(key, model.to_string(), model_fallback));
    }
    std::sync::Arc::new(HeuristicAiProvider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heuristic_provider_handles_empty_input() {
        let out = HeuristicAiProvider.generate_summary(&[], None).await;
        assert_eq!(out, "No data to analyze.");
    }

    #[tokio::test]
    async fn heuristic_provider_ranks_authors_by_frequency() {
        let lines = vec![
            "[1] Alice: hi".to_string(),
            "[2] Bob: yo".to_string(),
            "[3] Alice: again".to_string(),
        ];
        let out = HeuristicAiProvider.generate_summary(&lines, None).await;
        assert!(out.contains("Alice(2)"));
        assert!(out.contains("Bob(1)"));
    }

    #[test]
    fn build_provider_falls_back_to_heuristic_without_key() {
        let provider = build_provider("openai:gpt-4o-mini", None, None);
        // Can't downcast a trait object cheaply here; just assert construction succeeds.
        let _ = provider;
    }
}
