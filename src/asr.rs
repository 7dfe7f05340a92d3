//! One-shot ASR call: concatenates buffered voice chunks and returns text, or a
//! technical placeholder on any failure (§4.5, grounded in `voice_transcript.py`'s
//! `transcribe_chunks`).

use reqwest::multipart;

use crate::voice_collector::VoiceChunk;

const ASR_TIMEOUT_SECS: u64 = 120;

/// Concatenates `chunks` and posts them to an OpenAI-Whisper-compatible transcription
/// endpoint. Never returns an `Err` — ASR failures degrade to a technical placeholder
/// string per §7's upstream-transient handling.
pub async fn transcribe_chunks(api_key: Option<&str>, chunks: &[VoiceChunk]) -> String {
    let Some(api_key) = api_key.filter(|k| !k.is_empty()) else {
        return "(asr disabled: no OPENAI_API_KEY)".to_string();
    };
    if chunks.is_empty() {
        return "(no audio chunks)".to_string();
    }

    let mut buf = Vec::with_capacity(chunks.iter().map(|c| c.data.len()).sum());
    for chunk in chunks {
        buf.extend_from_slice(&chunk.data);
    }

    let client = reqwest::Client::new();
    let part = multipart::Part::bytes(buf).file_name("audio.webm");
    let form = multipart::Form::new()
        .part("file", part)
        .text("model", "whisper-1");

    let result = client
        .post("https://api.openai.com/v1/audio/transcriptions")
        .bearer_auth(api_key)
        .timeout(std::time::Duration::from_secs(ASR_TIMEOUT_SECS))
        .multipart(form)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => match resp.json::<TranscriptionResponse>().await
        {
            Ok(body) => body.text,
            Err(_) => "(asr exception bad_response_body)".to_string(),
        },
        Ok(resp) => format!("(asr failed http {})", resp.status().as_u16()),
        Err(e) => format!("(asr exception {})", classify_reqwest_error(&e)),
    }
}

#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

fn classify_reqwest_error(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connect"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_chunks_yields_no_audio_placeholder() {
        let text = transcribe_chunks(Some("sk-fake"), &[]).await;
        assert_eq!(text, "(no audio chunks)");
    }

    #[tokio::test]
    async fn missing_api_key_yields_disabled_placeholder() {
        let chunks = vec![VoiceChunk {
            ts_ms: 0,
            data: vec![1, 2, 3],
        }];
        let text = transcribe_chunks(None, &chunks).await;
        assert_eq!(text, "(asr disabled: no OPENAI_API_KEY)");
    }
}
