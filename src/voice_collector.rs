//! Per-(room,user) append-only buffer of opaque voice chunks, and the finalized
//! transcript store (§4.5). Every public operation performs a lazy TTL purge of
//! both maps (5 minutes), matching `voice_transcript.py`.

use dashmap::DashMap;

use crate::model::now_ms;

const CHUNK_TTL_MS: i64 = 5 * 60 * 1000;
const TRANSCRIPT_TTL_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct VoiceChunk {
    pub ts_ms: i64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct VoiceTranscript {
    pub text: String,
    pub generated_at_ms: i64,
}

struct ChunkEntry {
    chunks: Vec<VoiceChunk>,
    last_touched_ms: i64,
}

struct TranscriptEntry {
    transcript: VoiceTranscript,
    last_touched_ms: i64,
}

/// Storage key convention: `{canonicalRoom}:{userId}` when authenticated, otherwise
/// `{canonicalRoom}` alone. Keys are opaque strings to this collector.
#[derive(Default)]
pub struct VoiceCollector {
    chunks: DashMap<String, ChunkEntry>,
    transcripts: DashMap<String, TranscriptEntry>,
}

impl VoiceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(&self) {
        let now = now_ms();
        self.chunks
            .retain(|_, e| now - e.last_touched_ms < CHUNK_TTL_MS);
        self.transcripts
            .retain(|_, e| now - e.last_touched_ms < TRANSCRIPT_TTL_MS);
    }

    pub fn add_chunk(&self, key: &str, data: Vec<u8>) {
        self.purge_expired();
        let now = now_ms();
        let mut entry = self.chunks.entry(key.to_string()).or_insert_with(|| ChunkEntry {
            chunks: Vec::new(),
            last_touched_ms: now,
        });
        entry.chunks.push(VoiceChunk { ts_ms: now, data });
        entry.last_touched_ms = now;
    }

    /// Drains and returns all chunks buffered for `key`.
    pub fn get_and_clear_chunks(&self, key: &str) -> Vec<VoiceChunk> {
        self.purge_expired();
        self.chunks
            .remove(key)
            .map(|(_, e)| e.chunks)
            .unwrap_or_default()
    }

    pub fn store_transcript(&self, key: &str, text: String) {
        self.purge_expired();
        let now = now_ms();
        self.transcripts.insert(
            key.to_string(),
            TranscriptEntry {
                transcript: VoiceTranscript {
                    text,
                    generated_at_ms: now,
                },
                last_touched_ms: now,
            },
        );
    }

    /// Non-destructive peek at the stored transcript for `key`.
    pub fn get_transcript(&self, key: &str) -> Option<VoiceTranscript> {
        self.purge_expired();
        self.transcripts.get(key).map(|e| e.transcript.clone())
    }

    /// Removes and returns the stored transcript for `key`.
    pub fn pop_transcript(&self, key: &str) -> Option<VoiceTranscript> {
        self.purge_expired();
        self.transcripts.remove(key).map(|(_, e)| e.transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_round_trip() {
        let coll = VoiceCollector::new();
        coll.add_chunk("room:user", vec![1, 2, 3]);
        coll.add_chunk("room:user", vec![4, 5]);
        let chunks = coll.get_and_clear_chunks("room:user");
        assert_eq!(chunks.len(), 2);
        assert!(coll.get_and_clear_chunks("room:user").is_empty());
    }

    #[test]
    fn transcript_peek_is_non_destructive() {
        let coll = VoiceCollector::new();
        coll.store_transcript("room:user", "hello".into());
        assert!(coll.get_transcript("room:user").is_some());
        assert!(coll.get_transcript("room:user").is_some());
        let popped = coll.pop_transcript("room:user");
        assert_eq!(popped.unwrap().text, "hello");
        assert!(coll.get_transcript("room:user").is_none());
    }
}
