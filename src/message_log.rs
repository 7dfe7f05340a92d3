//! Bounded, non-destructive per-room ring of chat messages (§4 MessageLog / §9 Open
//! Question #1: group summarization, if it existed, must not consume this log).

use std::collections::VecDeque;

use dashmap::DashMap;
use uuid::Uuid;

use crate::model::ChatMessage;

const DEFAULT_LIMIT_PER_ROOM: usize = 4000;

pub struct MessageLog {
    rooms: DashMap<Uuid, VecDeque<ChatMessage>>,
    limit_per_room: usize,
}

impl MessageLog {
    pub fn new(limit_per_room: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            limit_per_room: if limit_per_room == 0 {
                DEFAULT_LIMIT_PER_ROOM
            } else {
                limit_per_room
            },
        }
    }

    /// Appends a message, evicting the oldest entries FIFO once the per-room cap is
    /// exceeded. Empty content is ignored.
    pub fn add(&self, message: ChatMessage) {
        if message.content.trim().is_empty() {
            return;
        }
        let mut entry = self.rooms.entry(message.room_id).or_default();
        entry.push_back(message);
        while entry.len() > self.limit_per_room {
            entry.pop_front();
        }
    }

    /// All messages in `room` with `ts_ms >= from_ts_ms`, oldest first. Non-destructive.
    pub fn slice_since(&self, room_id: Uuid, from_ts_ms: i64) -> Vec<ChatMessage> {
        self.rooms
            .get(&room_id)
            .map(|q| q.iter().filter(|m| m.ts_ms >= from_ts_ms).cloned().collect())
            .unwrap_or_default()
    }

    /// The last `n` messages in `room`, oldest first. Non-destructive.
    pub fn tail(&self, room_id: Uuid, n: usize) -> Vec<ChatMessage> {
        self.rooms
            .get(&room_id)
            .map(|q| {
                let len = q.len();
                q.iter().skip(len.saturating_sub(n)).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// All user-visible (non-technical) messages in `room`, oldest first.
    pub fn all_user_visible(&self, room_id: Uuid) -> Vec<ChatMessage> {
        self.rooms
            .get(&room_id)
            .map(|q| {
                q.iter()
                    .filter(|m| !crate::model::is_technical(&m.content))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT_PER_ROOM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(room: Uuid, content: &str, ts_ms: i64) -> ChatMessage {
        ChatMessage {
            room_id: room,
            author_id: None,
            author_name: Some("U".into()),
            content: content.into(),
            ts_ms,
        }
    }

    #[test]
    fn add_ignores_empty_content() {
        let log = MessageLog::default();
        let room = Uuid::new_v4();
        log.add(msg(room, "   ", 1));
        assert!(log.tail(room, 10).is_empty());
    }

    #[test]
    fn fifo_eviction_past_cap() {
        let log = MessageLog::new(3);
        let room = Uuid::new_v4();
        for i in 0..5 {
            log.add(msg(room, &format!("m{i}"), i));
        }
        let remaining: Vec<_> = log.tail(room, 10).into_iter().map(|m| m.content).collect();
        assert_eq!(remaining, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn slice_since_is_non_destructive() {
        let log = MessageLog::default();
        let room = Uuid::new_v4();
        log.add(msg(room, "a", 10));
        log.add(msg(room, "b", 20));
        let first = log.slice_since(room, 15);
        assert_eq!(first.len(), 1);
        let second = log.slice_since(room, 0);
        assert_eq!(second.len(), 2);
    }
}
