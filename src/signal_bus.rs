//! Publish/subscribe over logical channels keyed by room (§4.1).
//!
//! Two backends: an in-process one built on bounded per-subscriber `mpsc` channels
//! with non-blocking `try_send` (a full queue drops the subscriber rather than
//! stalling the publisher — this supersedes `inmemory_bus.py`'s blocking `queue.put`
//! with a bounded, non-blocking enqueue), and a Redis-backed one matching
//! `redis_bus.py`'s channel/key layout.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{ChatMessage, Signal};

const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;
const PRESENCE_TTL_SECS: i64 = 60 * 60;

#[async_trait]
pub trait SignalBus: Send + Sync {
    async fn publish(&self, room_id: Uuid, signal: Signal);
    /// Registers a new subscriber and returns the receiving half. The caller drives
    /// delivery by repeatedly calling `recv()`; dropping the receiver unregisters it.
    async fn subscribe(&self, room_id: Uuid) -> mpsc::Receiver<Signal>;
    async fn update_presence(&self, room_id: Uuid, user_id: Uuid, present: bool);
    async fn list_presence(&self, room_id: Uuid) -> Vec<Uuid>;

    /// Chat fan-out on the sibling `room:{id}:chat` channel (§4.2). The sender is a
    /// subscriber like any other, so it receives its own chat exactly once through the
    /// same stream every other member uses (§9 Open Question: unify echo semantics).
    async fn publish_chat(&self, room_id: Uuid, message: ChatMessage);
    async fn subscribe_chat(&self, room_id: Uuid) -> mpsc::Receiver<ChatMessage>;
}

#[derive(Default)]
pub struct InProcessSignalBus {
    subscribers: DashMap<Uuid, Vec<mpsc::Sender<Signal>>>,
    chat_subscribers: DashMap<Uuid, Vec<mpsc::Sender<ChatMessage>>>,
    presence: DashMap<Uuid, std::collections::HashSet<Uuid>>,
}

impl InProcessSignalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalBus for InProcessSignalBus {
    async fn publish(&self, room_id: Uuid, signal: Signal) {
        let Some(mut subs) = self.subscribers.get_mut(&room_id) else {
            return; // publish-after-close / no subscribers is a no-op
        };
        subs.retain(|tx| tx.try_send(signal.clone()).is_ok());
    }

    async fn subscribe(&self, room_id: Uuid) -> mpsc::Receiver<Signal> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers.entry(room_id).or_default().push(tx);
        rx
    }

    async fn update_presence(&self, room_id: Uuid, user_id: Uuid, present: bool) {
        let mut set = self.presence.entry(room_id).or_default();
        if present {
            set.insert(user_id);
        } else {
            set.remove(&user_id);
        }
    }

    async fn list_presence(&self, room_id: Uuid) -> Vec<Uuid> {
        self.presence
            .get(&room_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn publish_chat(&self, room_id: Uuid, message: ChatMessage) {
        let Some(mut subs) = self.chat_subscribers.get_mut(&room_id) else {
            return;
        };
        subs.retain(|tx| tx.try_send(message.clone()).is_ok());
    }

    async fn subscribe_chat(&self, room_id: Uuid) -> mpsc::Receiver<ChatMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.chat_subscribers.entry(room_id).or_default().push(tx);
        rx
    }
}

pub struct RedisSignalBus {
    client: redis::Client,
}

impl RedisSignalBus {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn signals_channel(room_id: Uuid) -> String {
        format!("room:{room_id}:signals")
    }

    fn chat_channel(room_id: Uuid) -> String {
        format!("room:{room_id}:chat")
    }

    fn presence_key(room_id: Uuid) -> String {
        format!("room:{room_id}:presence")
    }
}

#[async_trait]
impl SignalBus for RedisSignalBus {
    async fn publish(&self, room_id: Uuid, signal: Signal) {
        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            tracing::warn!(%room_id, "signal_bus_publish_connect_failed");
            return;
        };
        let Ok(payload) = serde_json::to_string(&signal) else {
            return;
        };
        let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
            .arg(Self::signals_channel(room_id))
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(%room_id, error = %e, "signal_bus_publish_failed");
        }
    }

    async fn subscribe(&self, room_id: Uuid) -> mpsc::Receiver<Signal> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let client = self.client.clone();
        let channel = Self::signals_channel(room_id);
        tokio::spawn(async move {
            let Ok(conn) = client.get_async_connection().await else {
                return;
            };
            let mut pubsub = conn.into_pubsub();
            if pubsub.subscribe(&channel).await.is_err() {
                return;
            }
            let mut stream = pubsub.on_message();
            use futures_util::StreamExt;
            while let Some(msg) = stream.next().await {
                let Ok(payload): Result<String, _> = msg.get_payload() else {
                    continue;
                };
                let Ok(signal) = serde_json::from_str::<Signal>(&payload) else {
                    continue;
                };
                if tx.send(signal).await.is_err() {
                    break; // subscriber dropped; unregister by exiting the task
                }
            }
        });
        rx
    }

    async fn update_presence(&self, room_id: Uuid, user_id: Uuid, present: bool) {
        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            return;
        };
        let key = Self::presence_key(room_id);
        let result: redis::RedisResult<()> = if present {
            redis::cmd("HSET")
                .arg(&key)
                .arg(user_id.to_string())
                .arg("1")
                .query_async(&mut conn)
                .await
        } else {
            redis::cmd("HDEL")
                .arg(&key)
                .arg(user_id.to_string())
                .query_async(&mut conn)
                .await
        };
        if result.is_ok() {
            let _: redis::RedisResult<()> = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(PRESENCE_TTL_SECS)
                .query_async(&mut conn)
                .await;
        }
    }

    async fn list_presence(&self, room_id: Uuid) -> Vec<Uuid> {
        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            return Vec::new();
        };
        let keys: redis::RedisResult<Vec<String>> = redis::cmd("HKEYS")
            .arg(Self::presence_key(room_id))
            .query_async(&mut conn)
            .await;
        keys.unwrap_or_default()
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect()
    }

    async fn publish_chat(&self, room_id: Uuid, message: ChatMessage) {
        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            tracing::warn!(%room_id, "signal_bus_chat_publish_connect_failed");
            return;
        };
        let Ok(payload) = serde_json::to_string(&message) else {
            return;
        };
        let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
            .arg(Self::chat_channel(room_id))
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(%room_id, error = %e, "signal_bus_chat_publish_failed");
        }
    }

    async fn subscribe_chat(&self, room_id: Uuid) -> mpsc::Receiver<ChatMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let client = self.client.clone();
        let channel = Self::chat_channel(room_id);
        tokio::spawn(async move {
            let Ok(conn) = client.get_async_connection().await else {
                return;
            };
            let mut pubsub = conn.into_pubsub();
            if pubsub.subscribe(&channel).await.is_err() {
                return;
            }
            let mut stream = pubsub.on_message();
            use futures_util::StreamExt;
            while let Some(msg) = stream.next().await {
                let Ok(payload): Result<String, _> = msg.get_payload() else {
                    continue;
                };
                let Ok(chat) = serde_json::from_str::<ChatMessage>(&payload) else {
                    continue;
                };
                if tx.send(chat).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(room_id: Uuid, sender: Uuid) -> Signal {
        Signal {
            kind: crate::model::SignalKind::Offer,
            sender_id: sender,
            target_id: None,
            room_id,
            sdp: Some("v=0".into()),
            candidate: None,
            sent_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn subscribers_joining_after_publish_miss_it() {
        let bus = InProcessSignalBus::new();
        let room = Uuid::new_v4();
        bus.publish(room, signal(room, Uuid::new_v4())).await;
        let mut rx = bus.subscribe(room).await;
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err(), "late subscriber should not receive backfill");
    }

    #[tokio::test]
    async fn publish_delivers_to_every_current_subscriber() {
        let bus = InProcessSignalBus::new();
        let room = Uuid::new_v4();
        let mut rx1 = bus.subscribe(room).await;
        let mut rx2 = bus.subscribe(room).await;
        let sender = Uuid::new_v4();
        bus.publish(room, signal(room, sender)).await;
        assert_eq!(rx1.recv().await.unwrap().sender_id, sender);
        assert_eq!(rx2.recv().await.unwrap().sender_id, sender);
    }

    #[tokio::test]
    async fn publish_after_close_is_a_no_op() {
        let bus = InProcessSignalBus::new();
        let room = Uuid::new_v4();
        // publishing to a room with no subscribers must not panic.
        bus.publish(room, signal(room, Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn dead_subscriber_is_dropped_on_next_publish() {
        let bus = InProcessSignalBus::new();
        let room = Uuid::new_v4();
        {
            let _rx = bus.subscribe(room).await; // dropped immediately
        }
        let rx_live = bus.subscribe(room).await;
        drop(rx_live);
        // Neither subscriber is alive; publish must not panic and should prune both.
        bus.publish(room, signal(room, Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn presence_tracks_join_and_leave() {
        let bus = InProcessSignalBus::new();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        bus.update_presence(room, user, true).await;
        assert_eq!(bus.list_presence(room).await, vec![user]);
        bus.update_presence(room, user, false).await;
        assert!(bus.list_presence(room).await.is_empty());
    }
}
