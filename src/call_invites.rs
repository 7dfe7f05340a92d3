//! Call-invitation state machine (§4.4): `none -> pending -> {accepted|declined|cancelled|expired}`.
//!
//! Grounded in `call_invites.py` (in-memory) / `call_invites_redis.py` (durable). The
//! original breaks a module cycle with the friends WS layer via lazy imports; here the
//! service holds an injected `Arc<dyn CallInviteNotifier>` instead (§9 redesign flag).

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::model::now_ms;

const DEFAULT_MEMORY_TTL_SECS: u64 = 30;
const DEFAULT_REDIS_TTL_SECS: u64 = 15 * 60;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CallInvite {
    pub room_id: String,
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub from_username: Option<String>,
    pub from_email: Option<String>,
    pub created_at_ms: i64,
}

/// Callback interface a `CallInviteService` publishes lifecycle events through,
/// breaking the cyclic dependency the original source has between call-invite
/// storage and the friends WS module.
#[async_trait]
pub trait CallInviteNotifier: Send + Sync {
    async fn notify_invite(&self, invite: &CallInvite);
    async fn notify_accept(&self, invite: &CallInvite);
    async fn notify_decline(&self, invite: &CallInvite);
    async fn notify_cancel(&self, invite: &CallInvite);
}

#[async_trait]
pub trait CallInviteService: Send + Sync {
    async fn invite(
        &self,
        from: Uuid,
        to: Uuid,
        room_id: &str,
        from_username: Option<String>,
        from_email: Option<String>,
    ) -> Result<(), CallInviteError>;
    async fn accept(&self, from: Uuid, to: Uuid, room_id: &str) -> Result<(), CallInviteError>;
    async fn decline(&self, from: Uuid, to: Uuid, room_id: &str) -> Result<(), CallInviteError>;
    async fn cancel(&self, from: Uuid, to: Uuid, room_id: &str) -> Result<(), CallInviteError>;
    async fn list_pending_for(&self, user_id: Uuid) -> Vec<CallInvite>;
}

#[derive(Debug, thiserror::Error)]
pub enum CallInviteError {
    #[error("an invite is already pending for this room")]
    AlreadyPending,
    #[error("no pending invite for this room")]
    NotPending,
}

struct MemoryEntry {
    invite: CallInvite,
}

pub struct InMemoryCallInviteService {
    pending: DashMap<String, MemoryEntry>,
    notifier: std::sync::Arc<dyn CallInviteNotifier>,
    ttl_secs: u64,
}

impl InMemoryCallInviteService {
    pub fn new(notifier: std::sync::Arc<dyn CallInviteNotifier>, ttl_secs: Option<u64>) -> Self {
        Self {
            pending: DashMap::new(),
            notifier,
            ttl_secs: ttl_secs.unwrap_or(DEFAULT_MEMORY_TTL_SECS),
        }
    }

    fn purge_expired(&self) {
        let now = now_ms();
        let ttl_ms = self.ttl_secs as i64 * 1000;
        self.pending
            .retain(|_, e| now - e.invite.created_at_ms < ttl_ms);
    }
}

#[async_trait]
impl CallInviteService for InMemoryCallInviteService {
    async fn invite(
        &self,
        from: Uuid,
        to: Uuid,
        room_id: &str,
        from_username: Option<String>,
        from_email: Option<String>,
    ) -> Result<(), CallInviteError> {
        self.purge_expired();
        // §7 Conflict: the new invite silently replaces; the subsequent `insert` below
        // overwrites any existing entry for this room so the stored record always
        // reflects the latest invite.
        let invite = CallInvite {
            room_id: room_id.to_string(),
            from_user_id: from,
            to_user_id: to,
            from_username,
            from_email,
            created_at_ms: now_ms(),
        };
        self.pending
            .insert(room_id.to_string(), MemoryEntry { invite: invite.clone() });
        self.notifier.notify_invite(&invite).await;
        Ok(())
    }

    async fn accept(&self, from: Uuid, to: Uuid, room_id: &str) -> Result<(), CallInviteError> {
        self.purge_expired();
        let (_, entry) = self
            .pending
            .remove(room_id)
            .ok_or(CallInviteError::NotPending)?;
        let _ = (from, to);
        self.notifier.notify_accept(&entry.invite).await;
        Ok(())
    }

    async fn decline(&self, from: Uuid, to: Uuid, room_id: &str) -> Result<(), CallInviteError> {
        self.purge_expired();
        let (_, entry) = self
            .pending
            .remove(room_id)
            .ok_or(CallInviteError::NotPending)?;
        let _ = (from, to);
        self.notifier.notify_decline(&entry.invite).await;
        Ok(())
    }

    async fn cancel(&self, from: Uuid, to: Uuid, room_id: &str) -> Result<(), CallInviteError> {
        self.purge_expired();
        let (_, entry) = self
            .pending
            .remove(room_id)
            .ok_or(CallInviteError::NotPending)?;
        let _ = (from, to);
        self.notifier.notify_cancel(&entry.invite).await;
        Ok(())
    }

    async fn list_pending_for(&self, user_id: Uuid) -> Vec<CallInvite> {
        self.purge_expired();
        self.pending
            .iter()
            .filter(|e| e.invite.from_user_id == user_id || e.invite.to_user_id == user_id)
            .map(|e| e.invite.clone())
            .collect()
    }
}

pub struct RedisCallInviteService {
    client: redis::Client,
    notifier: std::sync::Arc<dyn CallInviteNotifier>,
    ttl_secs: u64,
}

impl RedisCallInviteService {
    pub fn new(client: redis::Client, notifier: std::sync::Arc<dyn CallInviteNotifier>, ttl_secs: Option<u64>) -> Self {
        Self {
            client,
            notifier,
            ttl_secs: ttl_secs.unwrap_or(DEFAULT_REDIS_TTL_SECS),
        }
    }

    fn invite_key(room_id: &str) -> String {
        format!("call_invite:{room_id}")
    }

    fn user_index_key(user_id: Uuid) -> String {
        format!("call_invite_user:{user_id}")
    }

    async fn read_invite(
        conn: &mut redis::aio::MultiplexedConnection,
        room_id: &str,
    ) -> Option<CallInvite> {
        let map: std::collections::HashMap<String, String> = redis::cmd("HGETALL")
            .arg(Self::invite_key(room_id))
            .query_async(conn)
            .await
            .ok()?;
        if map.is_empty() {
            return None;
        }
        Some(CallInvite {
            room_id: room_id.to_string(),
            from_user_id: Uuid::parse_str(map.get("fromUserId")?).ok()?,
            to_user_id: Uuid::parse_str(map.get("toUserId")?).ok()?,
            from_username: map.get("fromUsername").cloned(),
            from_email: map.get("fromEmail").cloned(),
            created_at_ms: map.get("ts")?.parse().ok()?,
        })
    }

    async fn finalize(&self, conn: &mut redis::aio::MultiplexedConnection, room_id: &str) -> Option<CallInvite> {
        let invite = Self::read_invite(conn, room_id).await?;
        let _: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(Self::invite_key(room_id))
            .cmd("ZREM")
            .arg(Self::user_index_key(invite.from_user_id))
            .arg(room_id)
            .cmd("ZREM")
            .arg(Self::user_index_key(invite.to_user_id))
            .arg(room_id)
            .query_async(conn)
            .await;
        Some(invite)
    }
}

#[async_trait]
impl CallInviteService for RedisCallInviteService {
    async fn invite(
        &self,
        from: Uuid,
        to: Uuid,
        room_id: &str,
        from_username: Option<String>,
        from_email: Option<String>,
    ) -> Result<(), CallInviteError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| CallInviteError::NotPending)?;
        let invite = CallInvite {
            room_id: room_id.to_string(),
            from_user_id: from,
            to_user_id: to,
            from_username: from_username.clone(),
            from_email: from_email.clone(),
            created_at_ms: now_ms(),
        };
        let ttl = self.ttl_secs as i64;
        let _: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(Self::invite_key(room_id))
            .arg("fromUserId")
            .arg(from.to_string())
            .arg("toUserId")
            .arg(to.to_string())
            .arg("fromUsername")
            .arg(from_username.unwrap_or_default())
            .arg("fromEmail")
            .arg(from_email.unwrap_or_default())
            .arg("ts")
            .arg(invite.created_at_ms)
            .cmd("EXPIRE")
            .arg(Self::invite_key(room_id))
            .arg(ttl)
            .cmd("ZADD")
            .arg(Self::user_index_key(from))
            .arg(invite.created_at_ms)
            .arg(room_id)
            .cmd("EXPIRE")
            .arg(Self::user_index_key(from))
            .arg(ttl)
            .cmd("ZADD")
            .arg(Self::user_index_key(to))
            .arg(invite.created_at_ms)
            .arg(room_id)
            .cmd("EXPIRE")
            .arg(Self::user_index_key(to))
            .arg(ttl)
            .query_async(&mut conn)
            .await;
        self.notifier.notify_invite(&invite).await;
        Ok(())
    }

    async fn accept(&self, _from: Uuid, _to: Uuid, room_id: &str) -> Result<(), CallInviteError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| CallInviteError::NotPending)?;
        let invite = self
            .finalize(&mut conn, room_id)
            .await
            .ok_or(CallInviteError::NotPending)?;
        self.notifier.notify_accept(&invite).await;
        Ok(())
    }

    async fn decline(&self, _from: Uuid, _to: Uuid, room_id: &str) -> Result<(), CallInviteError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| CallInviteError::NotPending)?;
        let invite = self
            .finalize(&mut conn, room_id)
            .await
            .ok_or(CallInviteError::NotPending)?;
        self.notifier.notify_decline(&invite).await;
        Ok(())
    }

    async fn cancel(&self, _from: Uuid, _to: Uuid, room_id: &str) -> Result<(), CallInviteError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| CallInviteError::NotPending)?;
        let invite = self
            .finalize(&mut conn, room_id)
            .await
            .ok_or(CallInviteError::NotPending)?;
        self.notifier.notify_cancel(&invite).await;
        Ok(())
    }

    async fn list_pending_for(&self, user_id: Uuid) -> Vec<CallInvite> {
        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            return Vec::new();
        };
        let room_ids: redis::RedisResult<Vec<String>> = redis::cmd("ZRANGE")
            .arg(Self::user_index_key(user_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await;
        let mut out = Vec::new();
        for room_id in room_ids.unwrap_or_default() {
            if let Some(invite) = Self::read_invite(&mut conn, &room_id).await {
                out.push(invite);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier {
        invites: AtomicUsize,
        accepts: AtomicUsize,
    }

    #[async_trait]
    impl CallInviteNotifier for CountingNotifier {
        async fn notify_invite(&self, _invite: &CallInvite) {
            self.invites.fetch_add(1, Ordering::SeqCst);
        }
        async fn notify_accept(&self, _invite: &CallInvite) {
            self.accepts.fetch_add(1, Ordering::SeqCst);
        }
        async fn notify_decline(&self, _invite: &CallInvite) {}
        async fn notify_cancel(&self, _invite: &CallInvite) {}
    }

    #[tokio::test]
    async fn invite_accept_clears_pending_and_notifies() {
        let notifier = std::sync::Arc::new(CountingNotifier::default());
        let service = InMemoryCallInviteService::new(notifier.clone(), None);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        service.invite(a, b, "call-42", None, None).await.unwrap();
        assert_eq!(service.list_pending_for(a).await.len(), 1);
        service.accept(a, b, "call-42").await.unwrap();
        assert!(service.list_pending_for(a).await.is_empty());
        assert_eq!(notifier.invites.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_second_invite_silently_replaces_the_first() {
        let notifier = std::sync::Arc::new(CountingNotifier::default());
        let service = InMemoryCallInviteService::new(notifier, None);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        service.invite(a, b, "call-42", None, None).await.unwrap();
        service.invite(a, c, "call-42", None, None).await.unwrap();
        let pending = service.list_pending_for(a).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].to_user_id, c);
    }

    #[tokio::test]
    async fn accept_without_pending_invite_errors() {
        let notifier = std::sync::Arc::new(CountingNotifier::default());
        let service = InMemoryCallInviteService::new(notifier, None);
        let result = service.accept(Uuid::new_v4(), Uuid::new_v4(), "call-none").await;
        assert!(matches!(result, Err(CallInviteError::NotPending)));
    }
}
