//! Narrow persistence port (§2 "ExternalStore port"): the only two calls this crate
//! treats the account/room database as a collaborator for — a user's custom AI system
//! prompt, and recording that a user visited a room (skipped for ephemeral `call-…`
//! rooms). Everything else (full CRUD) is explicitly out of scope and lives elsewhere.
//!
//! Grounded in teacher `db.rs`'s query style and `ai_provider.py`'s
//! `get_user_system_prompt`.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

#[async_trait]
pub trait ExternalStore: Send + Sync {
    /// Best-effort lookup; DB errors are swallowed per §7 ("DB errors for prompt
    /// lookup are swallowed").
    async fn get_user_system_prompt(&self, user_id: Uuid) -> Option<String>;

    /// Records that `user_id` visited `room_id`. A no-op for ephemeral `call-…` rooms.
    async fn record_room_visit(&self, room_id: &str, user_id: Uuid);
}

pub fn is_ephemeral_room(room_id: &str) -> bool {
    room_id.starts_with("call-")
}

pub struct SqlxExternalStore {
    pool: PgPool,
}

impl SqlxExternalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExternalStore for SqlxExternalStore {
    async fn get_user_system_prompt(&self, user_id: Uuid) -> Option<String> {
        let result = sqlx::query_scalar::<_, Option<String>>(
            "SELECT ai_system_prompt FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await;
        match result {
            Ok(prompt) => prompt.flatten(),
            Err(e) => {
                // upstream-transient: DB errors for prompt lookup are swallowed per §7.
                tracing::warn!(%user_id, error = %e, "external_store_prompt_lookup_failed");
                None
            }
        }
    }

    async fn record_room_visit(&self, room_id: &str, user_id: Uuid) {
        if is_ephemeral_room(room_id) {
            return;
        }
        let result = sqlx::query(
            "INSERT INTO room_visits (room_id, user_id, visited_at) VALUES ($1, $2, now())
             ON CONFLICT (room_id, user_id) DO UPDATE SET visited_at = now()",
        )
        .bind(room_id)
        .bind(user_id)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            // upstream-transient: visit bookkeeping never blocks the room hub.
            tracing::warn!(room_id, %user_id, error = %e, "external_store_record_visit_failed");
        }
    }
}

/// In-memory fake used by tests and by deployments with no `database.url` configured.
#[derive(Default)]
pub struct InMemoryExternalStore {
    prompts: dashmap::DashMap<Uuid, String>,
    visits: dashmap::DashSet<(String, Uuid)>,
}

impl InMemoryExternalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_prompt(&self, user_id: Uuid, prompt: impl Into<String>) {
        self.prompts.insert(user_id, prompt.into());
    }

    pub fn visited(&self, room_id: &str, user_id: Uuid) -> bool {
        self.visits.contains(&(room_id.to_string(), user_id))
    }
}

#[async_trait]
impl ExternalStore for InMemoryExternalStore {
    async fn get_user_system_prompt(&self, user_id: Uuid) -> Option<String> {
        self.prompts.get(&user_id).map(|v| v.clone())
    }

    async fn record_room_visit(&self, room_id: &str, user_id: Uuid) {
        if is_ephemeral_room(room_id) {
            return;
        }
        self.visits.insert((room_id.to_string(), user_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_returns_configured_prompt() {
        let store = InMemoryExternalStore::new();
        let user = Uuid::new_v4();
        store.set_prompt(user, "be terse");
        assert_eq!(store.get_user_system_prompt(user).await, Some("be terse".to_string()));
    }

    #[tokio::test]
    async fn ephemeral_call_rooms_never_record_a_visit() {
        let store = InMemoryExternalStore::new();
        let user = Uuid::new_v4();
        store.record_room_visit("call-42", user).await;
        assert!(!store.visited("call-42", user));
    }

    #[tokio::test]
    async fn non_ephemeral_room_visit_is_recorded() {
        let store = InMemoryExternalStore::new();
        let user = Uuid::new_v4();
        store.record_room_visit("study-group", user).await;
        assert!(store.visited("study-group", user));
    }

    #[test]
    fn ephemeral_detection_matches_call_prefix() {
        assert!(is_ephemeral_room("call-42"));
        assert!(!is_ephemeral_room("study-group"));
    }
}
