//! Deterministic identifier derivation (§9 of the design notes).
//!
//! Room ids and agent connection ids are derived as UUID-v5 over the standard
//! `NAMESPACE_URL` namespace, matching the original service byte-for-byte so that
//! a room or agent identity computed by either implementation agrees.

use uuid::Uuid;

/// Canonicalizes a free-form room identifier: if it already parses as a UUID, use it
/// as-is; otherwise derive a stable UUIDv5 from `webcall:{room_id}`.
pub fn canonical_room_id(raw: &str) -> Uuid {
    Uuid::parse_str(raw).unwrap_or_else(|_| {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("webcall:{raw}").as_bytes())
    })
}

/// Deterministic connection id for an AI agent joining `room_uuid` on behalf of `user_id`.
pub fn agent_conn_id(room_uuid: Uuid, user_id: Uuid) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("webcall:agent:{room_uuid}:{user_id}").as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_room_id_preserves_real_uuids() {
        let u = Uuid::new_v4();
        assert_eq!(canonical_room_id(&u.to_string()), u);
    }

    #[test]
    fn canonical_room_id_is_deterministic_for_free_form_strings() {
        let a = canonical_room_id("call-42");
        let b = canonical_room_id("call-42");
        assert_eq!(a, b);
        assert_ne!(a, canonical_room_id("call-43"));
    }

    #[test]
    fn agent_conn_id_is_deterministic_and_room_user_scoped() {
        let room = Uuid::new_v4();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        assert_eq!(agent_conn_id(room, user_a), agent_conn_id(room, user_a));
        assert_ne!(agent_conn_id(room, user_a), agent_conn_id(room, user_b));
    }
}
