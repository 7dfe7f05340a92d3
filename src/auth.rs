//! Bearer-token handling for the WS surface: decode-only (§1, issuance is out of
//! scope) plus a dev-mode guest bypass gated by `config.server.app_env`.
//!
//! Trimmed from teacher `auth.rs`, which also issued/signed tokens for a product
//! registration flow this crate does not own.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

/// Decodes and validates a bearer token against the configured RS256 public key.
pub fn validate_token(config: &AuthConfig, token: &str) -> AppResult<Claims> {
    let key_path = config
        .jwt_public_key_path
        .as_deref()
        .ok_or(AppError::Unauthorized)?;
    let pem = std::fs::read(key_path).map_err(|_| AppError::Unauthorized)?;
    let decoding_key = DecodingKey::from_rsa_pem(&pem).map_err(|_| AppError::Unauthorized)?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = true;

    decode::<Claims>(token, &decoding_key, &validation)
        .map(|data| data.claims)
        .map_err(|_| AppError::Unauthorized)
}

pub fn user_id_from_claims(claims: &Claims) -> AppResult<Uuid> {
    Uuid::parse_str(&claims.sub).map_err(|_| AppError::Unauthorized)
}

/// Synthesizes a throwaway identity for guest access, only ever called when
/// `config.server.allows_unauthenticated()` is true (dev/test environments).
pub fn guest_identity(username: &str) -> (Uuid, String) {
    (Uuid::new_v4(), username.to_string())
}

/// Resolves a WS connection's user identity: a valid bearer token, or — in
/// dev/test only — a freshly minted guest identity when no token is presented.
pub fn resolve_identity(
    config: &AuthConfig,
    allow_guest: bool,
    token: Option<&str>,
) -> AppResult<(Uuid, String)> {
    match token {
        Some(t) => {
            let claims = validate_token(config, t)?;
            let user_id = user_id_from_claims(&claims)?;
            Ok((user_id, claims.username))
        }
        None if allow_guest => Ok(guest_identity("guest")),
        None => Err(AppError::Unauthorized),
    }
}

/// Hashes a password with Argon2id — kept for dev-mode fixture/test user setup only;
/// this crate does not own a registration flow.
pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AppError::BadRequest(format!("failed to hash password: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> AppResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| AppError::BadRequest(format!("invalid password hash: {e}")))?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_identity_is_rejected_when_not_allowed() {
        let config = AuthConfig { jwt_public_key_path: None };
        let result = resolve_identity(&config, false, None);
        assert!(matches!(result, Err(AppError::Unauthorized)));
    }

    #[test]
    fn guest_identity_is_synthesized_when_allowed() {
        let config = AuthConfig { jwt_public_key_path: None };
        let result = resolve_identity(&config, true, None).unwrap();
        assert_eq!(result.1, "guest");
    }

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }
}
