use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub voice_capture: VoiceCaptureConfig,
    pub ai_summary: AiSummaryConfig,
    pub call_invites: CallInvitesConfig,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `dev`, `test`, or `prod`. `dev`/`test` relax auth on WS endpoints.
    pub app_env: String,
}

impl ServerConfig {
    pub fn allows_unauthenticated(&self) -> bool {
        matches!(self.app_env.as_str(), "dev" | "test")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Empty string disables the sqlx-backed external store; an in-memory fake is used instead.
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Empty string keeps SignalBus / CallInviteService / rate limiter on their in-process backends.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceCaptureConfig {
    pub enabled: bool,
    pub max_total_mb: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiSummaryConfig {
    pub enabled: bool,
    pub min_chars: usize,
    pub participant_breakdown: bool,
    pub max_messages_per_room: usize,
    /// `openai:<model>`, or empty to force the heuristic provider.
    pub model_provider: String,
    pub model_fallback: Option<String>,
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallInvitesConfig {
    /// `memory` or `redis`.
    pub backend: String,
    /// Overrides both backends' default TTL when set (§9 open question).
    pub ttl_secs: Option<u64>,
}

impl CallInvitesConfig {
    pub fn is_redis(&self) -> bool {
        self.backend.eq_ignore_ascii_case("redis")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// `<count>/<seconds>`, e.g. "100/60". Empty disables rate limiting.
    pub window: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Path to an RSA public key (PEM) used to validate RS256 bearer tokens on WS endpoints.
    pub jwt_public_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl AppConfig {
    /// Load configuration from `webrelay.toml`, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("WEBRELAY_CONFIG").unwrap_or_else(|_| "webrelay.toml".to_string());

        let builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.app_env", "dev")?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 5)?
            .set_default("redis.url", "")?
            .set_default("voice_capture.enabled", true)?
            .set_default("voice_capture.max_total_mb", 30)?
            .set_default("ai_summary.enabled", true)?
            .set_default("ai_summary.min_chars", 40)?
            .set_default("ai_summary.participant_breakdown", false)?
            .set_default("ai_summary.max_messages_per_room", 4000)?
            .set_default("ai_summary.model_provider", "")?
            .set_default("call_invites.backend", "memory")?
            .set_default("rate_limit.window", "100/60")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "plain")?;

        let builder = if Path::new(&config_path).exists() {
            builder.add_source(config::File::with_name(&config_path))
        } else {
            tracing::warn!("Config file '{}' not found, using defaults", config_path);
            builder
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix("WEBRELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        Ok(config)
    }
}

/// Parses a `<count>/<seconds>` rate-limit window. Empty string disables limiting.
pub fn parse_rate_limit_window(window: &str) -> Option<(u32, u64)> {
    if window.trim().is_empty() {
        return None;
    }
    let (count, secs) = window.split_once('/')?;
    let count: u32 = count.trim().parse().ok()?;
    let secs: u64 = secs.trim().parse().ok()?;
    if count == 0 || secs == 0 {
        return None;
    }
    Some((count, secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_window() {
        assert_eq!(parse_rate_limit_window("100/60"), Some((100, 60)));
    }

    #[test]
    fn empty_window_disables_limiting() {
        assert_eq!(parse_rate_limit_window(""), None);
    }

    #[test]
    fn malformed_window_disables_limiting() {
        assert_eq!(parse_rate_limit_window("not-a-window"), None);
        assert_eq!(parse_rate_limit_window("0/60"), None);
    }
}
