use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

mod ai_provider;
mod api;
mod asr;
mod auth;
mod call_invites;
mod config;
mod error;
mod external_store;
mod friends_hub;
mod ids;
mod message_log;
mod model;
mod rate_limit;
mod room_hub;
mod signal_bus;
mod state;
mod summary;
mod voice_capture;
mod voice_collector;

use crate::ai_provider::build_provider;
use crate::call_invites::{CallInviteService, InMemoryCallInviteService, RedisCallInviteService};
use crate::config::{parse_rate_limit_window, AppConfig};
use crate::external_store::{ExternalStore, InMemoryExternalStore, SqlxExternalStore};
use crate::friends_hub::{FriendsHub, FriendsHubCallNotifier};
use crate::message_log::MessageLog;
use crate::rate_limit::RateLimiter;
use crate::room_hub::RoomRegistry;
use crate::signal_bus::{InProcessSignalBus, RedisSignalBus, SignalBus};
use crate::state::AppState;
use crate::summary::{SummaryOrchestrator, SummaryOrchestratorConfig};
use crate::voice_collector::VoiceCollector;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    match config.logging.format.as_str() {
        "json" => fmt().with_env_filter(filter).json().init(),
        _ => fmt().with_env_filter(filter).init(),
    }

    tracing::info!("starting webrelay-core v{}", env!("CARGO_PKG_VERSION"));

    let redis_client = if !config.redis.url.is_empty() {
        Some(redis::Client::open(config.redis.url.as_str())?)
    } else {
        tracing::warn!("redis not configured — signal bus and call invites stay in-process");
        None
    };

    let external_store: Arc<dyn ExternalStore> = if !config.database.url.is_empty() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await?;
        tracing::info!("database connected");
        Arc::new(SqlxExternalStore::new(pool))
    } else {
        tracing::warn!("database not configured — using in-memory external store");
        Arc::new(InMemoryExternalStore::new())
    };

    let signal_bus: Arc<dyn SignalBus> = match &redis_client {
        Some(client) => Arc::new(RedisSignalBus::new(client.clone())),
        None => Arc::new(InProcessSignalBus::new()),
    };

    let friends_hub = Arc::new(FriendsHub::new());
    let call_notifier = Arc::new(FriendsHubCallNotifier::new(friends_hub.clone()));

    let call_invites: Arc<dyn CallInviteService> = if config.call_invites.is_redis() {
        let client = redis_client
            .clone()
            .ok_or_else(|| anyhow::anyhow!("call_invites.backend = redis requires redis.url"))?;
        Arc::new(RedisCallInviteService::new(client, call_notifier, config.call_invites.ttl_secs))
    } else {
        Arc::new(InMemoryCallInviteService::new(call_notifier, config.call_invites.ttl_secs))
    };

    let ai_provider = build_provider(
        &config.ai_summary.model_provider,
        config.ai_summary.model_fallback.clone(),
        config.ai_summary.openai_api_key.clone(),
    );

    let message_log = Arc::new(MessageLog::new(config.ai_summary.max_messages_per_room));
    let voice_collector = Arc::new(VoiceCollector::new());

    let summary = Arc::new(SummaryOrchestrator::new(
        message_log.clone(),
        voice_collector.clone(),
        ai_provider.clone(),
        external_store.clone(),
        SummaryOrchestratorConfig {
            ai_enabled: config.ai_summary.enabled,
            min_chars: config.ai_summary.min_chars,
            participant_breakdown: config.ai_summary.participant_breakdown,
        },
    ));

    let rate_limiter = parse_rate_limit_window(&config.rate_limit.window).map(|(limit, window_secs)| {
        let limiter = match &redis_client {
            Some(client) => RateLimiter::redis(client.clone(), limit, window_secs),
            None => RateLimiter::in_process(limit, window_secs),
        };
        Arc::new(limiter)
    });

    let state = AppState {
        config: Arc::new(config.clone()),
        signal_bus,
        message_log,
        voice_collector,
        call_invites,
        friends_hub,
        summary,
        external_store,
        room_registry: Arc::new(RoomRegistry::new()),
        rate_limiter,
        ai_provider,
    };

    let app = api::build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("webrelay-core stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    tracing::info!("shutdown signal received");
}
