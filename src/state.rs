//! Process-wide application state: every service as an owned, `Arc`-wrapped
//! singleton constructed once at bootstrap (§9 redesign flag — the original wires
//! most of these as module-level globals reinitialized implicitly on first import,
//! which makes deterministic teardown in tests impossible).

use std::sync::Arc;

use crate::ai_provider::AiProvider;
use crate::call_invites::CallInviteService;
use crate::config::AppConfig;
use crate::external_store::ExternalStore;
use crate::friends_hub::FriendsHub;
use crate::message_log::MessageLog;
use crate::rate_limit::RateLimiter;
use crate::room_hub::RoomRegistry;
use crate::signal_bus::SignalBus;
use crate::summary::SummaryOrchestrator;
use crate::voice_collector::VoiceCollector;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub signal_bus: Arc<dyn SignalBus>,
    pub message_log: Arc<MessageLog>,
    pub voice_collector: Arc<VoiceCollector>,
    pub call_invites: Arc<dyn CallInviteService>,
    pub friends_hub: Arc<FriendsHub>,
    pub summary: Arc<SummaryOrchestrator>,
    pub external_store: Arc<dyn ExternalStore>,
    pub room_registry: Arc<RoomRegistry>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub ai_provider: Arc<dyn AiProvider>,
}
