use std::sync::Arc;

use crate::calls::relay::RelayClient;
use crate::config::CallsConfig;
use crate::db::DbPool;
use crate::notify::Notifier;
use crate::presence::PresenceRegistry;
use crate::ws::rooms::RoomRouter;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Active WebSocket connections per user (process-local dispatch tier)
    pub connections: ConnectionRegistry,
    /// Per-conversation / per-user multicast groups
    pub rooms: Arc<RoomRouter>,
    /// Cross-process presence registry (shared DB tier + local cache)
    pub presence: PresenceRegistry,
    /// Realtime + push fan-out
    pub notifier: Notifier,
    /// Media relay provisioning and token minting
    pub relay: RelayClient,
    /// Call signaling tuning (ring timeout, sweep interval)
    pub calls_config: CallsConfig,
    /// This process's id in the presence registry
    pub process_id: String,
}
