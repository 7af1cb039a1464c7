pub mod actor;
pub mod events;
pub mod handler;
pub mod protocol;
pub mod rooms;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Connection registry: tracks all active WebSocket connections per user.
/// A user can have multiple concurrent connections (multiple devices/tabs).
/// This is the process-local dispatch tier; the cross-process source of truth
/// for "is this principal online" is the presence registry.
pub type ConnectionRegistry = Arc<DashMap<String, Vec<ConnectionSender>>>;

/// Create a new empty connection registry.
pub fn new_connection_registry() -> ConnectionRegistry {
    Arc::new(DashMap::new())
}

/// Process-unique connection id, used as the room-membership key.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Send a serialized event to all of a user's connections.
pub fn send_to_user(registry: &ConnectionRegistry, user_id: &str, payload: &str) {
    let msg = axum::extract::ws::Message::Text(payload.to_string().into());
    if let Some(connections) = registry.get(user_id) {
        for sender in connections.value().iter() {
            let _ = sender.send(msg.clone());
        }
    }
}

/// Broadcast a serialized event to every connection on this process.
pub fn broadcast_to_all(registry: &ConnectionRegistry, payload: &str) {
    let msg = axum::extract::ws::Message::Text(payload.to_string().into());
    for entry in registry.iter() {
        for sender in entry.value().iter() {
            let _ = sender.send(msg.clone());
        }
    }
}
