//! Best-effort notification fan-out.
//!
//! By the time fan-out runs, the triggering mutation has already committed,
//! so nothing here may fail the request that caused it. Realtime delivery is
//! a synchronous serialize-and-enqueue onto each connection's writer channel,
//! so events for one room leave in emission order; only push delivery, which
//! does real I/O, runs on a detached task.

pub mod push;
pub mod subscriptions;

use std::sync::Arc;

use crate::db::DbPool;
use crate::notify::push::PushSender;
use crate::ws::events::ServerEvent;
use crate::ws::rooms::{self, RoomRouter};
use crate::ws::{self, ConnectionRegistry};

#[derive(Clone)]
pub struct Notifier {
    db: DbPool,
    rooms: Arc<RoomRouter>,
    connections: ConnectionRegistry,
    push: PushSender,
}

impl Notifier {
    pub fn new(
        db: DbPool,
        rooms: Arc<RoomRouter>,
        connections: ConnectionRegistry,
        push: PushSender,
    ) -> Self {
        Self {
            db,
            rooms,
            connections,
            push,
        }
    }

    /// Realtime fan-out to everyone joined to a conversation's room.
    pub fn to_conversation(&self, conversation_id: &str, event: ServerEvent) {
        let room = rooms::conversation_room(conversation_id);
        self.rooms.broadcast(&room, &event, None);
    }

    /// Realtime fan-out to a principal's personal room.
    pub fn to_user(&self, user_id: &str, event: ServerEvent) {
        let room = rooms::user_room(user_id);
        self.rooms.broadcast(&room, &event, None);
    }

    /// Broadcast to every connection on this process (presence offline signal).
    pub fn broadcast_all(&self, event: ServerEvent) {
        if let Some(payload) = event.to_json() {
            ws::broadcast_to_all(&self.connections, &payload);
        }
    }

    /// Push delivery, attempted unconditionally for call-ringing and
    /// new-message events — realtime delivery to a backgrounded mobile
    /// client is unreliable regardless of apparent online status.
    pub fn push_to_user(&self, user_id: &str, title: &str, body: &str, payload: serde_json::Value) {
        let db = self.db.clone();
        let sender = self.push.clone();
        let user_id = user_id.to_string();
        let title = title.to_string();
        let body = body.to_string();
        tokio::spawn(async move {
            push::push_to_user(db, sender, user_id, title, body, payload).await;
        });
    }
}
