//! Room router: named multicast groups for event fan-out.
//!
//! Each conversation has a `conversation:{id}` room; each principal has a
//! `user:{id}` personal room joined at connect. Membership is per-connection,
//! so a room naturally empties as its connections drop. All emission for a
//! room goes through `broadcast`, which serializes the event once — within a
//! room, delivery order matches emission order.

use dashmap::DashMap;
use std::collections::HashMap;

use crate::ws::events::ServerEvent;
use crate::ws::{ConnId, ConnectionSender};

/// Room name for a principal's personal broadcast channel.
pub fn user_room(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Room name for a conversation's multicast group.
pub fn conversation_room(conversation_id: &str) -> String {
    format!("conversation:{}", conversation_id)
}

#[derive(Debug, Default)]
pub struct RoomRouter {
    /// room name -> (connection id -> sender)
    rooms: DashMap<String, HashMap<ConnId, ConnectionSender>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent join: overwriting an existing membership is harmless.
    pub fn join(&self, room: &str, conn_id: ConnId, sender: ConnectionSender) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn_id, sender);
    }

    pub fn leave(&self, room: &str, conn_id: ConnId) {
        if let Some(mut entry) = self.rooms.get_mut(room) {
            entry.value_mut().remove(&conn_id);
            if entry.value().is_empty() {
                drop(entry);
                self.rooms.remove(room);
            }
        }
    }

    /// Remove a connection from every room it joined (disconnect path).
    pub fn leave_all(&self, conn_id: ConnId) {
        let room_names: Vec<String> = self.rooms.iter().map(|e| e.key().clone()).collect();
        for room in room_names {
            self.leave(&room, conn_id);
        }
    }

    /// Number of connections currently joined to a room.
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|e| e.value().len()).unwrap_or(0)
    }

    /// Broadcast an event to every connection in a room, optionally excluding
    /// the emitting connection (typing indicators, optimistic echoes).
    pub fn broadcast(&self, room: &str, event: &ServerEvent, except: Option<ConnId>) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(room = %room, error = %e, "failed to serialize event");
                return;
            }
        };
        let msg = axum::extract::ws::Message::Text(payload.into());

        if let Some(entry) = self.rooms.get(room) {
            for (conn_id, sender) in entry.value().iter() {
                if Some(*conn_id) == except {
                    continue;
                }
                let _ = sender.send(msg.clone());
            }
        }
    }
}
