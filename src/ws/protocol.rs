//! Client → server events arriving over the socket.
//!
//! Everything authoritative flows through the HTTP API; the socket only
//! carries room management, typing indicators, optimistic echoes, and unread
//! refresh requests. Malformed frames are logged and dropped — a chat client
//! with a stale build must not be able to kill its own connection.

use serde::Deserialize;

use crate::chat::conversations::ensure_participant;
use crate::chat::messages::unread_counts_for_user;
use crate::db::{self};
use crate::state::AppState;
use crate::ws::events::ServerEvent;
use crate::ws::rooms;
use crate::ws::{ConnId, ConnectionSender};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom {
        conversation_id: String,
    },
    LeaveRoom {
        conversation_id: String,
    },
    TypingStart {
        conversation_id: String,
    },
    TypingStop {
        conversation_id: String,
    },
    EchoMessage {
        conversation_id: String,
        payload: serde_json::Value,
    },
    EchoRead {
        conversation_id: String,
        payload: serde_json::Value,
    },
    EchoDelete {
        conversation_id: String,
        payload: serde_json::Value,
    },
    RequestUnreadCounts,
}

pub async fn handle_client_event(
    state: &AppState,
    user_id: &str,
    conn_id: ConnId,
    sender: &ConnectionSender,
    text: &str,
) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(user = %user_id, error = %e, "dropping malformed client frame");
            return;
        }
    };

    match event {
        ClientEvent::JoinRoom { conversation_id } => {
            if !verify_participant(state, &conversation_id, user_id).await {
                tracing::debug!(user = %user_id, conversation = %conversation_id,
                    "join refused: not a participant");
                return;
            }
            state
                .rooms
                .join(&rooms::conversation_room(&conversation_id), conn_id, sender.clone());
        }
        ClientEvent::LeaveRoom { conversation_id } => {
            state
                .rooms
                .leave(&rooms::conversation_room(&conversation_id), conn_id);
        }
        ClientEvent::TypingStart { conversation_id } => {
            state.rooms.broadcast(
                &rooms::conversation_room(&conversation_id),
                &ServerEvent::TypingStart {
                    conversation_id,
                    user_id: user_id.to_string(),
                },
                Some(conn_id),
            );
        }
        ClientEvent::TypingStop { conversation_id } => {
            state.rooms.broadcast(
                &rooms::conversation_room(&conversation_id),
                &ServerEvent::TypingStop {
                    conversation_id,
                    user_id: user_id.to_string(),
                },
                Some(conn_id),
            );
        }
        ClientEvent::EchoMessage {
            conversation_id,
            payload,
        } => {
            state.rooms.broadcast(
                &rooms::conversation_room(&conversation_id),
                &ServerEvent::EchoMessage {
                    conversation_id,
                    sender_id: user_id.to_string(),
                    payload,
                },
                Some(conn_id),
            );
        }
        ClientEvent::EchoRead {
            conversation_id,
            payload,
        } => {
            state.rooms.broadcast(
                &rooms::conversation_room(&conversation_id),
                &ServerEvent::EchoRead {
                    conversation_id,
                    sender_id: user_id.to_string(),
                    payload,
                },
                Some(conn_id),
            );
        }
        ClientEvent::EchoDelete {
            conversation_id,
            payload,
        } => {
            state.rooms.broadcast(
                &rooms::conversation_room(&conversation_id),
                &ServerEvent::EchoDelete {
                    conversation_id,
                    sender_id: user_id.to_string(),
                    payload,
                },
                Some(conn_id),
            );
        }
        ClientEvent::RequestUnreadCounts => {
            let uid = user_id.to_string();
            let counts =
                db::blocking(state.db.clone(), move |conn| unread_counts_for_user(conn, &uid))
                    .await;
            match counts {
                Ok(counts) => {
                    // Only the requesting connection gets the refresh.
                    if let Some(payload) = (ServerEvent::UnreadCounts { counts }).to_json() {
                        let _ = sender.send(axum::extract::ws::Message::Text(payload.into()));
                    }
                }
                Err(e) => {
                    tracing::warn!(user = %user_id, error = %e, "failed to compute unread counts");
                }
            }
        }
    }
}

async fn verify_participant(state: &AppState, conversation_id: &str, user_id: &str) -> bool {
    let conv_id = conversation_id.to_string();
    let uid = user_id.to_string();
    db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conv_id, &uid)
    })
    .await
    .is_ok()
}
