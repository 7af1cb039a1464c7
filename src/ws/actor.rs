//! One task per WebSocket connection.
//!
//! The socket is split: a dedicated writer task drains an unbounded channel,
//! and every other component holds only the channel's sender. The reader
//! loop owns the receive half, answers pings, and dispatches client frames.
//! Teardown runs when the reader loop exits for any reason; the offline
//! side effects (presence removal, call reaping, offline broadcast) fire
//! only when the principal's *last* connection drops.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::calls::lifecycle;
use crate::db::{self};
use crate::state::AppState;
use crate::ws::events::ServerEvent;
use crate::ws::{self, protocol, rooms};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Conversations auto-joined at connect; anything beyond this arrives via
/// explicit join_room frames.
const AUTO_JOIN_LIMIT: u32 = 50;

pub async fn run_connection(socket: WebSocket, state: AppState, user_id: String) {
    let conn_id = ws::next_conn_id();
    tracing::info!(user = %user_id, conn = conn_id, "websocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    state
        .connections
        .entry(user_id.clone())
        .or_default()
        .push(tx.clone());

    if let Err(e) = state.presence.register(&user_id, &conn_id.to_string()).await {
        tracing::warn!(user = %user_id, error = %e, "presence registration failed");
    }

    state
        .rooms
        .join(&rooms::user_room(&user_id), conn_id, tx.clone());

    // Join the recent conversations in the background so connect stays fast.
    let auto_join = {
        let state = state.clone();
        let user_id = user_id.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let uid = user_id.clone();
            let ids = db::blocking(state.db.clone(), move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.id FROM conversations c
                     JOIN conversation_participants p ON p.conversation_id = c.id
                     WHERE p.user_id = ?1 AND c.status != 'declined'
                     ORDER BY CASE WHEN c.last_message_at IS NULL THEN 1 ELSE 0 END,
                              c.last_message_at DESC,
                              c.created_at DESC
                     LIMIT ?2",
                )?;
                let ids: Vec<String> = stmt
                    .query_map(rusqlite::params![uid, AUTO_JOIN_LIMIT], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(ids)
            })
            .await;
            match ids {
                Ok(ids) => {
                    for id in ids {
                        state
                            .rooms
                            .join(&rooms::conversation_room(&id), conn_id, tx.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(user = %user_id, error = %e, "auto-join failed");
                }
            }
        })
    };

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick fires immediately; skip it so the pong deadline is fair.
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > PING_INTERVAL + PONG_TIMEOUT {
                    tracing::debug!(user = %user_id, conn = conn_id, "pong timeout");
                    break;
                }
                if tx.send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        protocol::handle_client_event(&state, &user_id, conn_id, &tx, text.as_str())
                            .await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = tx.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        tracing::debug!(user = %user_id, conn = conn_id, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    auto_join.abort();
    state.rooms.leave_all(conn_id);

    let last_connection = {
        let mut last = false;
        if let Some(mut entry) = state.connections.get_mut(&user_id) {
            entry.value_mut().retain(|s| !s.same_channel(&tx));
            last = entry.value().is_empty();
        }
        if last {
            state.connections.remove(&user_id);
        }
        last
    };
    drop(tx);
    writer.abort();

    tracing::info!(user = %user_id, conn = conn_id, last = last_connection, "websocket disconnected");

    if last_connection {
        if let Err(e) = state.presence.unregister(&user_id).await {
            tracing::warn!(user = %user_id, error = %e, "presence removal failed");
        }
        lifecycle::reap_user_calls(&state, &user_id).await;
        state.notifier.broadcast_all(ServerEvent::PresenceOffline {
            user_id: user_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
        });
    }
}
