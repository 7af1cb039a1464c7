//! WebSocket endpoint. Browsers cannot set headers on the upgrade request,
//! so the access token rides in a query parameter. Auth failures close the
//! socket with an application close code instead of an HTTP error: 4001 for
//! an expired token (client should refresh and reconnect), 4002 for anything
//! else.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;

use crate::auth::jwt;
use crate::state::AppState;
use crate::ws::actor;

pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
pub const CLOSE_TOKEN_INVALID: u16 = 4002;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /ws?token=<access token>
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let Some(token) = token else {
        close_with(socket, CLOSE_TOKEN_INVALID, "missing token").await;
        return;
    };

    match jwt::validate_access_token(&state.jwt_secret, &token) {
        Ok(claims) => actor::run_connection(socket, state, claims.sub).await,
        Err(e) => {
            let (code, reason) = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    (CLOSE_TOKEN_EXPIRED, "token expired")
                }
                _ => (CLOSE_TOKEN_INVALID, "invalid token"),
            };
            close_with(socket, code, reason).await;
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
