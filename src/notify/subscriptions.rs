//! REST endpoints for push subscription management.
//! One row per (principal, endpoint) pair; rows are deactivated, never
//! deleted, so a "gone" signal from the provider cannot race a re-subscribe.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::db;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub key_p256dh: String,
    pub key_auth: String,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub id: String,
    pub endpoint: String,
    pub active: bool,
}

/// POST /api/push/subscriptions — register (or reactivate) a subscription.
pub async fn subscribe(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<SubscriptionView>), ApiError> {
    if body.endpoint.trim().is_empty() {
        return Err(ApiError::validation("endpoint is required"));
    }

    let user_id = claims.sub;
    let view = db::blocking(state.db.clone(), move |conn| {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO push_subscriptions (id, user_id, endpoint, key_p256dh, key_auth, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT(user_id, endpoint) DO UPDATE SET
                 key_p256dh = ?4, key_auth = ?5, active = 1",
            rusqlite::params![id, user_id, body.endpoint, body.key_p256dh, body.key_auth, now],
        )?;

        let (id, active): (String, i64) = conn.query_row(
            "SELECT id, active FROM push_subscriptions WHERE user_id = ?1 AND endpoint = ?2",
            rusqlite::params![user_id, body.endpoint],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(SubscriptionView {
            id,
            endpoint: body.endpoint,
            active: active != 0,
        })
    })
    .await?;

    Ok((StatusCode::CREATED, Json(view)))
}

/// DELETE /api/push/subscriptions — deactivate a subscription by endpoint.
pub async fn unsubscribe(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<UnsubscribeRequest>,
) -> Result<Json<SubscriptionView>, ApiError> {
    let user_id = claims.sub;
    let view = db::blocking(state.db.clone(), move |conn| {
        let id: String = conn
            .query_row(
                "SELECT id FROM push_subscriptions WHERE user_id = ?1 AND endpoint = ?2",
                rusqlite::params![user_id, body.endpoint],
                |row| row.get(0),
            )
            .map_err(|_| ApiError::not_found("subscription not found"))?;

        conn.execute(
            "UPDATE push_subscriptions SET active = 0 WHERE id = ?1",
            [&id],
        )?;

        Ok(SubscriptionView {
            id,
            endpoint: body.endpoint,
            active: false,
        })
    })
    .await?;

    Ok(Json(view))
}
