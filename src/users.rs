//! Minimal principal and follow-edge surface.
//!
//! Profiles, feeds, and the rest of the social graph live in an external
//! service; the chat core only needs principals to exist and the follow
//! relationship that drives chat-request status derivation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::auth::jwt;
use crate::db;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub display_name: String,
}

#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: String,
    pub display_name: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    pub user: UserView,
    /// Bearer credential for subsequent requests. Real deployments mint this
    /// through the platform's auth service; the core only validates it.
    pub access_token: String,
}

/// POST /api/users — create a principal and mint an access token.
pub async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<CreateUserResponse>), ApiError> {
    let display_name = body.display_name.trim().to_string();
    if display_name.is_empty() {
        return Err(ApiError::validation("display_name is required"));
    }

    let user = db::blocking(state.db.clone(), move |conn| {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, display_name, now],
        )?;
        Ok(UserView {
            id,
            display_name,
            created_at: now,
        })
    })
    .await?;

    let access_token = jwt::issue_access_token(&state.jwt_secret, &user.id)
        .map_err(|_| ApiError::Internal)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse { user, access_token }),
    ))
}

#[derive(Debug, Serialize)]
pub struct FollowView {
    pub follower_id: String,
    pub followee_id: String,
    pub following: bool,
}

/// POST /api/users/{id}/follow — follow a principal. Idempotent.
pub async fn follow(
    State(state): State<AppState>,
    claims: Claims,
    Path(followee_id): Path<String>,
) -> Result<Json<FollowView>, ApiError> {
    let follower_id = claims.sub;
    if follower_id == followee_id {
        return Err(ApiError::validation("cannot follow yourself"));
    }

    let view = db::blocking(state.db.clone(), move |conn| {
        ensure_user_exists(conn, &followee_id)?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO follows (follower_id, followee_id, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![follower_id, followee_id, now],
        )?;
        Ok(FollowView {
            follower_id,
            followee_id,
            following: true,
        })
    })
    .await?;

    Ok(Json(view))
}

/// DELETE /api/users/{id}/follow — unfollow a principal. Idempotent.
pub async fn unfollow(
    State(state): State<AppState>,
    claims: Claims,
    Path(followee_id): Path<String>,
) -> Result<Json<FollowView>, ApiError> {
    let follower_id = claims.sub;

    let view = db::blocking(state.db.clone(), move |conn| {
        conn.execute(
            "DELETE FROM follows WHERE follower_id = ?1 AND followee_id = ?2",
            rusqlite::params![follower_id, followee_id],
        )?;
        Ok(FollowView {
            follower_id,
            followee_id,
            following: false,
        })
    })
    .await?;

    Ok(Json(view))
}

/// Whether `follower` currently follows `followee`.
pub fn follows(
    conn: &rusqlite::Connection,
    follower: &str,
    followee: &str,
) -> Result<bool, ApiError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM follows WHERE follower_id = ?1 AND followee_id = ?2",
        rusqlite::params![follower, followee],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn ensure_user_exists(conn: &rusqlite::Connection, user_id: &str) -> Result<(), ApiError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE id = ?1",
        [user_id],
        |row| row.get(0),
    )?;
    if count == 0 {
        return Err(ApiError::not_found("user not found"));
    }
    Ok(())
}
