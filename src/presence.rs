//! Two-tier presence registry.
//!
//! The `presence` table is the cross-process source of truth: every server
//! process upserts its connections there, and `is_online` always consults it.
//! The DashMap is a process-local cache used only for fast local reads.
//! Entries carry a coarse 24h expiry so rows from crashed processes cannot
//! accumulate; a periodic sweep removes expired rows.

use axum::{extract::State, Json};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::auth::middleware::Claims;
use crate::db::{self, DbPool};
use crate::error::ApiError;
use crate::state::AppState;

/// Coarse TTL on registry entries, refreshed on every register.
const PRESENCE_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub connection_id: String,
    pub process_id: String,
    pub connected_at: String,
}

#[derive(Clone)]
pub struct PresenceRegistry {
    db: DbPool,
    cache: Arc<DashMap<String, PresenceEntry>>,
    process_id: String,
}

impl PresenceRegistry {
    pub fn new(db: DbPool, process_id: String) -> Self {
        Self {
            db,
            cache: Arc::new(DashMap::new()),
            process_id,
        }
    }

    /// Idempotent upsert; last write wins across concurrent connections of
    /// the same principal. Refreshes the entry's 24h expiry.
    pub async fn register(&self, user_id: &str, connection_id: &str) -> Result<(), ApiError> {
        let now = Utc::now();
        let entry = PresenceEntry {
            connection_id: connection_id.to_string(),
            process_id: self.process_id.clone(),
            connected_at: now.to_rfc3339(),
        };
        self.cache.insert(user_id.to_string(), entry.clone());

        let uid = user_id.to_string();
        let expires_at = (now + Duration::hours(PRESENCE_TTL_HOURS)).to_rfc3339();
        db::blocking(self.db.clone(), move |conn| {
            conn.execute(
                "INSERT INTO presence (user_id, connection_id, process_id, connected_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                     connection_id = ?2, process_id = ?3, connected_at = ?4, expires_at = ?5",
                rusqlite::params![
                    uid,
                    entry.connection_id,
                    entry.process_id,
                    entry.connected_at,
                    expires_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Remove the registry entry on graceful disconnect.
    pub async fn unregister(&self, user_id: &str) -> Result<(), ApiError> {
        self.cache.remove(user_id);

        let uid = user_id.to_string();
        db::blocking(self.db.clone(), move |conn| {
            conn.execute("DELETE FROM presence WHERE user_id = ?1", [uid])?;
            Ok(())
        })
        .await
    }

    /// Cross-process online check: consults the shared tier, never only the
    /// local cache.
    pub async fn is_online(&self, user_id: &str) -> Result<bool, ApiError> {
        let uid = user_id.to_string();
        let now = Utc::now().to_rfc3339();
        db::blocking(self.db.clone(), move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM presence WHERE user_id = ?1 AND expires_at > ?2",
                rusqlite::params![uid, now],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    /// All principals with a live registry entry, across processes.
    pub async fn list_online(&self) -> Result<Vec<String>, ApiError> {
        let now = Utc::now().to_rfc3339();
        db::blocking(self.db.clone(), move |conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM presence WHERE expires_at > ?1 ORDER BY user_id")?;
            let ids = stmt
                .query_map([now], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(ids)
        })
        .await
    }

    /// Drop expired rows left behind by crashed processes.
    pub async fn sweep_expired(&self) -> Result<usize, ApiError> {
        let now = Utc::now().to_rfc3339();
        db::blocking(self.db.clone(), move |conn| {
            let removed = conn.execute("DELETE FROM presence WHERE expires_at <= ?1", [now])?;
            Ok(removed)
        })
        .await
    }

    /// Fast local-tier lookup. Dispatch optimization only — never the basis
    /// for a cross-process decision.
    pub fn local_entry(&self, user_id: &str) -> Option<PresenceEntry> {
        self.cache.get(user_id).map(|e| e.value().clone())
    }
}

/// GET /api/presence/online — principals with a live registry entry.
pub async fn list_online(
    State(state): State<AppState>,
    _claims: Claims,
) -> Result<Json<Vec<String>>, ApiError> {
    let ids = state.presence.list_online().await?;
    Ok(Json(ids))
}
