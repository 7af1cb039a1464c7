//! Call signaling state machine.
//!
//! initiated → ringing → connecting → active → ended
//! with declined / missed / failed as alternative terminal states.
//!
//! Every transition runs in an immediate transaction that re-reads the row
//! and re-validates the transition, so two racing requests serialize and the
//! loser sees the state the winner left behind. Transitions against a call
//! that is already terminal are idempotent: the current record is returned
//! unchanged instead of erroring, because ends, declines, and sweeps race
//! with each other by design.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::chat::conversations;
use crate::db::models::{rfc3339_to_millis, CallMedia, CallRow, CallStatus, ChatKind, ChatStatus};
use crate::db::{self};
use crate::error::ApiError;
use crate::pagination::{PageQuery, Paginated};
use crate::state::AppState;
use crate::ws::events::ServerEvent;

use super::relay::RelayAccess;

#[derive(Debug, Clone, Serialize)]
pub struct CallView {
    pub id: String,
    pub conversation_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub media: CallMedia,
    pub status: CallStatus,
    pub initiated_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub duration_seconds: i64,
    pub end_reason: Option<String>,
    pub ended_by: Option<String>,
    /// Relay credentials for the receiving principal; absent when the relay
    /// is not configured or the session could not be provisioned.
    pub relay: Option<RelayAccess>,
}

impl CallView {
    pub fn from_row(row: &CallRow, relay: Option<RelayAccess>) -> Self {
        Self {
            id: row.id.clone(),
            conversation_id: row.conversation_id.clone(),
            caller_id: row.caller_id.clone(),
            callee_id: row.callee_id.clone(),
            media: row.media,
            status: row.status,
            initiated_at: rfc3339_to_millis(&row.initiated_at),
            started_at: row.started_at.as_deref().map(rfc3339_to_millis),
            ended_at: row.ended_at.as_deref().map(rfc3339_to_millis),
            duration_seconds: row.duration_seconds(),
            end_reason: row.end_reason.clone(),
            ended_by: row.ended_by.clone(),
            relay,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InitiateCallRequest {
    pub conversation_id: String,
    pub media: String,
}

#[derive(Debug, Deserialize)]
pub struct EndCallRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

// --- Handlers ---

/// POST /api/calls — ring the other participant of a direct conversation.
///
/// A principal already in a live call cannot start or receive another one;
/// the conflict response carries the id of the call that won.
pub async fn initiate_call(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<InitiateCallRequest>,
) -> Result<(StatusCode, Json<CallView>), ApiError> {
    let media = CallMedia::from_str(&body.media)
        .ok_or_else(|| ApiError::validation("media must be voice or video"))?;

    let me = claims.sub.clone();
    let conv_id = body.conversation_id.clone();
    let row = db::blocking(state.db.clone(), move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        conversations::ensure_participant(&tx, &conv_id, &me)?;
        let conv = conversations::get_conversation_row(&tx, &conv_id)?;
        if conv.kind != ChatKind::Direct {
            return Err(ApiError::validation("calls are only available in direct conversations"));
        }
        if conv.status != ChatStatus::Active {
            return Err(ApiError::forbidden("the conversation must be active to start a call"));
        }

        let callee: String = tx.query_row(
            "SELECT user_id FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id != ?2",
            rusqlite::params![conv_id, me],
            |r| r.get(0),
        )?;

        // Either participant already in any live call blocks the new one.
        let busy: Option<String> = tx
            .query_row(
                "SELECT id FROM calls
                 WHERE status IN ('initiated', 'ringing', 'connecting', 'active')
                   AND (caller_id IN (?1, ?2) OR callee_id IN (?1, ?2))
                 ORDER BY initiated_at DESC LIMIT 1",
                rusqlite::params![me, callee],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(ApiError::from(other)),
            })?;
        if let Some(existing) = busy {
            return Err(ApiError::conflict(
                "a participant is already in a call",
                Some(existing),
            ));
        }

        let call_id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO calls (id, conversation_id, caller_id, callee_id, media, status, initiated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'initiated', ?6)",
            rusqlite::params![call_id, conv_id, me, callee, media.as_str(), now],
        )?;
        tx.commit()?;

        load_call(conn, &call_id)
    })
    .await?;

    // Ring once the row exists; skipped harmlessly if something already moved
    // the call past initiated. The call was created either way, so a failure
    // here must not fail the request.
    let call_id = row.id.clone();
    let row = match db::blocking(state.db.clone(), move |conn| {
        conn.execute(
            "UPDATE calls SET status = 'ringing' WHERE id = ?1 AND status = 'initiated'",
            [&call_id],
        )?;
        load_call(conn, &call_id)
    })
    .await
    {
        Ok(updated) => updated,
        Err(e) => {
            tracing::warn!(call = %row.id, error = %e, "failed to mark call ringing");
            row
        }
    };

    // Relay provisioning is best effort; without it clients stay in
    // signaling-only mode.
    let session_id = if state.relay.enabled() {
        match state
            .relay
            .provision_session(
                &row.id,
                &[row.caller_id.as_str(), row.callee_id.as_str()],
                row.media == CallMedia::Video,
            )
            .await
        {
            Ok(session) => {
                let call_id = row.id.clone();
                let session2 = session.clone();
                let stored = db::blocking(state.db.clone(), move |conn| {
                    conn.execute(
                        "UPDATE calls SET relay_session_id = ?1 WHERE id = ?2",
                        rusqlite::params![session2, call_id],
                    )?;
                    Ok(())
                })
                .await;
                if let Err(e) = stored {
                    tracing::warn!(call = %row.id, error = %e, "failed to store relay session id");
                }
                Some(session)
            }
            Err(e) => {
                tracing::warn!(call = %row.id, error = %e, "relay provisioning failed");
                None
            }
        }
    } else {
        None
    };

    let callee_access = session_id
        .as_deref()
        .and_then(|s| state.relay.mint_token(s, &row.callee_id));
    let caller_access = session_id
        .as_deref()
        .and_then(|s| state.relay.mint_token(s, &row.caller_id));

    state.notifier.to_user(
        &row.callee_id,
        ServerEvent::IncomingCall {
            call: CallView::from_row(&row, callee_access),
        },
    );
    state.notifier.push_to_user(
        &row.callee_id,
        "Incoming call",
        &format!("{} call", row.media.as_str()),
        serde_json::json!({
            "kind": "call",
            "call_id": row.id,
            "conversation_id": row.conversation_id,
            "media": row.media.as_str(),
        }),
    );

    Ok((
        StatusCode::CREATED,
        Json(CallView::from_row(&row, caller_access)),
    ))
}

/// POST /api/calls/{id}/accept — answer a ringing call. Repeating an accept
/// returns the current record with freshly minted relay credentials.
pub async fn accept_call(
    State(state): State<AppState>,
    claims: Claims,
    Path(call_id): Path<String>,
) -> Result<Json<CallView>, ApiError> {
    let me = claims.sub.clone();
    let cid = call_id.clone();
    let (row, changed) = db::blocking(state.db.clone(), move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = load_call(&tx, &cid)?;
        if !row.is_participant(&me) {
            return Err(ApiError::forbidden("not a participant in this call"));
        }

        let changed = match row.status {
            CallStatus::Initiated | CallStatus::Ringing => {
                let now = Utc::now().to_rfc3339();
                tx.execute(
                    "UPDATE calls SET status = 'connecting', started_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, cid],
                )?;
                true
            }
            // Already accepted (possibly from another device) or already over.
            _ => false,
        };

        let row = load_call(&tx, &cid)?;
        tx.commit()?;
        Ok((row, changed))
    })
    .await?;

    // Tokens are re-minted on every accept so their lifetime starts now.
    let mint = |user_id: &str| {
        row.relay_session_id
            .as_deref()
            .and_then(|s| state.relay.mint_token(s, user_id))
    };

    if changed {
        state.notifier.to_user(
            &row.caller_id,
            ServerEvent::CallAccepted {
                call: CallView::from_row(&row, mint(&row.caller_id)),
            },
        );
        state.notifier.to_user(
            &row.callee_id,
            ServerEvent::CallAccepted {
                call: CallView::from_row(&row, mint(&row.callee_id)),
            },
        );
    }

    let my_access = mint(&claims.sub);
    Ok(Json(CallView::from_row(&row, my_access)))
}

/// POST /api/calls/{id}/decline — refuse a ringing call. Declining a call
/// that already connected is a conflict; declining one that already ended
/// is a no-op.
pub async fn decline_call(
    State(state): State<AppState>,
    claims: Claims,
    Path(call_id): Path<String>,
) -> Result<Json<CallView>, ApiError> {
    let me = claims.sub.clone();
    let cid = call_id.clone();
    let (row, changed) = db::blocking(state.db.clone(), move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = load_call(&tx, &cid)?;
        if !row.is_participant(&me) {
            return Err(ApiError::forbidden("not a participant in this call"));
        }

        let changed = match row.status {
            CallStatus::Initiated | CallStatus::Ringing => {
                let now = Utc::now().to_rfc3339();
                tx.execute(
                    "UPDATE calls SET status = 'declined', ended_at = ?1,
                         end_reason = 'declined', ended_by = ?2
                     WHERE id = ?3",
                    rusqlite::params![now, me, cid],
                )?;
                true
            }
            status if status.is_terminal() => false,
            _ => {
                return Err(ApiError::conflict(
                    "the call has already connected",
                    None,
                ));
            }
        };

        let row = load_call(&tx, &cid)?;
        tx.commit()?;
        Ok((row, changed))
    })
    .await?;

    if changed {
        notify_both(&state, &row, |call| ServerEvent::CallDeclined { call });
    }

    Ok(Json(CallView::from_row(&row, None)))
}

/// POST /api/calls/{id}/end — hang up from any live state. Ending an already
/// terminal call returns it unchanged.
pub async fn end_call(
    State(state): State<AppState>,
    claims: Claims,
    Path(call_id): Path<String>,
    body: Option<Json<EndCallRequest>>,
) -> Result<Json<CallView>, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "normal".to_string());

    let me = claims.sub.clone();
    let cid = call_id.clone();
    let (row, changed) = db::blocking(state.db.clone(), move |conn| {
        end_call_tx(conn, &cid, &me, &reason, true)
    })
    .await?;

    if changed {
        notify_both(&state, &row, |call| ServerEvent::CallEnded { call });
    }

    Ok(Json(CallView::from_row(&row, None)))
}

/// POST /api/calls/{id}/status — client-driven media-setup progress.
/// Only initiated/ringing → connecting and connecting → active are accepted.
pub async fn update_call_status(
    State(state): State<AppState>,
    claims: Claims,
    Path(call_id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Json<CallView>, ApiError> {
    let target = CallStatus::from_str(&body.status)
        .filter(|s| matches!(s, CallStatus::Connecting | CallStatus::Active))
        .ok_or_else(|| ApiError::validation("status must be connecting or active"))?;

    let me = claims.sub.clone();
    let cid = call_id.clone();
    let (row, changed) = db::blocking(state.db.clone(), move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = load_call(&tx, &cid)?;
        if !row.is_participant(&me) {
            return Err(ApiError::forbidden("not a participant in this call"));
        }

        let changed = match (row.status, target) {
            (CallStatus::Initiated | CallStatus::Ringing, CallStatus::Connecting) => {
                let now = Utc::now().to_rfc3339();
                tx.execute(
                    "UPDATE calls SET status = 'connecting',
                         started_at = COALESCE(started_at, ?1)
                     WHERE id = ?2",
                    rusqlite::params![now, cid],
                )?;
                true
            }
            (CallStatus::Connecting, CallStatus::Active) => {
                tx.execute("UPDATE calls SET status = 'active' WHERE id = ?1", [&cid])?;
                true
            }
            // Already there, or a stale report after the call moved on.
            (current, wanted) if current == wanted => false,
            (current, _) if current.is_terminal() => false,
            (current, wanted) => {
                return Err(ApiError::conflict(
                    format!("cannot move a {} call to {}", current.as_str(), wanted.as_str()),
                    None,
                ));
            }
        };

        let row = load_call(&tx, &cid)?;
        tx.commit()?;
        Ok((row, changed))
    })
    .await?;

    if changed {
        notify_both(&state, &row, |call| ServerEvent::CallStatus { call });
    }

    Ok(Json(CallView::from_row(&row, None)))
}

/// GET /api/calls/active — the caller's live call, if any.
pub async fn get_active_call(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Option<CallView>>, ApiError> {
    let me = claims.sub;
    let row = db::blocking(state.db.clone(), move |conn| {
        conn.query_row(
            &format!(
                "SELECT {} FROM calls
                 WHERE status IN ('initiated', 'ringing', 'connecting', 'active')
                   AND (caller_id = ?1 OR callee_id = ?1)
                 ORDER BY initiated_at DESC LIMIT 1",
                CallRow::COLUMNS
            ),
            [&me],
            CallRow::from_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(ApiError::from(other)),
        })
    })
    .await?;

    Ok(Json(row.map(|r| CallView::from_row(&r, None))))
}

/// GET /api/calls/history — the caller's finished calls, newest first.
pub async fn get_call_history(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<CallView>>, ApiError> {
    let me = claims.sub;
    let (page, limit, offset) = (query.page(), query.limit(), query.offset());

    let result = db::blocking(state.db.clone(), move |conn| {
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM calls
             WHERE status IN ('ended', 'declined', 'missed', 'failed')
               AND (caller_id = ?1 OR callee_id = ?1)",
            [&me],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM calls
             WHERE status IN ('ended', 'declined', 'missed', 'failed')
               AND (caller_id = ?1 OR callee_id = ?1)
             ORDER BY initiated_at DESC LIMIT ?2 OFFSET ?3",
            CallRow::COLUMNS
        ))?;
        let items = stmt
            .query_map(rusqlite::params![me, limit, offset], CallRow::from_row)?
            .filter_map(|r| r.ok())
            .map(|row| CallView::from_row(&row, None))
            .collect();

        Ok(Paginated::new(items, page, limit, total as u64))
    })
    .await?;

    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct CallStats {
    pub total_calls: i64,
    pub completed_calls: i64,
    pub missed_calls: i64,
    pub declined_calls: i64,
    pub total_duration_seconds: i64,
}

/// GET /api/calls/stats — aggregate counters over the caller's call history.
pub async fn get_call_stats(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<CallStats>, ApiError> {
    let me = claims.sub;
    let stats = db::blocking(state.db.clone(), move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM calls WHERE caller_id = ?1 OR callee_id = ?1",
            CallRow::COLUMNS
        ))?;
        let rows: Vec<CallRow> = stmt
            .query_map([&me], CallRow::from_row)?
            .filter_map(|r| r.ok())
            .collect();

        let mut stats = CallStats {
            total_calls: rows.len() as i64,
            completed_calls: 0,
            missed_calls: 0,
            declined_calls: 0,
            total_duration_seconds: 0,
        };
        for row in &rows {
            match row.status {
                CallStatus::Ended => {
                    stats.completed_calls += 1;
                    stats.total_duration_seconds += row.duration_seconds();
                }
                CallStatus::Missed => stats.missed_calls += 1,
                CallStatus::Declined => stats.declined_calls += 1,
                _ => {}
            }
        }
        Ok(stats)
    })
    .await?;

    Ok(Json(stats))
}

// --- Background transitions ---

/// Force-end every live call a principal participates in. Runs when their
/// last connection drops.
pub async fn reap_user_calls(state: &AppState, user_id: &str) {
    let me = user_id.to_string();
    let ids = db::blocking(state.db.clone(), move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id FROM calls
             WHERE status IN ('initiated', 'ringing', 'connecting', 'active')
               AND (caller_id = ?1 OR callee_id = ?1)",
        )?;
        let ids: Vec<String> = stmt
            .query_map([&me], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    })
    .await;

    let ids = match ids {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(user = %user_id, error = %e, "failed to list live calls for reaping");
            return;
        }
    };

    for call_id in ids {
        let me = user_id.to_string();
        let cid = call_id.clone();
        let result = db::blocking(state.db.clone(), move |conn| {
            end_call_tx(conn, &cid, &me, "network error", false)
        })
        .await;
        match result {
            Ok((row, true)) => {
                tracing::info!(call = %row.id, user = %user_id, "ended call after disconnect");
                notify_both(state, &row, |call| ServerEvent::CallEnded { call });
            }
            Ok((_, false)) => {}
            Err(e) => {
                tracing::warn!(call = %call_id, error = %e, "failed to reap call");
            }
        }
    }
}

/// Mark calls stuck in initiated/ringing beyond the ring timeout as missed.
pub async fn sweep_stale_calls(state: &AppState) {
    let cutoff = (Utc::now() - Duration::seconds(state.calls_config.ring_timeout_secs as i64))
        .to_rfc3339();

    let rows = db::blocking(state.db.clone(), move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM calls
                 WHERE status IN ('initiated', 'ringing') AND initiated_at < ?1",
            )?;
            let ids = stmt
                .query_map([&cutoff], |r| r.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        let now = Utc::now().to_rfc3339();
        let mut swept = Vec::with_capacity(ids.len());
        for id in ids {
            tx.execute(
                "UPDATE calls SET status = 'missed', ended_at = ?1, end_reason = 'missed'
                 WHERE id = ?2 AND status IN ('initiated', 'ringing')",
                rusqlite::params![now, id],
            )?;
            swept.push(load_call(&tx, &id)?);
        }
        tx.commit()?;
        Ok(swept)
    })
    .await;

    match rows {
        Ok(rows) => {
            for row in rows {
                tracing::info!(call = %row.id, "marked unanswered call as missed");
                // A missed call is not a hang-up; clients read the terminal
                // status from the record itself.
                notify_both(state, &row, |call| ServerEvent::CallStatus { call });
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "stale-call sweep failed");
        }
    }
}

// --- Internal helpers ---

fn load_call(conn: &Connection, call_id: &str) -> Result<CallRow, ApiError> {
    conn.query_row(
        &format!("SELECT {} FROM calls WHERE id = ?1", CallRow::COLUMNS),
        [call_id],
        CallRow::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => ApiError::not_found("call not found"),
        other => ApiError::from(other),
    })
}

/// Shared end transition. `check_participant` is false on the reaper path,
/// where the ending principal was already established.
fn end_call_tx(
    conn: &mut Connection,
    call_id: &str,
    ended_by: &str,
    reason: &str,
    check_participant: bool,
) -> Result<(CallRow, bool), ApiError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row = load_call(&tx, call_id)?;
    if check_participant && !row.is_participant(ended_by) {
        return Err(ApiError::forbidden("not a participant in this call"));
    }

    let changed = if row.status.is_terminal() {
        false
    } else {
        let now = Utc::now().to_rfc3339();
        // Never-connected calls get a zero-length duration.
        tx.execute(
            "UPDATE calls SET status = 'ended', ended_at = ?1, end_reason = ?2,
                 ended_by = ?3, started_at = COALESCE(started_at, ?1)
             WHERE id = ?4",
            rusqlite::params![now, reason, ended_by, call_id],
        )?;
        true
    };

    let row = load_call(&tx, call_id)?;
    tx.commit()?;
    Ok((row, changed))
}

fn notify_both<F>(state: &AppState, row: &CallRow, make: F)
where
    F: Fn(CallView) -> ServerEvent,
{
    let view = CallView::from_row(row, None);
    state.notifier.to_user(&row.caller_id, make(view.clone()));
    state.notifier.to_user(&row.callee_id, make(view));
}
