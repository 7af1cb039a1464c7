//! Conversation lifecycle: creation, the request/accept/decline state
//! machine, and direct-pair de-duplication.
//!
//! Direct-conversation status is re-derived from the *current* follow
//! relationship lazily on every open and lookup — intentional lazy
//! consistency, not a background job. A partial unique index on the
//! canonical pair key makes duplicate direct conversations impossible to
//! create.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::db::models::{canonical_pair, rfc3339_to_millis, ChatKind, ChatStatus, ConversationRow};
use crate::db::{self};
use crate::error::ApiError;
use crate::pagination::{PageQuery, Paginated};
use crate::state::AppState;
use crate::users;
use crate::ws::events::ServerEvent;

/// Denormalized preview of the most recent non-deleted message.
#[derive(Debug, Clone, Serialize)]
pub struct LastMessage {
    pub id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub id: String,
    pub kind: ChatKind,
    pub status: ChatStatus,
    pub creator_id: String,
    pub participant_ids: Vec<String>,
    pub admin_ids: Vec<String>,
    pub muted_by: Vec<String>,
    pub last_message: Option<LastMessage>,
    pub message_count: i64,
    pub unread_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    /// Present for a direct conversation.
    pub recipient_id: Option<String>,
    /// Present for explicit group creation (two or more other principals).
    pub participant_ids: Option<Vec<String>>,
}

// Query deserialization cannot flatten numeric fields, so the page params
// are repeated here instead of embedding PageQuery.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

// --- Handlers ---

/// POST /api/conversations — open a direct conversation or create a group.
/// Opening a direct conversation is idempotent: the same canonical pair
/// always resolves to the same conversation.
pub async fn create_conversation(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<ConversationView>), ApiError> {
    match (body.recipient_id, body.participant_ids) {
        (Some(recipient_id), None) => open_direct(state, claims.sub, recipient_id).await,
        (None, Some(participant_ids)) => create_group(state, claims.sub, participant_ids).await,
        _ => Err(ApiError::validation(
            "provide either recipient_id or participant_ids",
        )),
    }
}

async fn open_direct(
    state: AppState,
    me: String,
    other: String,
) -> Result<(StatusCode, Json<ConversationView>), ApiError> {
    if me == other {
        return Err(ApiError::validation("cannot open a conversation with yourself"));
    }

    let db = state.db.clone();
    let me2 = me.clone();
    let other2 = other.clone();
    let (view, created, transition) = db::blocking(db, move |conn| {
        users::ensure_user_exists(conn, &other2)?;
        let outcome = open_direct_tx(conn, &me2, &other2)?;
        let view = load_view(conn, &outcome.conversation_id, Some(&me2))?;
        Ok((view, outcome.created, outcome.transition))
    })
    .await?;

    // Fan-out after commit, never before.
    match transition {
        DirectTransition::Requested => {
            state.notifier.to_user(
                &other,
                ServerEvent::ChatRequestCreated {
                    conversation: view.clone(),
                },
            );
        }
        DirectTransition::Reconciled => {
            state.notifier.to_user(
                &other,
                ServerEvent::ConversationUpdated {
                    conversation: view.clone(),
                },
            );
            state.notifier.to_user(
                &me,
                ServerEvent::ConversationUpdated {
                    conversation: view.clone(),
                },
            );
        }
        DirectTransition::None => {}
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(view)))
}

async fn create_group(
    state: AppState,
    me: String,
    mut participant_ids: Vec<String>,
) -> Result<(StatusCode, Json<ConversationView>), ApiError> {
    participant_ids.retain(|p| *p != me);
    participant_ids.sort();
    participant_ids.dedup();
    if participant_ids.len() < 2 {
        return Err(ApiError::validation(
            "a group conversation needs at least three participants",
        ));
    }

    let me2 = me.clone();
    let others = participant_ids.clone();
    let view = db::blocking(state.db.clone(), move |conn| {
        for id in &others {
            users::ensure_user_exists(conn, id)?;
        }

        let conv_id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO conversations (id, kind, status, creator_id, pair_key, created_at, updated_at)
             VALUES (?1, 'group', 'active', ?2, NULL, ?3, ?3)",
            rusqlite::params![conv_id, me2, now],
        )?;
        // Creator is a group admin
        conn.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id, is_admin, joined_at)
             VALUES (?1, ?2, 1, ?3)",
            rusqlite::params![conv_id, me2, now],
        )?;
        for id in &others {
            conn.execute(
                "INSERT INTO conversation_participants (conversation_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, 0, ?3)",
                rusqlite::params![conv_id, id, now],
            )?;
        }

        load_view(conn, &conv_id, Some(&me2))
    })
    .await?;

    for id in &participant_ids {
        state.notifier.to_user(
            id,
            ServerEvent::ConversationUpdated {
                conversation: view.clone(),
            },
        );
    }

    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /api/conversations?status=&page=&limit= — the caller's conversations,
/// most recently active first. Declined conversations stay visible to their
/// creator only.
pub async fn list_conversations(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<ListQuery>,
) -> Result<Json<Paginated<ConversationView>>, ApiError> {
    let status_filter = match query.status.as_deref() {
        None => None,
        Some(s) => Some(
            ChatStatus::from_str(s)
                .ok_or_else(|| ApiError::validation("status must be active, requested or declined"))?,
        ),
    };

    let me = claims.sub;
    let paging = PageQuery {
        page: query.page,
        limit: query.limit,
    };
    let (page, limit, offset) = (paging.page(), paging.limit(), paging.offset());

    let result = db::blocking(state.db.clone(), move |conn| {
        // Declined conversations are hidden from the non-creator, with or
        // without an explicit status filter.
        let filter_sql = match status_filter {
            Some(_) => "AND c.status = ?2 AND (c.status != 'declined' OR c.creator_id = ?1)",
            None => "AND (c.status != 'declined' OR c.creator_id = ?1)",
        };

        let count_sql = format!(
            "SELECT COUNT(*) FROM conversations c
             JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1 {}",
            filter_sql
        );
        let list_sql = format!(
            "SELECT c.id FROM conversations c
             JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1 {}
             ORDER BY CASE WHEN c.last_message_at IS NULL THEN 1 ELSE 0 END,
                      c.last_message_at DESC,
                      c.created_at DESC
             LIMIT ?3 OFFSET ?4",
            filter_sql
        );

        let (total, ids): (u64, Vec<String>) = match status_filter {
            Some(status) => {
                let total: i64 = conn.query_row(
                    &count_sql,
                    rusqlite::params![me, status.as_str()],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(&list_sql)?;
                let ids = stmt
                    .query_map(
                        rusqlite::params![me, status.as_str(), limit, offset],
                        |row| row.get::<_, String>(0),
                    )?
                    .filter_map(|r| r.ok())
                    .collect();
                (total as u64, ids)
            }
            None => {
                // The ?2 placeholder is absent; re-number for the unfiltered query.
                let count_sql = count_sql.replace("?3", "?2").replace("?4", "?3");
                let list_sql = list_sql.replace("?3", "?2").replace("?4", "?3");
                let total: i64 =
                    conn.query_row(&count_sql, rusqlite::params![me], |row| row.get(0))?;
                let mut stmt = conn.prepare(&list_sql)?;
                let ids = stmt
                    .query_map(rusqlite::params![me, limit, offset], |row| {
                        row.get::<_, String>(0)
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                (total as u64, ids)
            }
        };

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            items.push(load_view(conn, &id, Some(&me))?);
        }
        Ok(Paginated::new(items, page, limit, total))
    })
    .await?;

    Ok(Json(result))
}

/// GET /api/conversations/{id}
pub async fn get_conversation(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationView>, ApiError> {
    let me = claims.sub;
    let view = db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conversation_id, &me)?;
        reconcile_direct(conn, &conversation_id)?;
        load_view(conn, &conversation_id, Some(&me))
    })
    .await?;
    Ok(Json(view))
}

/// POST /api/conversations/{id}/accept — only the non-creator may accept,
/// and only while the status is still `requested`. A second accept attempt
/// fails with not-found because the status no longer matches.
pub async fn accept_conversation(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationView>, ApiError> {
    let me = claims.sub.clone();
    let conv_id = conversation_id.clone();
    let (view, creator_id) = db::blocking(state.db.clone(), move |conn| {
        let row = require_requested_for_responder(conn, &conv_id, &me)?;
        let now = Utc::now().to_rfc3339();
        // The accepted_at stamp pins the status: follow reconciliation never
        // demotes an explicitly accepted conversation.
        conn.execute(
            "UPDATE conversations SET status = 'active', accepted_at = ?1, updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![now, conv_id],
        )?;
        let view = load_view(conn, &conv_id, Some(&me))?;
        Ok((view, row.creator_id))
    })
    .await?;

    let event = ServerEvent::ChatRequestAccepted {
        conversation_id: conversation_id.clone(),
        user_id: claims.sub.clone(),
    };
    state.notifier.to_user(&creator_id, event.clone());
    state.notifier.to_conversation(&conversation_id, event);

    Ok(Json(view))
}

/// POST /api/conversations/{id}/decline — only the non-creator may decline a
/// `requested` conversation. The creator still sees it as declined.
pub async fn decline_conversation(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationView>, ApiError> {
    let me = claims.sub.clone();
    let conv_id = conversation_id.clone();
    let (view, creator_id) = db::blocking(state.db.clone(), move |conn| {
        let row = require_requested_for_responder(conn, &conv_id, &me)?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE conversations SET status = 'declined', updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, conv_id],
        )?;
        let view = load_view(conn, &conv_id, Some(&me))?;
        Ok((view, row.creator_id))
    })
    .await?;

    state.notifier.to_user(
        &creator_id,
        ServerEvent::ChatRequestDeclined {
            conversation_id,
            user_id: claims.sub,
        },
    );

    Ok(Json(view))
}

/// POST /api/conversations/{id}/mute
pub async fn mute_conversation(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationView>, ApiError> {
    set_muted(state, claims.sub, conversation_id, true).await
}

/// POST /api/conversations/{id}/unmute
pub async fn unmute_conversation(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationView>, ApiError> {
    set_muted(state, claims.sub, conversation_id, false).await
}

async fn set_muted(
    state: AppState,
    me: String,
    conversation_id: String,
    muted: bool,
) -> Result<Json<ConversationView>, ApiError> {
    let view = db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conversation_id, &me)?;
        conn.execute(
            "UPDATE conversation_participants SET muted = ?1
             WHERE conversation_id = ?2 AND user_id = ?3",
            rusqlite::params![muted as i64, conversation_id, me],
        )?;
        load_view(conn, &conversation_id, Some(&me))
    })
    .await?;
    Ok(Json(view))
}

// --- Internal operations ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectTransition {
    /// A fresh chat request was created (or re-requested after a decline).
    Requested,
    /// Status was reconciled from the current follow relationship.
    Reconciled,
    None,
}

struct OpenOutcome {
    conversation_id: String,
    created: bool,
    transition: DirectTransition,
}

/// Create-or-open a direct conversation for the canonical pair, re-deriving
/// the status from the current follow relationship on every open.
fn open_direct_tx(conn: &Connection, me: &str, other: &str) -> Result<OpenOutcome, ApiError> {
    let pair = canonical_pair(me, other);
    let recipient_follows_me = users::follows(conn, other, me)?;
    let now = Utc::now().to_rfc3339();

    let existing: Option<ConversationRow> = conn
        .query_row(
            &format!(
                "SELECT {} FROM conversations WHERE pair_key = ?1",
                ConversationRow::COLUMNS
            ),
            [&pair],
            ConversationRow::from_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(ApiError::from(other)),
        })?;

    if let Some(row) = existing {
        let transition = match row.status {
            // Recipient now follows the requester: auto-promote.
            ChatStatus::Requested if recipient_follows_me => {
                conn.execute(
                    "UPDATE conversations SET status = 'active', updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, row.id],
                )?;
                DirectTransition::Reconciled
            }
            // Follow was withdrawn before the request was ever accepted:
            // demote and make the opener the requester. An explicit accept
            // sticks regardless of the follow edge.
            ChatStatus::Active if !recipient_follows_me && row.accepted_at.is_none() => {
                conn.execute(
                    "UPDATE conversations SET status = 'requested', creator_id = ?1, updated_at = ?2
                     WHERE id = ?3",
                    rusqlite::params![me, now, row.id],
                )?;
                DirectTransition::Reconciled
            }
            // A declined conversation may be re-requested.
            ChatStatus::Declined => {
                conn.execute(
                    "UPDATE conversations SET status = 'requested', creator_id = ?1,
                         accepted_at = NULL, updated_at = ?2
                     WHERE id = ?3",
                    rusqlite::params![me, now, row.id],
                )?;
                DirectTransition::Requested
            }
            _ => DirectTransition::None,
        };

        return Ok(OpenOutcome {
            conversation_id: row.id,
            created: false,
            transition,
        });
    }

    let status = if recipient_follows_me {
        ChatStatus::Active
    } else {
        ChatStatus::Requested
    };

    let conv_id = Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO conversations (id, kind, status, creator_id, pair_key, created_at, updated_at)
         VALUES (?1, 'direct', ?2, ?3, ?4, ?5, ?5)",
        rusqlite::params![conv_id, status.as_str(), me, pair, now],
    )?;
    for user_id in [me, other] {
        conn.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![conv_id, user_id, now],
        )?;
    }

    Ok(OpenOutcome {
        conversation_id: conv_id,
        created: true,
        transition: if status == ChatStatus::Requested {
            DirectTransition::Requested
        } else {
            DirectTransition::None
        },
    })
}

/// Lookup-time counterpart of the open-time reconciliation: promotes a
/// pending request once the recipient follows the requester, and demotes a
/// follow-derived active conversation once the follow disappears. Explicitly
/// accepted conversations and non-direct kinds are left untouched. The
/// creator stays the requester here; only an open reassigns it.
pub fn reconcile_direct(conn: &Connection, conversation_id: &str) -> Result<(), ApiError> {
    let row = get_conversation_row(conn, conversation_id)?;
    if row.kind != ChatKind::Direct {
        return Ok(());
    }

    let recipient: Option<String> = conn
        .query_row(
            "SELECT user_id FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id != ?2",
            rusqlite::params![conversation_id, row.creator_id],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(ApiError::from(other)),
        })?;
    let Some(recipient) = recipient else {
        return Ok(());
    };

    let follows = users::follows(conn, &recipient, &row.creator_id)?;
    let now = Utc::now().to_rfc3339();
    match row.status {
        ChatStatus::Requested if follows => {
            conn.execute(
                "UPDATE conversations SET status = 'active', updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, conversation_id],
            )?;
        }
        ChatStatus::Active if !follows && row.accepted_at.is_none() => {
            conn.execute(
                "UPDATE conversations SET status = 'requested', updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, conversation_id],
            )?;
        }
        _ => {}
    }
    Ok(())
}

/// Guard shared by accept and decline: the caller must be a participant
/// other than the creator, and the status must still be `requested`.
/// Anything else reads as not-found — already-processed requests included.
fn require_requested_for_responder(
    conn: &Connection,
    conversation_id: &str,
    me: &str,
) -> Result<ConversationRow, ApiError> {
    ensure_participant(conn, conversation_id, me)?;
    let row = get_conversation_row(conn, conversation_id)?;
    if row.creator_id == me {
        return Err(ApiError::forbidden(
            "the requester cannot respond to their own chat request",
        ));
    }
    if row.status != ChatStatus::Requested {
        return Err(ApiError::not_found("no pending chat request"));
    }
    Ok(row)
}

pub fn get_conversation_row(
    conn: &Connection,
    conversation_id: &str,
) -> Result<ConversationRow, ApiError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM conversations WHERE id = ?1",
            ConversationRow::COLUMNS
        ),
        [conversation_id],
        ConversationRow::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => ApiError::not_found("conversation not found"),
        other => ApiError::from(other),
    })
}

pub fn ensure_participant(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> Result<(), ApiError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conversation_participants
         WHERE conversation_id = ?1 AND user_id = ?2",
        rusqlite::params![conversation_id, user_id],
        |row| row.get(0),
    )?;
    if count == 0 {
        return Err(ApiError::forbidden("not a participant in this conversation"));
    }
    Ok(())
}

pub fn is_admin(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> Result<bool, ApiError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conversation_participants
         WHERE conversation_id = ?1 AND user_id = ?2 AND is_admin = 1",
        rusqlite::params![conversation_id, user_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Materialize the full view of one conversation. `viewer` drives the
/// unread count; pass None for a neutral view.
pub fn load_view(
    conn: &Connection,
    conversation_id: &str,
    viewer: Option<&str>,
) -> Result<ConversationView, ApiError> {
    let row = get_conversation_row(conn, conversation_id)?;

    let mut stmt = conn.prepare(
        "SELECT user_id, is_admin, muted FROM conversation_participants
         WHERE conversation_id = ?1 ORDER BY user_id",
    )?;
    let mut participant_ids = Vec::new();
    let mut admin_ids = Vec::new();
    let mut muted_by = Vec::new();
    let rows = stmt.query_map([conversation_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)? != 0,
            row.get::<_, i64>(2)? != 0,
        ))
    })?;
    for entry in rows {
        let (user_id, is_admin, muted) = entry?;
        if is_admin {
            admin_ids.push(user_id.clone());
        }
        if muted {
            muted_by.push(user_id.clone());
        }
        participant_ids.push(user_id);
    }

    let unread_count = match viewer {
        Some(viewer) => conn.query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = ?1 AND m.deleted = 0 AND m.sender_id != ?2
               AND NOT EXISTS (SELECT 1 FROM message_reads r
                               WHERE r.message_id = m.id AND r.user_id = ?2)",
            rusqlite::params![conversation_id, viewer],
            |row| row.get(0),
        )?,
        None => 0,
    };

    let last_message = match (&row.last_message_id, &row.last_message_sender_id) {
        (Some(id), Some(sender_id)) => Some(LastMessage {
            id: id.clone(),
            sender_id: sender_id.clone(),
            text: row.last_message_text.clone().unwrap_or_default(),
            timestamp: row
                .last_message_at
                .as_deref()
                .map(rfc3339_to_millis)
                .unwrap_or_default(),
        }),
        _ => None,
    };

    Ok(ConversationView {
        id: row.id,
        kind: row.kind,
        status: row.status,
        creator_id: row.creator_id,
        participant_ids,
        admin_ids,
        muted_by,
        last_message,
        message_count: row.message_count,
        unread_count,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
