//! Message persistence, soft deletion with a restore window, read receipts,
//! reactions, and unread bookkeeping.
//!
//! The conversation's last-message snapshot and message count are recomputed
//! inside the same transaction as every message mutation, so a reader never
//! observes a snapshot that disagrees with the message table.

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
use crate::chat::conversations::{self, ensure_participant};
use crate::db::models::{
    rfc3339_to_millis, ChatKind, ChatStatus, ConversationRow, MessageRow, MessageState, MessageType,
};
use crate::db::{self};
use crate::error::ApiError;
use crate::pagination::{PageQuery, Paginated, Pagination};
use crate::state::AppState;
use crate::ws::events::ServerEvent;

#[derive(Debug, Clone, Serialize)]
pub struct ReactionView {
    pub user_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    /// Empty for deleted messages; clients render a tombstone.
    pub body: String,
    pub message_type: MessageType,
    pub media_url: Option<String>,
    pub reply_to_id: Option<String>,
    pub timestamp: i64,
    pub read_by: Vec<String>,
    pub reactions: Vec<ReactionView>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnreadCount {
    pub conversation_id: String,
    pub count: i64,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    pub message_type: Option<String>,
    pub media_url: Option<String>,
    pub reply_to_id: Option<String>,
}

/// Message page plus the conversation status, so a client that opened a
/// pending request can render the gate instead of an empty history.
#[derive(Debug, Serialize)]
pub struct MessagesPage {
    pub items: Vec<MessageView>,
    pub pagination: Pagination,
    pub chat_status: ChatStatus,
}

// Query deserialization cannot flatten numeric fields, so the page params
// are repeated here instead of embedding PageQuery.
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub conversation_id: String,
    pub message_ids: Vec<String>,
}

// --- Handlers ---

/// POST /api/conversations/{id}/messages
///
/// In a `requested` conversation only the requester may keep writing; the
/// recipient must accept first. Declined conversations accept no messages.
pub async fn send_message(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageView>), ApiError> {
    let text = body.body.trim().to_string();
    if text.is_empty() && body.media_url.is_none() {
        return Err(ApiError::validation("message body is required"));
    }
    let message_type = match body.message_type.as_deref() {
        None => MessageType::Text,
        Some(s) => MessageType::from_str(s)
            .ok_or_else(|| ApiError::validation("unknown message type"))?,
    };

    let me = claims.sub.clone();
    let conv_id = conversation_id.clone();
    let media_url = body.media_url.clone();
    let reply_to_id = body.reply_to_id.clone();
    let (view, recipients) = db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conv_id, &me)?;
        let conv = conversations::get_conversation_row(conn, &conv_id)?;
        match conv.status {
            ChatStatus::Active => {}
            ChatStatus::Requested if conv.creator_id == me => {}
            ChatStatus::Requested => {
                return Err(ApiError::forbidden(
                    "accept the chat request before sending messages",
                ));
            }
            ChatStatus::Declined => {
                return Err(ApiError::forbidden("this chat request was declined"));
            }
        }

        if let Some(reply_to) = &reply_to_id {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE id = ?1 AND conversation_id = ?2",
                rusqlite::params![reply_to, conv_id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(ApiError::validation("reply target not found"));
            }
        }

        let tx = conn.transaction()?;
        let message_id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, body, message_type, media_url, reply_to_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                message_id,
                conv_id,
                me,
                text,
                message_type.as_str(),
                media_url,
                reply_to_id,
                now
            ],
        )?;
        recompute_snapshot(&tx, &conv_id)?;
        tx.commit()?;

        let view = load_message_view(conn, &message_id)?;
        let recipients = other_participants(conn, &conv_id, &me)?;
        Ok((view, recipients))
    })
    .await?;

    state.notifier.to_conversation(
        &conversation_id,
        ServerEvent::NewMessage {
            conversation_id: conversation_id.clone(),
            message: view.clone(),
        },
    );
    fanout_unread_counts(&state, recipients.iter().map(|(id, _)| id.clone()).collect());
    for (user_id, muted) in &recipients {
        if *muted {
            continue;
        }
        state.notifier.push_to_user(
            user_id,
            "New message",
            &view.body,
            serde_json::json!({
                "kind": "message",
                "conversation_id": conversation_id,
                "message_id": view.id,
            }),
        );
    }

    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /api/conversations/{id}/messages — one page of history, oldest first
/// within the page, newest page first.
///
/// The recipient of a still-pending chat request sees no history; the page
/// carries `chat_status` so the client can render the request gate.
pub async fn list_messages(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<MessagesPage>, ApiError> {
    let me = claims.sub;
    let (page, limit, offset) = (query.page(), query.limit(), query.offset());

    let result = db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conversation_id, &me)?;
        conversations::reconcile_direct(conn, &conversation_id)?;
        let conv = conversations::get_conversation_row(conn, &conversation_id)?;

        if conv.status == ChatStatus::Requested && conv.creator_id != me {
            return Ok(MessagesPage {
                items: Vec::new(),
                pagination: Pagination::new(page, limit, 0),
                chat_status: conv.status,
            });
        }

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [&conversation_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            MessageRow::COLUMNS
        ))?;
        let ids: Vec<String> = stmt
            .query_map(
                rusqlite::params![conversation_id, limit, offset],
                |row| row.get::<_, String>(0),
            )?
            .filter_map(|r| r.ok())
            .collect();

        let mut items = Vec::with_capacity(ids.len());
        // Reverse so each page reads oldest-to-newest.
        for id in ids.into_iter().rev() {
            items.push(load_message_view(conn, &id)?);
        }

        Ok(MessagesPage {
            items,
            pagination: Pagination::new(page, limit, total as u64),
            chat_status: conv.status,
        })
    })
    .await?;

    Ok(Json(result))
}

/// GET /api/conversations/{id}/messages/search?q= — substring search over
/// non-deleted message bodies, newest first.
pub async fn search_messages(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Paginated<MessageView>>, ApiError> {
    let needle = query.q.trim().to_string();
    if needle.is_empty() {
        return Err(ApiError::validation("q is required"));
    }

    let me = claims.sub;
    let paging = PageQuery {
        page: query.page,
        limit: query.limit,
    };
    let (page, limit, offset) = (paging.page(), paging.limit(), paging.offset());
    let pattern = format!(
        "%{}%",
        needle.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
    );

    let result = db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conversation_id, &me)?;

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND deleted = 0 AND body LIKE ?2 ESCAPE '\\'",
            rusqlite::params![conversation_id, pattern],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT id FROM messages
             WHERE conversation_id = ?1 AND deleted = 0 AND body LIKE ?2 ESCAPE '\\'
             ORDER BY created_at DESC, id DESC LIMIT ?3 OFFSET ?4",
        )?;
        let ids: Vec<String> = stmt
            .query_map(
                rusqlite::params![conversation_id, pattern, limit, offset],
                |row| row.get::<_, String>(0),
            )?
            .filter_map(|r| r.ok())
            .collect();

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            items.push(load_message_view(conn, &id)?);
        }
        Ok(Paginated::new(items, page, limit, total as u64))
    })
    .await?;

    Ok(Json(result))
}

/// DELETE /api/conversations/{id}/messages/{message_id} — soft delete.
/// The sender may always delete their own message; a group admin may delete
/// anyone's.
pub async fn delete_message(
    State(state): State<AppState>,
    claims: Claims,
    Path((conversation_id, message_id)): Path<(String, String)>,
) -> Result<Json<MessageView>, ApiError> {
    let me = claims.sub;
    let conv_id = conversation_id.clone();
    let msg_id = message_id.clone();
    let view = db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conv_id, &me)?;
        let row = load_message_row(conn, &conv_id, &msg_id)?;
        ensure_can_moderate(conn, &conv_id, &row, &me)?;
        if row.deleted {
            return load_message_view(conn, &msg_id);
        }

        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE messages SET deleted = 1, deleted_at = ?1, original_body = body, body = ''
             WHERE id = ?2",
            rusqlite::params![now, msg_id],
        )?;
        recompute_snapshot(&tx, &conv_id)?;
        tx.commit()?;

        load_message_view(conn, &msg_id)
    })
    .await?;

    state.notifier.to_conversation(
        &conversation_id,
        ServerEvent::MessageDeleted {
            conversation_id: conversation_id.clone(),
            message_id,
        },
    );

    Ok(Json(view))
}

/// POST /api/conversations/{id}/messages/{message_id}/restore — undo a soft
/// delete within the restore window. Same actors as deletion.
pub async fn restore_message(
    State(state): State<AppState>,
    claims: Claims,
    Path((conversation_id, message_id)): Path<(String, String)>,
) -> Result<Json<MessageView>, ApiError> {
    let me = claims.sub;
    let conv_id = conversation_id.clone();
    let msg_id = message_id.clone();
    let view = db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conv_id, &me)?;
        let row = load_message_row(conn, &conv_id, &msg_id)?;
        ensure_can_moderate(conn, &conv_id, &row, &me)?;

        match row.state() {
            MessageState::Active => {
                return Err(ApiError::validation("message is not deleted"));
            }
            state @ MessageState::Deleted { .. } => {
                if !state.restorable_at(Utc::now()) {
                    return Err(ApiError::validation("the restore window has passed"));
                }
            }
        }

        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE messages SET deleted = 0, body = original_body, deleted_at = NULL,
                 original_body = NULL
             WHERE id = ?1",
            [&msg_id],
        )?;
        recompute_snapshot(&tx, &conv_id)?;
        tx.commit()?;

        load_message_view(conn, &msg_id)
    })
    .await?;

    state.notifier.to_conversation(
        &conversation_id,
        ServerEvent::MessageRestored {
            conversation_id: conversation_id.clone(),
            message: view.clone(),
        },
    );

    Ok(Json(view))
}

/// POST /api/conversations/{id}/messages/read — mark everything unread in
/// the conversation as read by the caller.
pub async fn mark_read(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<String>,
) -> Result<Json<ReadResponse>, ApiError> {
    let me = claims.sub.clone();
    let conv_id = conversation_id.clone();
    let message_ids = db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conv_id, &me)?;

        let mut stmt = conn.prepare(
            "SELECT m.id FROM messages m
             WHERE m.conversation_id = ?1 AND m.deleted = 0 AND m.sender_id != ?2
               AND NOT EXISTS (SELECT 1 FROM message_reads r
                               WHERE r.message_id = m.id AND r.user_id = ?2)
             ORDER BY m.created_at",
        )?;
        let ids: Vec<String> = stmt
            .query_map(rusqlite::params![conv_id, me], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        let now = Utc::now().to_rfc3339();
        for id in &ids {
            conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![id, me, now],
            )?;
        }
        Ok(ids)
    })
    .await?;

    if !message_ids.is_empty() {
        state.notifier.to_conversation(
            &conversation_id,
            ServerEvent::ReadReceipt {
                conversation_id: conversation_id.clone(),
                user_id: claims.sub.clone(),
                message_ids: message_ids.clone(),
            },
        );
        fanout_unread_counts(&state, vec![claims.sub]);
    }

    Ok(Json(ReadResponse {
        conversation_id,
        message_ids,
    }))
}

/// POST /api/conversations/{id}/messages/{message_id}/reactions
pub async fn add_reaction(
    State(state): State<AppState>,
    claims: Claims,
    Path((conversation_id, message_id)): Path<(String, String)>,
    Json(body): Json<ReactionRequest>,
) -> Result<(StatusCode, Json<MessageView>), ApiError> {
    let emoji = body.emoji.trim().to_string();
    if emoji.is_empty() {
        return Err(ApiError::validation("emoji is required"));
    }

    let me = claims.sub.clone();
    let conv_id = conversation_id.clone();
    let msg_id = message_id.clone();
    let emoji2 = emoji.clone();
    let view = db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conv_id, &me)?;
        let row = load_message_row(conn, &conv_id, &msg_id)?;
        if row.deleted {
            return Err(ApiError::validation("cannot react to a deleted message"));
        }
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO message_reactions (message_id, user_id, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![msg_id, me, emoji2, now],
        )?;
        load_message_view(conn, &msg_id)
    })
    .await?;

    state.notifier.to_conversation(
        &conversation_id,
        ServerEvent::ReactionAdded {
            conversation_id: conversation_id.clone(),
            message_id,
            user_id: claims.sub,
            emoji,
        },
    );

    Ok((StatusCode::CREATED, Json(view)))
}

/// DELETE /api/conversations/{id}/messages/{message_id}/reactions
pub async fn remove_reaction(
    State(state): State<AppState>,
    claims: Claims,
    Path((conversation_id, message_id)): Path<(String, String)>,
    Json(body): Json<ReactionRequest>,
) -> Result<Json<MessageView>, ApiError> {
    let me = claims.sub.clone();
    let conv_id = conversation_id.clone();
    let msg_id = message_id.clone();
    let emoji = body.emoji.clone();
    let view = db::blocking(state.db.clone(), move |conn| {
        ensure_participant(conn, &conv_id, &me)?;
        load_message_row(conn, &conv_id, &msg_id)?;
        conn.execute(
            "DELETE FROM message_reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
            rusqlite::params![msg_id, me, emoji],
        )?;
        load_message_view(conn, &msg_id)
    })
    .await?;

    state.notifier.to_conversation(
        &conversation_id,
        ServerEvent::ReactionRemoved {
            conversation_id: conversation_id.clone(),
            message_id,
            user_id: claims.sub,
            emoji: body.emoji,
        },
    );

    Ok(Json(view))
}

/// GET /api/unread-counts — per-conversation unread totals for the caller.
pub async fn get_unread_counts(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<UnreadCount>>, ApiError> {
    let me = claims.sub;
    let counts =
        db::blocking(state.db.clone(), move |conn| unread_counts_for_user(conn, &me)).await?;
    Ok(Json(counts))
}

// --- Internal helpers ---

/// Recompute the denormalized last-message snapshot and message count from
/// the message table. Deleted messages never appear in the snapshot.
pub fn recompute_snapshot(conn: &Connection, conversation_id: &str) -> Result<(), ApiError> {
    let latest: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT id, sender_id, body, created_at FROM messages
             WHERE conversation_id = ?1 AND deleted = 0
             ORDER BY created_at DESC, id DESC LIMIT 1",
            [conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(ApiError::from(other)),
        })?;

    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND deleted = 0",
        [conversation_id],
        |row| row.get(0),
    )?;

    let now = Utc::now().to_rfc3339();
    match latest {
        Some((id, sender_id, body, created_at)) => {
            conn.execute(
                "UPDATE conversations SET last_message_id = ?1, last_message_sender_id = ?2,
                     last_message_text = ?3, last_message_at = ?4, message_count = ?5,
                     updated_at = ?6
                 WHERE id = ?7",
                rusqlite::params![id, sender_id, body, created_at, count, now, conversation_id],
            )?;
        }
        None => {
            conn.execute(
                "UPDATE conversations SET last_message_id = NULL, last_message_sender_id = NULL,
                     last_message_text = NULL, last_message_at = NULL, message_count = 0,
                     updated_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now, conversation_id],
            )?;
        }
    }
    Ok(())
}

pub fn unread_counts_for_user(conn: &Connection, user_id: &str) -> Result<Vec<UnreadCount>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT m.conversation_id, COUNT(*) FROM messages m
         JOIN conversation_participants p
           ON p.conversation_id = m.conversation_id AND p.user_id = ?1
         WHERE m.deleted = 0 AND m.sender_id != ?1
           AND NOT EXISTS (SELECT 1 FROM message_reads r
                           WHERE r.message_id = m.id AND r.user_id = ?1)
         GROUP BY m.conversation_id",
    )?;
    let counts = stmt
        .query_map([user_id], |row| {
            Ok(UnreadCount {
                conversation_id: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(counts)
}

pub fn load_message_view(conn: &Connection, message_id: &str) -> Result<MessageView, ApiError> {
    let row: MessageRow = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", MessageRow::COLUMNS),
            [message_id],
            MessageRow::from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => ApiError::not_found("message not found"),
            other => ApiError::from(other),
        })?;

    let mut stmt = conn.prepare(
        "SELECT user_id FROM message_reads WHERE message_id = ?1 ORDER BY read_at",
    )?;
    let read_by = stmt
        .query_map([message_id], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut stmt = conn.prepare(
        "SELECT user_id, emoji FROM message_reactions WHERE message_id = ?1 ORDER BY created_at",
    )?;
    let reactions = stmt
        .query_map([message_id], |row| {
            Ok(ReactionView {
                user_id: row.get(0)?,
                emoji: row.get(1)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(MessageView {
        id: row.id,
        conversation_id: row.conversation_id,
        sender_id: row.sender_id,
        body: if row.deleted { String::new() } else { row.body },
        message_type: row.message_type,
        media_url: row.media_url,
        reply_to_id: row.reply_to_id,
        timestamp: rfc3339_to_millis(&row.created_at),
        read_by,
        reactions,
        deleted: row.deleted,
    })
}

fn load_message_row(
    conn: &Connection,
    conversation_id: &str,
    message_id: &str,
) -> Result<MessageRow, ApiError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM messages WHERE id = ?1 AND conversation_id = ?2",
            MessageRow::COLUMNS
        ),
        rusqlite::params![message_id, conversation_id],
        MessageRow::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => ApiError::not_found("message not found"),
        other => ApiError::from(other),
    })
}

/// Sender may always moderate their own message; group admins may moderate
/// anyone's.
fn ensure_can_moderate(
    conn: &Connection,
    conversation_id: &str,
    row: &MessageRow,
    user_id: &str,
) -> Result<(), ApiError> {
    if row.sender_id == user_id {
        return Ok(());
    }
    let conv: ConversationRow = conversations::get_conversation_row(conn, conversation_id)?;
    if conv.kind == ChatKind::Group && conversations::is_admin(conn, conversation_id, user_id)? {
        return Ok(());
    }
    Err(ApiError::forbidden("only the sender or a group admin may do this"))
}

fn other_participants(
    conn: &Connection,
    conversation_id: &str,
    me: &str,
) -> Result<Vec<(String, bool)>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT user_id, muted FROM conversation_participants
         WHERE conversation_id = ?1 AND user_id != ?2",
    )?;
    let out = stmt
        .query_map(rusqlite::params![conversation_id, me], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(out)
}

/// Recompute and deliver fresh unread counts to each listed principal.
fn fanout_unread_counts(state: &AppState, user_ids: Vec<String>) {
    let db = state.db.clone();
    let notifier = state.notifier.clone();
    tokio::spawn(async move {
        for user_id in user_ids {
            let db = db.clone();
            let uid = user_id.clone();
            let counts =
                db::blocking(db, move |conn| unread_counts_for_user(conn, &uid)).await;
            match counts {
                Ok(counts) => {
                    notifier.to_user(&user_id, ServerEvent::UnreadCounts { counts });
                }
                Err(e) => {
                    tracing::warn!(user = %user_id, error = %e, "failed to compute unread counts");
                }
            }
        }
    });
}
