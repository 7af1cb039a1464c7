//! Repair job for duplicate direct conversations.
//!
//! The partial unique index on `pair_key` prevents new duplicates, but data
//! imported from before that index existed can carry several direct
//! conversations for the same pair (with NULL pair keys). The merge keeps the
//! oldest conversation, moves everything that hangs off the duplicates onto
//! it, and backfills the pair key. Reads and reactions key off message ids,
//! so they follow their messages without being touched.

use axum::{extract::State, Json};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;

use crate::auth::middleware::Claims;
use crate::chat::messages::recompute_snapshot;
use crate::db::models::canonical_pair;
use crate::db::{self};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Serialize)]
pub struct MergeReport {
    /// Distinct pairs that had more than one conversation.
    pub pairs_merged: usize,
    /// Duplicate conversations deleted.
    pub conversations_removed: usize,
    /// Messages re-pointed at a surviving conversation.
    pub messages_moved: usize,
    /// Conversations that had a missing pair key backfilled.
    pub pair_keys_backfilled: usize,
}

/// POST /api/admin/maintenance/conversations
pub async fn run_merge(
    State(state): State<AppState>,
    _claims: Claims,
) -> Result<Json<MergeReport>, ApiError> {
    let report = db::blocking(state.db.clone(), |conn| {
        merge_duplicate_direct_conversations(conn)
    })
    .await?;
    tracing::info!(
        pairs = report.pairs_merged,
        removed = report.conversations_removed,
        messages = report.messages_moved,
        "direct-conversation merge complete"
    );
    Ok(Json(report))
}

/// Merge every set of duplicate direct conversations down to its oldest
/// member. Idempotent: a second run finds nothing to do.
pub fn merge_duplicate_direct_conversations(
    conn: &mut Connection,
) -> Result<MergeReport, ApiError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut report = MergeReport::default();

    // Pair keys are derived from the participant set, not trusted from the
    // column, so legacy NULL rows group correctly.
    let groups: Vec<(String, Vec<String>)> = {
        let mut stmt = tx.prepare(
            "SELECT c.id FROM conversations c WHERE c.kind = 'direct' ORDER BY c.created_at, c.id",
        )?;
        let conv_ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        let mut by_pair: Vec<(String, Vec<String>)> = Vec::new();
        for conv_id in conv_ids {
            let mut participants: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT user_id FROM conversation_participants
                     WHERE conversation_id = ?1 ORDER BY user_id",
                )?;
                let participants = stmt
                    .query_map([&conv_id], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                participants
            };
            if participants.len() != 2 {
                continue;
            }
            let b = participants.pop().unwrap_or_default();
            let a = participants.pop().unwrap_or_default();
            let pair = canonical_pair(&a, &b);
            match by_pair.iter_mut().find(|(p, _)| *p == pair) {
                Some((_, ids)) => ids.push(conv_id),
                None => by_pair.push((pair, vec![conv_id])),
            }
        }
        by_pair
    };

    for (pair, conv_ids) in groups {
        // Ordered by created_at above, so the first id is the survivor.
        let Some((keep, duplicates)) = conv_ids.split_first() else {
            continue;
        };

        if !duplicates.is_empty() {
            report.pairs_merged += 1;
        }
        for dup in duplicates {
            let moved = tx.execute(
                "UPDATE messages SET conversation_id = ?1 WHERE conversation_id = ?2",
                rusqlite::params![keep, dup],
            )?;
            report.messages_moved += moved;
            tx.execute(
                "UPDATE calls SET conversation_id = ?1 WHERE conversation_id = ?2",
                rusqlite::params![keep, dup],
            )?;
            tx.execute(
                "DELETE FROM conversation_participants WHERE conversation_id = ?1",
                [dup],
            )?;
            tx.execute("DELETE FROM conversations WHERE id = ?1", [dup])?;
            report.conversations_removed += 1;
        }

        let backfilled = tx.execute(
            "UPDATE conversations SET pair_key = ?1 WHERE id = ?2 AND pair_key IS NULL",
            rusqlite::params![pair, keep],
        )?;
        report.pair_keys_backfilled += backfilled;

        if !duplicates.is_empty() {
            recompute_snapshot(&tx, keep)?;
        }
    }

    tx.commit()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use chrono::Utc;

    fn seed_user(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?1, ?2)",
            rusqlite::params![id, Utc::now().to_rfc3339()],
        )
        .unwrap();
    }

    fn seed_direct(conn: &Connection, id: &str, a: &str, b: &str, created_at: &str) {
        conn.execute(
            "INSERT INTO conversations (id, kind, status, creator_id, pair_key, created_at, updated_at)
             VALUES (?1, 'direct', 'active', ?2, NULL, ?3, ?3)",
            rusqlite::params![id, a, created_at],
        )
        .unwrap();
        for user in [a, b] {
            conn.execute(
                "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![id, user, created_at],
            )
            .unwrap();
        }
    }

    fn seed_message(conn: &Connection, id: &str, conv: &str, sender: &str, body: &str) {
        conn.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, body, message_type, created_at)
             VALUES (?1, ?2, ?3, ?4, 'text', ?5)",
            rusqlite::params![id, conv, sender, body, Utc::now().to_rfc3339()],
        )
        .unwrap();
    }

    #[test]
    fn merges_duplicates_into_oldest() {
        let db = init_test_db();
        let mut conn = db.lock().unwrap();
        let conn = &mut *conn;
        seed_user(conn, "alice");
        seed_user(conn, "bob");
        seed_direct(conn, "conv-old", "alice", "bob", "2024-01-01T00:00:00Z");
        seed_direct(conn, "conv-new", "bob", "alice", "2024-06-01T00:00:00Z");
        seed_message(conn, "m1", "conv-old", "alice", "first");
        seed_message(conn, "m2", "conv-new", "bob", "second");

        let report = merge_duplicate_direct_conversations(conn).unwrap();
        assert_eq!(report.pairs_merged, 1);
        assert_eq!(report.conversations_removed, 1);
        assert_eq!(report.messages_moved, 1);

        let remaining: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversations WHERE kind = 'direct'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 1);

        let (count, pair_key): (i64, String) = conn
            .query_row(
                "SELECT message_count, pair_key FROM conversations WHERE id = 'conv-old'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(pair_key, "alice:bob");
    }

    #[test]
    fn second_run_is_a_no_op() {
        let db = init_test_db();
        let mut conn = db.lock().unwrap();
        let conn = &mut *conn;
        seed_user(conn, "alice");
        seed_user(conn, "bob");
        seed_direct(conn, "c1", "alice", "bob", "2024-01-01T00:00:00Z");
        seed_direct(conn, "c2", "alice", "bob", "2024-02-01T00:00:00Z");

        merge_duplicate_direct_conversations(conn).unwrap();
        let report = merge_duplicate_direct_conversations(conn).unwrap();
        assert_eq!(report.pairs_merged, 0);
        assert_eq!(report.conversations_removed, 0);
        assert_eq!(report.messages_moved, 0);
        assert_eq!(report.pair_keys_backfilled, 0);
    }

    #[test]
    fn groups_are_left_alone() {
        let db = init_test_db();
        let mut conn = db.lock().unwrap();
        let conn = &mut *conn;
        for user in ["alice", "bob", "carol"] {
            seed_user(conn, user);
        }
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO conversations (id, kind, status, creator_id, pair_key, created_at, updated_at)
             VALUES ('g1', 'group', 'active', 'alice', NULL, ?1, ?1)",
            [&now],
        )
        .unwrap();
        for user in ["alice", "bob", "carol"] {
            conn.execute(
                "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
                 VALUES ('g1', ?1, ?2)",
                rusqlite::params![user, now],
            )
            .unwrap();
        }

        let report = merge_duplicate_direct_conversations(conn).unwrap();
        assert_eq!(report.conversations_removed, 0);
    }
}
