use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking — no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: chat core

CREATE TABLE users (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE follows (
    follower_id TEXT NOT NULL,
    followee_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (follower_id, followee_id),
    FOREIGN KEY (follower_id) REFERENCES users(id),
    FOREIGN KEY (followee_id) REFERENCES users(id)
);

CREATE INDEX idx_follows_followee ON follows(followee_id);

CREATE TABLE conversations (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,                -- 'direct' | 'group'
    status TEXT NOT NULL,              -- 'active' | 'requested' | 'declined'
    creator_id TEXT NOT NULL,
    pair_key TEXT,                     -- canonical sorted pair for direct, NULL for group
    accepted_at TEXT,                  -- stamped on explicit accept, NULL while follow-derived
    last_message_id TEXT,
    last_message_sender_id TEXT,
    last_message_text TEXT,
    last_message_at TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (creator_id) REFERENCES users(id)
);

-- At most one direct conversation per unordered participant pair.
CREATE UNIQUE INDEX idx_conversations_pair ON conversations(pair_key)
    WHERE pair_key IS NOT NULL;

CREATE TABLE conversation_participants (
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    muted INTEGER NOT NULL DEFAULT 0,
    joined_at TEXT NOT NULL,
    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX idx_participants_user ON conversation_participants(user_id);

CREATE TABLE messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    body TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text',
    media_url TEXT,
    reply_to_id TEXT,
    created_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    original_body TEXT,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id),
    FOREIGN KEY (sender_id) REFERENCES users(id)
);

CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);

CREATE TABLE message_reads (
    message_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    read_at TEXT NOT NULL,
    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);

CREATE TABLE message_reactions (
    message_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    emoji TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (message_id, user_id, emoji),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);
",
        ),
        M::up(
            "-- Migration 2: calls, presence, push subscriptions

CREATE TABLE calls (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    caller_id TEXT NOT NULL,
    callee_id TEXT NOT NULL,
    media TEXT NOT NULL,               -- 'voice' | 'video'
    status TEXT NOT NULL,              -- see calls::lifecycle state machine
    initiated_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    end_reason TEXT,
    ended_by TEXT,
    relay_session_id TEXT,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

CREATE INDEX idx_calls_status ON calls(status);
CREATE INDEX idx_calls_caller ON calls(caller_id);
CREATE INDEX idx_calls_callee ON calls(callee_id);

CREATE TABLE presence (
    user_id TEXT PRIMARY KEY,
    connection_id TEXT NOT NULL,
    process_id TEXT NOT NULL,
    connected_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX idx_presence_expires ON presence(expires_at);

CREATE TABLE push_subscriptions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    key_p256dh TEXT NOT NULL,
    key_auth TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, endpoint),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX idx_push_subscriptions_user ON push_subscriptions(user_id);
",
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_cleanly() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        migrations().to_latest(&mut conn).unwrap();
    }

    #[test]
    fn direct_pair_is_unique() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        migrations().to_latest(&mut conn).unwrap();

        conn.execute(
            "INSERT INTO users (id, display_name, created_at) VALUES ('a', 'A', ''), ('b', 'B', '')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO conversations (id, kind, status, creator_id, pair_key, created_at, updated_at)
             VALUES ('c1', 'direct', 'active', 'a', 'a:b', '', '')",
            [],
        )
        .unwrap();

        let dup = conn.execute(
            "INSERT INTO conversations (id, kind, status, creator_id, pair_key, created_at, updated_at)
             VALUES ('c2', 'direct', 'active', 'b', 'a:b', '', '')",
            [],
        );
        assert!(dup.is_err(), "duplicate pair_key must be rejected");

        // Group rows carry NULL pair_key and are unaffected by the index
        conn.execute(
            "INSERT INTO conversations (id, kind, status, creator_id, pair_key, created_at, updated_at)
             VALUES ('g1', 'group', 'active', 'a', NULL, '', ''),
                    ('g2', 'group', 'active', 'b', NULL, '', '')",
            [],
        )
        .unwrap();
    }
}
