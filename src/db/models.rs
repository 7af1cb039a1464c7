//! Database row types and domain enums.
//! These correspond 1:1 to the SQLite schema defined in migrations.rs.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// How long a soft-deleted message remains restorable.
pub const RESTORE_WINDOW_HOURS: i64 = 24;

/// Parse an RFC3339 timestamp column into epoch millis for the wire.
pub fn rfc3339_to_millis(ts: &str) -> i64 {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_default()
}

/// Canonical key for an unordered direct-conversation pair.
/// The lexicographically smaller id always comes first, so any two principals
/// map to exactly one key regardless of who opened the conversation.
pub fn canonical_pair(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

// --- Conversations ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Active,
    Requested,
    Declined,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Requested => "requested",
            Self::Declined => "declined",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "requested" => Some(Self::Requested),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }
}

/// Conversation record with the denormalized last-message snapshot.
#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub kind: ChatKind,
    pub status: ChatStatus,
    pub creator_id: String,
    pub pair_key: Option<String>,
    /// Set when the recipient explicitly accepted; NULL while the active
    /// status is merely derived from the follow relationship.
    pub accepted_at: Option<String>,
    pub last_message_id: Option<String>,
    pub last_message_sender_id: Option<String>,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<String>,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl ConversationRow {
    pub const COLUMNS: &'static str = "id, kind, status, creator_id, pair_key, accepted_at, \
         last_message_id, last_message_sender_id, last_message_text, last_message_at, \
         message_count, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get(1)?;
        let status: String = row.get(2)?;
        Ok(Self {
            id: row.get(0)?,
            kind: ChatKind::from_str(&kind).unwrap_or(ChatKind::Direct),
            status: ChatStatus::from_str(&status).unwrap_or(ChatStatus::Active),
            creator_id: row.get(3)?,
            pair_key: row.get(4)?,
            accepted_at: row.get(5)?,
            last_message_id: row.get(6)?,
            last_message_sender_id: row.get(7)?,
            last_message_text: row.get(8)?,
            last_message_at: row.get(9)?,
            message_count: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

// --- Messages ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    File,
    Location,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
            Self::Location => "location",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "file" => Some(Self::File),
            "location" => Some(Self::Location),
            _ => None,
        }
    }
}

/// Deletion state of a message as a tagged variant, so the restore-window
/// check is total instead of juggling a flag plus nullable columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageState {
    Active,
    Deleted {
        at: DateTime<Utc>,
        original_body: String,
    },
}

impl MessageState {
    /// Whether a deleted message may still be restored at `now`.
    pub fn restorable_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Active => false,
            Self::Deleted { at, .. } => now - *at <= Duration::hours(RESTORE_WINDOW_HOURS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub message_type: MessageType,
    pub media_url: Option<String>,
    pub reply_to_id: Option<String>,
    pub created_at: String,
    pub deleted: bool,
    pub deleted_at: Option<String>,
    pub original_body: Option<String>,
}

impl MessageRow {
    pub const COLUMNS: &'static str = "id, conversation_id, sender_id, body, message_type, media_url, reply_to_id, \
         created_at, deleted, deleted_at, original_body";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let message_type: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            body: row.get(3)?,
            message_type: MessageType::from_str(&message_type).unwrap_or(MessageType::Text),
            media_url: row.get(5)?,
            reply_to_id: row.get(6)?,
            created_at: row.get(7)?,
            deleted: row.get::<_, i64>(8)? != 0,
            deleted_at: row.get(9)?,
            original_body: row.get(10)?,
        })
    }

    pub fn state(&self) -> MessageState {
        if !self.deleted {
            return MessageState::Active;
        }
        let at = self
            .deleted_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        MessageState::Deleted {
            at,
            original_body: self.original_body.clone().unwrap_or_default(),
        }
    }
}

// --- Calls ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Connecting,
    Active,
    Ended,
    Declined,
    Missed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Declined => "declined",
            Self::Missed => "missed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(Self::Initiated),
            "ringing" => Some(Self::Ringing),
            "connecting" => Some(Self::Connecting),
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            "declined" => Some(Self::Declined),
            "missed" => Some(Self::Missed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Missed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMedia {
    Voice,
    Video,
}

impl CallMedia {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "voice" => Some(Self::Voice),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallRow {
    pub id: String,
    pub conversation_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub media: CallMedia,
    pub status: CallStatus,
    pub initiated_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub end_reason: Option<String>,
    pub ended_by: Option<String>,
    pub relay_session_id: Option<String>,
}

impl CallRow {
    pub const COLUMNS: &'static str = "id, conversation_id, caller_id, callee_id, media, status, initiated_at, \
         started_at, ended_at, end_reason, ended_by, relay_session_id";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let media: String = row.get(4)?;
        let status: String = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            caller_id: row.get(2)?,
            callee_id: row.get(3)?,
            media: CallMedia::from_str(&media).unwrap_or(CallMedia::Voice),
            status: CallStatus::from_str(&status).unwrap_or(CallStatus::Failed),
            initiated_at: row.get(6)?,
            started_at: row.get(7)?,
            ended_at: row.get(8)?,
            end_reason: row.get(9)?,
            ended_by: row.get(10)?,
            relay_session_id: row.get(11)?,
        })
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.callee_id == user_id
    }

    /// Whole seconds between started_at and ended_at. Zero until both are
    /// stamped (end backfills started_at for never-connected calls).
    pub fn duration_seconds(&self) -> i64 {
        let (Some(started), Some(ended)) = (self.started_at.as_deref(), self.ended_at.as_deref())
        else {
            return 0;
        };
        let started = DateTime::parse_from_rfc3339(started).map(|d| d.with_timezone(&Utc));
        let ended = DateTime::parse_from_rfc3339(ended).map(|d| d.with_timezone(&Utc));
        match (started, ended) {
            (Ok(s), Ok(e)) => (e - s).num_seconds().max(0),
            _ => 0,
        }
    }
}

// --- Presence ---

#[derive(Debug, Clone)]
pub struct PresenceRow {
    pub user_id: String,
    pub connection_id: String,
    pub process_id: String,
    pub connected_at: String,
    pub expires_at: String,
}

// --- Push subscriptions ---

#[derive(Debug, Clone)]
pub struct PushSubscriptionRow {
    pub id: String,
    pub user_id: String,
    pub endpoint: String,
    pub key_p256dh: String,
    pub key_auth: String,
    pub active: bool,
}
