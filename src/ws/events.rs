//! Server → client event taxonomy.
//!
//! Every externally visible mutation is broadcast as one of these after the
//! mutation has committed, never before. Timestamps are epoch millis;
//! chronological display is derived from them, never from arrival order.

use serde::Serialize;

use crate::calls::lifecycle::CallView;
use crate::chat::conversations::ConversationView;
use crate::chat::messages::{MessageView, UnreadCount};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        conversation_id: String,
        message: MessageView,
    },
    MessageDeleted {
        conversation_id: String,
        message_id: String,
    },
    MessageRestored {
        conversation_id: String,
        message: MessageView,
    },
    ReadReceipt {
        conversation_id: String,
        user_id: String,
        message_ids: Vec<String>,
    },
    ReactionAdded {
        conversation_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },
    ReactionRemoved {
        conversation_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },
    TypingStart {
        conversation_id: String,
        user_id: String,
    },
    TypingStop {
        conversation_id: String,
        user_id: String,
    },
    ChatRequestCreated {
        conversation: ConversationView,
    },
    ChatRequestAccepted {
        conversation_id: String,
        user_id: String,
    },
    ChatRequestDeclined {
        conversation_id: String,
        user_id: String,
    },
    ConversationUpdated {
        conversation: ConversationView,
    },
    IncomingCall {
        call: CallView,
    },
    CallAccepted {
        call: CallView,
    },
    CallDeclined {
        call: CallView,
    },
    CallEnded {
        call: CallView,
    },
    CallStatus {
        call: CallView,
    },
    PresenceOffline {
        user_id: String,
        timestamp: i64,
    },
    UnreadCounts {
        counts: Vec<UnreadCount>,
    },
    /// Optimistic client echoes relayed verbatim to the rest of the room.
    /// Authoritative state still flows through the HTTP path.
    EchoMessage {
        conversation_id: String,
        sender_id: String,
        payload: serde_json::Value,
    },
    EchoRead {
        conversation_id: String,
        sender_id: String,
        payload: serde_json::Value,
    },
    EchoDelete {
        conversation_id: String,
        sender_id: String,
        payload: serde_json::Value,
    },
}

impl ServerEvent {
    /// Serialize once for fan-out paths that bypass the room router.
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize server event");
                None
            }
        }
    }
}
