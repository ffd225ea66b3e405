use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Message, RoomId, UserId, UserUpdate};

/// Envelopes sent FROM client TO server over the room socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Subscription signal only. Acknowledged, never processed further.
    JoinRoom {
        #[serde(default)]
        sender_id: Option<UserId>,
    },

    /// A chat message to moderate, persist and broadcast
    Message { content: String, sender_id: UserId },
}

/// Events sent FROM server TO clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection is registered in the room
    Joined { room_id: RoomId },

    /// Most recent messages of the room, oldest first
    History {
        room_id: RoomId,
        messages: Vec<Message>,
    },

    /// A message was moderated and persisted
    NewMessage {
        message: Message,
        user_update: UserUpdate,
        quiz_results: Vec<Value>,
        report_results: Value,
    },

    /// The sender's last envelope was rejected. Only ever sent to the sender.
    Error { kind: ErrorKind, detail: String },
}

impl ServerEvent {
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            Self::Joined { room_id } | Self::History { room_id, .. } => Some(*room_id),
            Self::NewMessage { message, .. } => Some(message.room_id),
            Self::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Protocol,
    NotFound,
    Persistence,
    Timeout,
}
