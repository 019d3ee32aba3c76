//! Wire format for the relay socket.
//!
//! Every frame is a JSON text message shaped `{"event": "<name>", "data": {...}}`
//! with camelCase payload fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{auth::Identity, registry::ConnectionId, rooms::msg::{ChatMessage, HistoryEntry}, RelayError};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientCommand {
    JoinRoom(RoomQuery),
    LeaveRoom(RoomQuery),
    Signal(SignalQuery),
    ChatMessage(SendMessageQuery),
    GetHistory(HistoryQuery),
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        use ClientCommand::*;
        match self {
            JoinRoom(_) => "join-room",
            LeaveRoom(_) => "leave-room",
            Signal(_) => "signal",
            ChatMessage(_) => "chat-message",
            GetHistory(_) => "get-history",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomQuery {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalQuery {
    pub to: Option<ConnectionId>,
    #[serde(default)]
    pub data: Value,
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageQuery {
    pub room_id: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub room_id: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Connected {
        connection_id: ConnectionId,
        identity: Identity,
    },
    UserJoined {
        connection_id: ConnectionId,
        identity: Identity,
    },
    UserLeft {
        connection_id: ConnectionId,
        identity: Identity,
    },
    Signal {
        from: ConnectionId,
        data: Value,
    },
    ChatMessage(ChatMessage),
    History {
        room_id: String,
        messages: Vec<HistoryEntry>,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl From<&RelayError> for ServerEvent {
    fn from(err: &RelayError) -> Self {
        ServerEvent::Error {
            kind: err.kind().to_owned(),
            message: err.to_string(),
        }
    }
}
