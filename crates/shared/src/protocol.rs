use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatRole, MessageId, RoomId, RoomKind, SessionId, UserId},
    error::{AiErrorCode, DenyReason},
};

/// One turn of an AI conversation, as echoed back to the server on
/// every `ai:send` so the exchange is stateless server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTurn {
    pub role: ChatRole,
    pub content: String,
}

impl PromptTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Author reference embedded in a message record when the flat
/// `authorName` field is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderRef {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// A message as it appears on the wire, from either the history API or a
/// `new-message` push. Author naming is inconsistent between sources;
/// [`MessageRecord::normalize`] is the single place that resolves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: RoomId,
    pub room_kind: RoomKind,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderRef>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub const UNKNOWN_AUTHOR: &str = "Unknown";

impl MessageRecord {
    /// Resolve the author display name: flat field, then embedded sender,
    /// then a fixed fallback. The window never stores a partially
    /// normalized record.
    pub fn normalize(self) -> Message {
        let author_name = self
            .author_name
            .filter(|name| !name.trim().is_empty())
            .or_else(|| {
                self.sender
                    .and_then(|sender| sender.user_name)
                    .filter(|name| !name.trim().is_empty())
            })
            .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());

        Message {
            id: self.id,
            room_id: self.room_id,
            room_kind: self.room_kind,
            author_id: self.author_id,
            author_name,
            content: self.content,
            created_at: self.created_at,
        }
    }
}

/// A fully normalized message. Identity is `id`: two messages with the same
/// id are the same message regardless of source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub room_kind: RoomKind,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Pagination cursor returned by the history API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<MessageRecord>,
    pub pagination: PageInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipStatus {
    pub is_member: bool,
}

/// Limits exposed by the AI config service, used for local precondition
/// checks before an `ai:send` touches the network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiChatConfig {
    pub max_prompt_chars: usize,
    pub cost_per_message: u32,
}

/// Outbound events on the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    JoinRoom {
        room_kind: RoomKind,
        room_id: RoomId,
    },
    LeaveRoom {
        room_kind: RoomKind,
        room_id: RoomId,
    },
    SendMessage {
        room_kind: RoomKind,
        room_id: RoomId,
        content: String,
    },
    Typing {
        room_id: RoomId,
        is_typing: bool,
    },
    #[serde(rename = "ai:send")]
    AiSend {
        session_id: SessionId,
        prompt: String,
        conversation_history: Vec<PromptTurn>,
    },
    #[serde(rename = "ai:cancel")]
    AiCancel { session_id: SessionId },
}

/// Inbound events on the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerFrame {
    NewMessage {
        message: MessageRecord,
    },
    AccessDenied {
        room_id: RoomId,
        code: DenyReason,
        message: String,
    },
    Typing {
        room_id: RoomId,
        user_id: UserId,
        is_typing: bool,
    },
    UserJoined {
        user_id: UserId,
        user_name: String,
    },
    UserLeft {
        user_id: UserId,
        user_name: String,
    },
    #[serde(rename = "ai:token-status")]
    AiTokenStatus {
        current_tokens: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_per_message: Option<u32>,
    },
    #[serde(rename = "ai:start")]
    AiStart { session_id: SessionId },
    #[serde(rename = "ai:chunk")]
    AiChunk {
        session_id: SessionId,
        chunk: String,
        index: u32,
    },
    #[serde(rename = "ai:complete")]
    AiComplete {
        session_id: SessionId,
        response: String,
        tokens_used: u32,
        remaining_tokens: u32,
        response_time: u64,
    },
    #[serde(rename = "ai:cancelled")]
    AiCancelled { session_id: SessionId },
    #[serde(rename = "ai:error")]
    AiError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        code: AiErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_tokens: Option<u32>,
    },
}
