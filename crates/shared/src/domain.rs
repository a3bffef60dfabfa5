use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(RoomId);
id_newtype!(MessageId);

/// Client-generated identifier for one AI chat conversation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Community,
    Clan,
}

impl RoomKind {
    /// Restricted kinds require a membership check before subscribing.
    pub fn is_restricted(self) -> bool {
        matches!(self, RoomKind::Clan)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoomKind::Community => "community",
            RoomKind::Clan => "clan",
        }
    }
}

/// One room, fully qualified: the same numeric id may exist for both kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    pub kind: RoomKind,
    pub room_id: RoomId,
}

impl RoomKey {
    pub fn community(room_id: RoomId) -> Self {
        Self {
            kind: RoomKind::Community,
            room_id,
        }
    }

    pub fn clan(room_id: RoomId) -> Self {
        Self {
            kind: RoomKind::Clan,
            room_id,
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.room_id.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Credentials bound to the push channel before each connect attempt.
/// Issuance is out of scope; the token is assumed to already exist.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub session_token: String,
}

impl Identity {
    pub fn new(user_id: UserId, session_token: impl Into<String>) -> Self {
        Self {
            user_id,
            session_token: session_token.into(),
        }
    }
}

// Session tokens must not end up in logs.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("session_token", &"<redacted>")
            .finish()
    }
}
