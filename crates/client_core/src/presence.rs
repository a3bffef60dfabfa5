use std::sync::Arc;

use shared::{
    domain::{RoomId, UserId},
    protocol::{ClientFrame, ServerFrame},
};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::debug;

use crate::connection::ConnectionManager;

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
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
}

/// Fire-and-forget pub/sub of ephemeral events. Best-effort by contract:
/// lack of delivery is not an error and there is no state machine.
pub struct PresenceChannel {
    connection: Arc<ConnectionManager>,
}

impl PresenceChannel {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    pub async fn send_typing(&self, room_id: RoomId, is_typing: bool) {
        if let Err(err) = self
            .connection
            .send(ClientFrame::Typing { room_id, is_typing })
            .await
        {
            debug!(room_id = room_id.0, "typing indicator dropped: {err}");
        }
    }

    /// Mapped view of the frame fan-out; non-presence frames are filtered
    /// out, and lagged receivers simply lose events.
    pub fn events(&self) -> impl Stream<Item = PresenceEvent> {
        BroadcastStream::new(self.connection.frames()).filter_map(|frame| match frame {
            Ok(ServerFrame::Typing {
                room_id,
                user_id,
                is_typing,
            }) => Some(PresenceEvent::Typing {
                room_id,
                user_id,
                is_typing,
            }),
            Ok(ServerFrame::UserJoined { user_id, user_name }) => {
                Some(PresenceEvent::UserJoined { user_id, user_name })
            }
            Ok(ServerFrame::UserLeft { user_id, user_name }) => {
                Some(PresenceEvent::UserLeft { user_id, user_name })
            }
            Ok(_) => None,
            // Lagged receivers lose events; presence is best-effort.
            Err(_) => None,
        })
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
