use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};

use shared::{
    domain::{MessageId, RoomKey},
    protocol::{ClientFrame, Message, MessageRecord, PageInfo, ServerFrame},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    connection::{ConnectionError, ConnectionManager},
    gatekeeper::{AccessState, RoomGatekeeper},
    rest::HistoryApi,
};

/// Ordered, deduplicated in-memory message cache for one active room.
/// History prepends, live push appends; the two never reorder each other.
#[derive(Debug, Default)]
pub struct MessageWindow {
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    next_page: u32,
    has_more: bool,
}

impl MessageWindow {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    fn reset(&mut self) {
        self.messages.clear();
        self.seen.clear();
        self.next_page = 1;
        self.has_more = false;
    }

    /// Install page 1 as the window's past. Live messages that arrived
    /// while the fetch was in flight stay appended after it; overlapping
    /// ids collapse onto the history copy.
    fn install_first_page(&mut self, batch: Vec<Message>, info: &PageInfo) -> usize {
        let live = std::mem::take(&mut self.messages);
        self.seen.clear();
        let mut installed = 0;
        for message in batch {
            if self.seen.insert(message.id) {
                self.messages.push(message);
                installed += 1;
            }
        }
        for message in live {
            if self.seen.insert(message.id) {
                self.messages.push(message);
            }
        }
        self.has_more = info.has_more;
        self.next_page = info.page + 1;
        installed
    }

    /// Prepend an older page, keeping the batch's own chronological order
    /// and dropping ids already present.
    fn prepend_older(&mut self, batch: Vec<Message>, info: &PageInfo) -> usize {
        let mut fresh = Vec::with_capacity(batch.len());
        for message in batch {
            if self.seen.insert(message.id) {
                fresh.push(message);
            }
        }
        let count = fresh.len();
        self.messages.splice(0..0, fresh);
        self.has_more = info.has_more;
        self.next_page = info.page + 1;
        count
    }

    /// Append a pushed message; returns false for duplicates.
    fn append_live(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowUpdate {
    Reset,
    HistoryLoaded { count: usize },
    OlderLoaded { count: usize },
    Appended { id: MessageId },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no active room")]
    NoActiveRoom,
    #[error("message content is empty")]
    EmptyMessage,
    #[error("room access is not granted")]
    AccessNotGranted,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("history fetch failed: {0}")]
    History(#[source] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Merges paged REST history with live push into one consistent feed per
/// active room. All commits are guarded by the (room, generation) captured
/// when the work started, so a room switch can never let stale data into
/// the new room's window.
pub struct MessageSynchronizer {
    connection: Arc<ConnectionManager>,
    history: Arc<dyn HistoryApi>,
    gatekeeper: Arc<RoomGatekeeper>,
    page_size: u32,
    inner: Mutex<SyncInner>,
    updates: broadcast::Sender<WindowUpdate>,
}

struct SyncInner {
    active: Option<RoomKey>,
    generation: u64,
    window: MessageWindow,
    loading: bool,
}

impl MessageSynchronizer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        history: Arc<dyn HistoryApi>,
        gatekeeper: Arc<RoomGatekeeper>,
        settings: &Settings,
    ) -> Arc<Self> {
        let frames = connection.frames();
        let (updates, _) = broadcast::channel(256);
        let sync = Arc::new(Self {
            connection,
            history,
            gatekeeper,
            page_size: settings.history_page_size,
            inner: Mutex::new(SyncInner {
                active: None,
                generation: 0,
                window: MessageWindow::default(),
                loading: false,
            }),
            updates,
        });
        tokio::spawn(run_intake(Arc::downgrade(&sync), frames));
        sync
    }

    pub fn updates(&self) -> broadcast::Receiver<WindowUpdate> {
        self.updates.subscribe()
    }

    pub async fn window_snapshot(&self) -> WindowSnapshot {
        let inner = self.inner.lock().await;
        WindowSnapshot {
            messages: inner.window.messages().to_vec(),
            has_more: inner.window.has_more(),
        }
    }

    /// Make `room` the active room: reset the window and invalidate every
    /// in-flight fetch belonging to the previous room key.
    pub async fn enter_room(&self, room: RoomKey) {
        {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.active = Some(room);
            inner.window.reset();
            inner.loading = false;
        }
        let _ = self.updates.send(WindowUpdate::Reset);
        info!(%room, "entered room");
    }

    pub async fn leave_room(&self) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        inner.active = None;
        inner.window.reset();
        inner.loading = false;
    }

    /// Fetch page 1 and install it as the window's history.
    pub async fn load_first_page(&self) -> Result<(), SyncError> {
        let (room, generation) = {
            let mut inner = self.inner.lock().await;
            let room = inner.active.ok_or(SyncError::NoActiveRoom)?;
            inner.loading = true;
            (room, inner.generation)
        };

        let result = self.history.fetch_page(room, 1, self.page_size).await;

        let count = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                debug!(%room, "first page resolved after a room switch; dropped");
                return Ok(());
            }
            inner.loading = false;
            let page = result.map_err(SyncError::History)?;
            let batch: Vec<Message> = page
                .messages
                .into_iter()
                .map(MessageRecord::normalize)
                .collect();
            inner.window.install_first_page(batch, &page.pagination)
        };
        let _ = self.updates.send(WindowUpdate::HistoryLoaded { count });
        Ok(())
    }

    /// Fetch the next older page. No-op when there is nothing more or a
    /// load is already in flight.
    pub async fn load_more(&self) -> Result<(), SyncError> {
        let (room, generation, page) = {
            let mut inner = self.inner.lock().await;
            let room = inner.active.ok_or(SyncError::NoActiveRoom)?;
            if !inner.window.has_more() || inner.loading {
                return Ok(());
            }
            inner.loading = true;
            (room, inner.generation, inner.window.next_page())
        };

        let result = self.history.fetch_page(room, page, self.page_size).await;

        let count = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                debug!(%room, "older page resolved after a room switch; dropped");
                return Ok(());
            }
            inner.loading = false;
            let page = result.map_err(SyncError::History)?;
            let batch: Vec<Message> = page
                .messages
                .into_iter()
                .map(MessageRecord::normalize)
                .collect();
            inner.window.prepend_older(batch, &page.pagination)
        };
        let _ = self.updates.send(WindowUpdate::OlderLoaded { count });
        Ok(())
    }

    /// Emit a message over the push channel. The send path never inserts a
    /// local copy; the message materializes through the push echo.
    pub async fn send_message(&self, content: &str) -> Result<(), SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let room = {
            let inner = self.inner.lock().await;
            inner.active.ok_or(SyncError::NoActiveRoom)?
        };
        if self.gatekeeper.access_state(room).await != AccessState::Granted {
            return Err(SyncError::AccessNotGranted);
        }
        self.connection
            .send(ClientFrame::SendMessage {
                room_kind: room.kind,
                room_id: room.room_id,
                content: content.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn apply_push(&self, record: MessageRecord) {
        let update = {
            let mut inner = self.inner.lock().await;
            let Some(active) = inner.active else {
                return;
            };
            if record.room_id != active.room_id || record.room_kind != active.kind {
                debug!(
                    room_id = record.room_id.0,
                    "push event for an inactive room dropped"
                );
                return;
            }
            let message = record.normalize();
            let id = message.id;
            if inner.window.append_live(message) {
                Some(WindowUpdate::Appended { id })
            } else {
                debug!(message_id = id.0, "duplicate push event discarded");
                None
            }
        };
        if let Some(update) = update {
            let _ = self.updates.send(update);
        }
    }
}

async fn run_intake(weak: Weak<MessageSynchronizer>, mut frames: broadcast::Receiver<ServerFrame>) {
    loop {
        match frames.recv().await {
            Ok(ServerFrame::NewMessage { message }) => {
                let Some(sync) = weak.upgrade() else { return };
                sync.apply_push(message).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "message intake lagged behind push frames");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
