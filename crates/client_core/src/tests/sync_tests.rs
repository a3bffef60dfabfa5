use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{MessageId, RoomId, RoomKey, UserId},
    protocol::{HistoryPage, MessageRecord, PageInfo, SenderRef, ServerFrame},
};
use tokio::sync::mpsc;

use super::*;
use crate::{
    gatekeeper::RoomGatekeeper,
    rest::MembershipApi,
    test_support::{connected_manager, test_settings, MockLinkHandles, MockTransport},
};

struct AlwaysMember;

#[async_trait]
impl MembershipApi for AlwaysMember {
    async fn check_membership(&self, _user_id: UserId, _room_id: RoomId) -> Result<bool> {
        Ok(true)
    }
}

struct ScriptedHistory {
    pages: StdMutex<HashMap<(RoomKey, u32), HistoryPage>>,
    slow_room: Option<(RoomKey, Duration)>,
}

impl ScriptedHistory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: StdMutex::new(HashMap::new()),
            slow_room: None,
        })
    }

    fn with_slow_room(room: RoomKey, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            pages: StdMutex::new(HashMap::new()),
            slow_room: Some((room, delay)),
        })
    }

    fn script(&self, room: RoomKey, page: u32, response: HistoryPage) {
        self.pages
            .lock()
            .expect("pages")
            .insert((room, page), response);
    }
}

#[async_trait]
impl crate::rest::HistoryApi for ScriptedHistory {
    async fn fetch_page(&self, room: RoomKey, page: u32, _page_size: u32) -> Result<HistoryPage> {
        if let Some((slow_room, delay)) = self.slow_room {
            if slow_room == room {
                tokio::time::sleep(delay).await;
            }
        }
        self.pages
            .lock()
            .expect("pages")
            .get(&(room, page))
            .cloned()
            .ok_or_else(|| anyhow!("no scripted page {page} for room {room}"))
    }
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_770_000_000 + seconds, 0).unwrap()
}

fn record(id: i64, room: RoomKey, seconds: i64) -> MessageRecord {
    MessageRecord {
        id: MessageId(id),
        room_id: room.room_id,
        room_kind: room.kind,
        author_id: UserId(40),
        author_name: Some("alice".to_string()),
        sender: None,
        content: format!("message {id}"),
        created_at: at(seconds),
    }
}

fn page_of(messages: Vec<MessageRecord>, page: u32, has_more: bool) -> HistoryPage {
    let limit = messages.len() as u32;
    HistoryPage {
        messages,
        pagination: PageInfo {
            page,
            limit,
            total: 0,
            total_pages: 0,
            has_more,
        },
    }
}

struct SyncFixture {
    _manager: Arc<crate::connection::ConnectionManager>,
    gatekeeper: Arc<RoomGatekeeper>,
    sync: Arc<MessageSynchronizer>,
    link: MockLinkHandles,
    _transport: Arc<MockTransport>,
    _handles_rx: mpsc::UnboundedReceiver<MockLinkHandles>,
}

async fn fixture(history: Arc<ScriptedHistory>) -> SyncFixture {
    let (manager, transport, handles_rx, link) = connected_manager().await;
    let gatekeeper = RoomGatekeeper::new(Arc::clone(&manager), Arc::new(AlwaysMember));
    let sync = MessageSynchronizer::new(
        Arc::clone(&manager),
        history,
        Arc::clone(&gatekeeper),
        &test_settings(),
    );
    SyncFixture {
        _manager: manager,
        gatekeeper,
        sync,
        link,
        _transport: transport,
        _handles_rx: handles_rx,
    }
}

fn ids(snapshot: &WindowSnapshot) -> Vec<i64> {
    snapshot.messages.iter().map(|m| m.id.0).collect()
}

async fn wait_for_append(updates: &mut tokio::sync::broadcast::Receiver<WindowUpdate>, id: i64) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match updates.recv().await.expect("updates channel closed") {
                WindowUpdate::Appended { id: got } if got.0 == id => return,
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for an appended message");
}

#[tokio::test]
async fn two_history_pages_and_a_push_merge_in_order() {
    let room = RoomKey::community(RoomId(1));
    let history = ScriptedHistory::new();
    // Page 1 is the most recent slice; page 2 is older.
    history.script(
        room,
        1,
        page_of((6..=25).map(|id| record(id, room, id)).collect(), 1, true),
    );
    history.script(
        room,
        2,
        page_of((1..=5).map(|id| record(id, room, id)).collect(), 2, false),
    );
    let fixture = fixture(history).await;
    let mut updates = fixture.sync.updates();

    fixture.sync.enter_room(room).await;
    fixture.sync.load_first_page().await.expect("first page");
    fixture.sync.load_more().await.expect("second page");

    fixture.link.push(ServerFrame::NewMessage {
        message: record(26, room, 26),
    });
    wait_for_append(&mut updates, 26).await;

    let snapshot = fixture.sync.window_snapshot().await;
    assert_eq!(ids(&snapshot), (1..=26).collect::<Vec<_>>());
    assert!(!snapshot.has_more);
    // Chronological order holds across the prepended page and the push.
    let times: Vec<_> = snapshot.messages.iter().map(|m| m.created_at).collect();
    assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn duplicate_push_leaves_the_window_unchanged() {
    let room = RoomKey::community(RoomId(1));
    let history = ScriptedHistory::new();
    history.script(
        room,
        1,
        page_of((1..=3).map(|id| record(id, room, id)).collect(), 1, false),
    );
    let fixture = fixture(history).await;
    let mut updates = fixture.sync.updates();

    fixture.sync.enter_room(room).await;
    fixture.sync.load_first_page().await.expect("first page");

    // Same id as a loaded message, then a genuinely new one.
    fixture.link.push(ServerFrame::NewMessage {
        message: record(2, room, 2),
    });
    fixture.link.push(ServerFrame::NewMessage {
        message: record(99, room, 99),
    });
    wait_for_append(&mut updates, 99).await;

    let snapshot = fixture.sync.window_snapshot().await;
    assert_eq!(ids(&snapshot), vec![1, 2, 3, 99]);
}

#[tokio::test]
async fn load_more_is_a_noop_without_more_pages() {
    let room = RoomKey::community(RoomId(1));
    let history = ScriptedHistory::new();
    history.script(
        room,
        1,
        page_of(vec![record(1, room, 1)], 1, false),
    );
    let fixture = fixture(history).await;

    fixture.sync.enter_room(room).await;
    fixture.sync.load_first_page().await.expect("first page");
    // No page 2 is scripted; a real fetch would error.
    fixture.sync.load_more().await.expect("noop");

    assert_eq!(ids(&fixture.sync.window_snapshot().await), vec![1]);
}

#[tokio::test]
async fn stale_fetch_from_previous_room_never_lands() {
    let r1 = RoomKey::community(RoomId(1));
    let r2 = RoomKey::community(RoomId(2));
    let history = ScriptedHistory::with_slow_room(r1, Duration::from_millis(80));
    history.script(
        r1,
        1,
        page_of((1..=3).map(|id| record(id, r1, id)).collect(), 1, false),
    );
    history.script(
        r2,
        1,
        page_of((10..=12).map(|id| record(id, r2, id)).collect(), 1, false),
    );
    let fixture = fixture(history).await;

    fixture.sync.enter_room(r1).await;
    let sync = Arc::clone(&fixture.sync);
    let stale_fetch = tokio::spawn(async move { sync.load_first_page().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    fixture.sync.enter_room(r2).await;
    fixture.sync.load_first_page().await.expect("r2 page");

    // The stale fetch resolves without touching the new room's window.
    stale_fetch
        .await
        .expect("join")
        .expect("stale fetch is dropped, not an error");
    let snapshot = fixture.sync.window_snapshot().await;
    assert_eq!(ids(&snapshot), vec![10, 11, 12]);
}

#[tokio::test]
async fn author_names_are_normalized_on_both_paths() {
    let room = RoomKey::community(RoomId(1));
    let history = ScriptedHistory::new();
    let mut rest_record = record(1, room, 1);
    rest_record.author_name = None;
    rest_record.sender = Some(SenderRef {
        user_id: UserId(40),
        user_name: Some("bob".to_string()),
    });
    history.script(room, 1, page_of(vec![rest_record], 1, false));
    let fixture = fixture(history).await;
    let mut updates = fixture.sync.updates();

    fixture.sync.enter_room(room).await;
    fixture.sync.load_first_page().await.expect("first page");

    let mut push_record = record(2, room, 2);
    push_record.author_name = None;
    push_record.sender = None;
    fixture.link.push(ServerFrame::NewMessage {
        message: push_record,
    });
    wait_for_append(&mut updates, 2).await;

    let snapshot = fixture.sync.window_snapshot().await;
    let names: Vec<_> = snapshot
        .messages
        .iter()
        .map(|m| m.author_name.as_str())
        .collect();
    assert_eq!(names, vec!["bob", "Unknown"]);
}

#[tokio::test]
async fn push_for_another_room_is_dropped() {
    let r1 = RoomKey::community(RoomId(1));
    let history = ScriptedHistory::new();
    history.script(r1, 1, page_of(vec![], 1, false));
    let fixture = fixture(history).await;
    let mut updates = fixture.sync.updates();

    fixture.sync.enter_room(r1).await;
    fixture.sync.load_first_page().await.expect("first page");

    // Same id space, wrong room; then a clan room with the same numeric id.
    fixture.link.push(ServerFrame::NewMessage {
        message: record(50, RoomKey::community(RoomId(2)), 50),
    });
    fixture.link.push(ServerFrame::NewMessage {
        message: record(51, RoomKey::clan(RoomId(1)), 51),
    });
    fixture.link.push(ServerFrame::NewMessage {
        message: record(52, r1, 52),
    });
    wait_for_append(&mut updates, 52).await;

    assert_eq!(ids(&fixture.sync.window_snapshot().await), vec![52]);
}

#[tokio::test]
async fn send_message_is_validated_locally() {
    let room = RoomKey::community(RoomId(1));
    let history = ScriptedHistory::new();
    history.script(room, 1, page_of(vec![], 1, false));
    let mut fixture = fixture(history).await;

    // No active room yet.
    let err = fixture.sync.send_message("hi").await.expect_err("no room");
    assert!(matches!(err, SyncError::NoActiveRoom));

    fixture.sync.enter_room(room).await;

    let err = fixture.sync.send_message("   ").await.expect_err("blank");
    assert!(matches!(err, SyncError::EmptyMessage));

    // Entered but never granted through the gatekeeper.
    let err = fixture.sync.send_message("hi").await.expect_err("no grant");
    assert!(matches!(err, SyncError::AccessNotGranted));
    fixture.link.expect_no_frame().await;
}

#[tokio::test]
async fn send_message_emits_and_does_not_insert_locally() {
    let room = RoomKey::community(RoomId(1));
    let history = ScriptedHistory::new();
    history.script(room, 1, page_of(vec![], 1, false));
    let mut fixture = fixture(history).await;
    let mut updates = fixture.sync.updates();

    let mut rx = fixture.gatekeeper.request_room(room).await;
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|sub| sub.joined))
        .await
        .expect("join timeout")
        .expect("watch closed");
    let _join = fixture.link.expect_frame().await;

    fixture.sync.enter_room(room).await;
    fixture.sync.load_first_page().await.expect("first page");
    fixture.sync.send_message("hello").await.expect("send");

    assert_eq!(
        fixture.link.expect_frame().await,
        ClientFrame::SendMessage {
            room_kind: room.kind,
            room_id: room.room_id,
            content: "hello".to_string(),
        }
    );
    // The message appears only via the push echo.
    assert!(fixture.sync.window_snapshot().await.messages.is_empty());

    fixture.link.push(ServerFrame::NewMessage {
        message: record(7, room, 7),
    });
    wait_for_append(&mut updates, 7).await;
    assert_eq!(ids(&fixture.sync.window_snapshot().await), vec![7]);
}

#[tokio::test]
async fn failed_fetch_leaves_the_window_untouched() {
    let room = RoomKey::community(RoomId(1));
    let history = ScriptedHistory::new();
    history.script(
        room,
        1,
        page_of((1..=2).map(|id| record(id, room, id)).collect(), 1, true),
    );
    // Page 2 is intentionally unscripted: the fetch fails.
    let fixture = fixture(history).await;

    fixture.sync.enter_room(room).await;
    fixture.sync.load_first_page().await.expect("first page");

    let err = fixture.sync.load_more().await.expect_err("fetch fails");
    assert!(matches!(err, SyncError::History(_)));

    let snapshot = fixture.sync.window_snapshot().await;
    assert_eq!(ids(&snapshot), vec![1, 2]);
    assert!(snapshot.has_more);
}

#[tokio::test]
async fn entering_a_room_resets_the_previous_window() {
    let r1 = RoomKey::community(RoomId(1));
    let r2 = RoomKey::clan(RoomId(1));
    let history = ScriptedHistory::new();
    history.script(r1, 1, page_of(vec![record(1, r1, 1)], 1, false));
    history.script(r2, 1, page_of(vec![record(9, r2, 9)], 1, false));
    let fixture = fixture(history).await;

    fixture.sync.enter_room(r1).await;
    fixture.sync.load_first_page().await.expect("r1 page");
    assert_eq!(ids(&fixture.sync.window_snapshot().await), vec![1]);

    fixture.sync.enter_room(r2).await;
    assert!(fixture.sync.window_snapshot().await.messages.is_empty());
    fixture.sync.load_first_page().await.expect("r2 page");
    assert_eq!(ids(&fixture.sync.window_snapshot().await), vec![9]);
}
