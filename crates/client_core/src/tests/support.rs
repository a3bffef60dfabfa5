use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{Identity, UserId},
    protocol::{ClientFrame, ServerFrame},
};
use tokio::sync::{broadcast, mpsc};
use url::Url;

use crate::{
    config::Settings,
    connection::{
        ConnectionEvent, ConnectionManager, PushLink, PushSink, PushSource, PushTransport,
    },
};

/// Tests opt into log output with RUST_LOG; repeated init attempts are fine.
pub(crate) fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub(crate) fn test_settings() -> Settings {
    Settings {
        handshake_timeout: Duration::from_millis(500),
        reconnect_max_attempts: 3,
        reconnect_initial_delay: Duration::from_millis(5),
        ..Settings::default()
    }
}

pub(crate) fn test_identity() -> Identity {
    Identity::new(UserId(7), "session-token")
}

/// Test-side handles for one established mock link: capture what the
/// client sent, inject server frames. Dropping the handles severs the
/// link, which the manager sees as transport loss.
pub(crate) struct MockLinkHandles {
    pub outbound: mpsc::UnboundedReceiver<ClientFrame>,
    pub inbound: mpsc::UnboundedSender<Result<ServerFrame>>,
}

impl MockLinkHandles {
    pub fn push(&self, frame: ServerFrame) {
        self.inbound.send(Ok(frame)).expect("inject frame");
    }

    pub async fn expect_frame(&mut self) -> ClientFrame {
        tokio::time::timeout(Duration::from_secs(1), self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("link closed")
    }

    pub async fn expect_no_frame(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(frame) = self.outbound.try_recv() {
            panic!("unexpected outbound frame: {frame:?}");
        }
    }
}

pub(crate) struct MockTransport {
    state: StdMutex<MockTransportState>,
}

struct MockTransportState {
    fail_next: u32,
    connect_attempts: u32,
    handles_tx: mpsc::UnboundedSender<MockLinkHandles>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockLinkHandles>) {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                state: StdMutex::new(MockTransportState {
                    fail_next: 0,
                    connect_attempts: 0,
                    handles_tx,
                }),
            }),
            handles_rx,
        )
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().expect("transport state").fail_next = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().expect("transport state").connect_attempts
    }
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn connect(&self, _url: &Url, _identity: &Identity) -> Result<PushLink> {
        let mut state = self.state.lock().expect("transport state");
        state.connect_attempts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(anyhow!("scripted connect failure"));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = state.handles_tx.send(MockLinkHandles {
            outbound: out_rx,
            inbound: in_tx,
        });
        Ok(PushLink {
            sink: Box::new(MockSink { tx: out_tx }),
            source: Box::new(MockSource { rx: in_rx }),
        })
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<ClientFrame>,
}

#[async_trait]
impl PushSink for MockSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        self.tx.send(frame).map_err(|_| anyhow!("link severed"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<Result<ServerFrame>>,
}

#[async_trait]
impl PushSource for MockSource {
    async fn next_frame(&mut self) -> Option<Result<ServerFrame>> {
        self.rx.recv().await
    }
}

pub(crate) async fn next_link(
    handles_rx: &mut mpsc::UnboundedReceiver<MockLinkHandles>,
) -> MockLinkHandles {
    tokio::time::timeout(Duration::from_secs(2), handles_rx.recv())
        .await
        .expect("timed out waiting for a link")
        .expect("transport dropped")
}

/// A manager that has already completed its first handshake.
pub(crate) async fn connected_manager() -> (
    Arc<ConnectionManager>,
    Arc<MockTransport>,
    mpsc::UnboundedReceiver<MockLinkHandles>,
    MockLinkHandles,
) {
    init_tracing();
    let (transport, mut handles_rx) = MockTransport::new();
    let transport_seam: Arc<dyn PushTransport> = transport.clone();
    let manager = ConnectionManager::new(&test_settings(), transport_seam).expect("manager");
    manager.connect(test_identity()).await.expect("connect");
    let link = next_link(&mut handles_rx).await;
    (manager, transport, handles_rx, link)
}

pub(crate) async fn expect_event(
    rx: &mut broadcast::Receiver<ConnectionEvent>,
    expected: ConnectionEvent,
) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a lifecycle event")
            .expect("lifecycle channel closed");
        if event == expected {
            return;
        }
    }
}
