use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::Identity,
    protocol::{ClientFrame, ServerFrame},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Settings;

const OUTBOUND_QUEUE_DEPTH: usize = 64;
const RECONNECT_DELAY_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Discrete lifecycle signals. `Disconnected` is terminal (explicit
/// disconnect or retry exhaustion); transient link loss shows up as
/// [`ConnectionState::Reconnecting`] on the state watch instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnected,
    ReconnectFailed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(#[source] anyhow::Error),
    #[error("push channel is not connected")]
    NotConnected,
}

/// Write half of an established push link.
#[async_trait]
pub trait PushSink: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Read half of an established push link. `None` means the server closed
/// the link.
#[async_trait]
pub trait PushSource: Send {
    async fn next_frame(&mut self) -> Option<Result<ServerFrame>>;
}

pub struct PushLink {
    pub sink: Box<dyn PushSink>,
    pub source: Box<dyn PushSource>,
}

/// Transport seam: production code uses the WebSocket implementation in
/// [`crate::transport`]; tests inject scripted links.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, url: &Url, identity: &Identity) -> Result<PushLink>;
}

/// Owns the single logical channel to the server: connect/disconnect,
/// credential binding, bounded reconnection, and fan-out of both lifecycle
/// events and inbound frames. Reconnection does not restore room or AI
/// subscriptions; those components observe `Reconnected` and re-issue
/// their own requests.
impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.url)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("reconnect_max_attempts", &self.reconnect_max_attempts)
            .field("reconnect_initial_delay", &self.reconnect_initial_delay)
            .finish_non_exhaustive()
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn PushTransport>,
    url: Url,
    handshake_timeout: Duration,
    reconnect_max_attempts: u32,
    reconnect_initial_delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
    lifecycle: broadcast::Sender<ConnectionEvent>,
    frames: broadcast::Sender<ServerFrame>,
    inner: Mutex<ConnectionInner>,
}

struct ConnectionInner {
    identity: Option<Identity>,
    /// Bumped by every connect/disconnect; supervisor tasks carry the value
    /// they were spawned with and exit silently once superseded.
    generation: u64,
    outbound: Option<mpsc::Sender<ClientFrame>>,
    supervisor: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(
        settings: &Settings,
        transport: Arc<dyn PushTransport>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let url = push_endpoint(&settings.server_url)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (lifecycle, _) = broadcast::channel(32);
        let (frames, _) = broadcast::channel(1024);
        Ok(Arc::new(Self {
            transport,
            url,
            handshake_timeout: settings.handshake_timeout,
            reconnect_max_attempts: settings.reconnect_max_attempts,
            reconnect_initial_delay: settings.reconnect_initial_delay,
            state_tx,
            lifecycle,
            frames,
            inner: Mutex::new(ConnectionInner {
                identity: None,
                generation: 0,
                outbound: None,
                supervisor: None,
            }),
        }))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn lifecycle_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.lifecycle.subscribe()
    }

    /// Fan-out of every inbound push frame, in transport delivery order.
    pub fn frames(&self) -> broadcast::Receiver<ServerFrame> {
        self.frames.subscribe()
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.inner.lock().await.identity.clone()
    }

    /// Establish the channel. Idempotent: a repeated call with the same
    /// identity while the channel is live is a no-op; a different identity
    /// tears the old link down first.
    pub async fn connect(self: &Arc<Self>, identity: Identity) -> Result<(), ConnectionError> {
        let generation = {
            let mut inner = self.inner.lock().await;
            let live = !matches!(self.state(), ConnectionState::Disconnected);
            if live && inner.identity.as_ref() == Some(&identity) {
                debug!("connect is a no-op: channel already live for this identity");
                return Ok(());
            }
            if let Some(task) = inner.supervisor.take() {
                task.abort();
            }
            inner.outbound = None;
            inner.generation += 1;
            inner.identity = Some(identity.clone());
            self.set_state(ConnectionState::Connecting);
            inner.generation
        };

        let link = match timeout(
            self.handshake_timeout,
            self.transport.connect(&self.url, &identity),
        )
        .await
        {
            Err(_) => {
                self.fail_connect(generation).await;
                return Err(ConnectionError::HandshakeTimeout(self.handshake_timeout));
            }
            Ok(Err(err)) => {
                self.fail_connect(generation).await;
                return Err(ConnectionError::Handshake(err));
            }
            Ok(Ok(link)) => link,
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                // Superseded while handshaking; the newer call owns the channel.
                return Ok(());
            }
            inner.outbound = Some(outbound_tx);
            let manager = Arc::clone(self);
            inner.supervisor = Some(tokio::spawn(async move {
                manager.run_link(generation, identity, link, outbound_rx).await;
            }));
            self.set_state(ConnectionState::Connected);
        }
        let _ = self.lifecycle.send(ConnectionEvent::Connected);
        info!("push channel connected");
        Ok(())
    }

    /// Tear the channel down. Idempotent.
    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.outbound = None;
            if let Some(task) = inner.supervisor.take() {
                task.abort();
            }
        }
        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            let _ = self.lifecycle.send(ConnectionEvent::Disconnected);
            info!("push channel disconnected");
        }
    }

    /// Emit an outbound frame. Rejected, never silently dropped, while the
    /// channel is anything but `Connected`.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), ConnectionError> {
        let tx = {
            let inner = self.inner.lock().await;
            match (self.state(), inner.outbound.clone()) {
                (ConnectionState::Connected, Some(tx)) => tx,
                _ => return Err(ConnectionError::NotConnected),
            }
        };
        tx.send(frame)
            .await
            .map_err(|_| ConnectionError::NotConnected)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    async fn fail_connect(&self, generation: u64) {
        let inner = self.inner.lock().await;
        if inner.generation == generation {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn run_link(
        self: Arc<Self>,
        generation: u64,
        identity: Identity,
        link: PushLink,
        outbound_rx: mpsc::Receiver<ClientFrame>,
    ) {
        let PushLink {
            mut sink,
            mut source,
        } = link;
        let mut outbound_rx = outbound_rx;

        loop {
            let lost = loop {
                tokio::select! {
                    inbound = source.next_frame() => match inbound {
                        Some(Ok(frame)) => {
                            let _ = self.frames.send(frame);
                        }
                        Some(Err(err)) => {
                            warn!("push channel receive failed: {err}");
                            break true;
                        }
                        None => {
                            debug!("push channel closed by server");
                            break true;
                        }
                    },
                    outbound = outbound_rx.recv() => match outbound {
                        Some(frame) => {
                            if let Err(err) = sink.send(frame).await {
                                warn!("push channel send failed: {err}");
                                break true;
                            }
                        }
                        // Sender dropped by disconnect: orderly teardown.
                        None => {
                            let _ = sink.close().await;
                            break false;
                        }
                    },
                }
            };

            if !lost {
                return;
            }

            {
                let mut inner = self.inner.lock().await;
                if inner.generation != generation {
                    return;
                }
                // Sends must fail fast while the link is down.
                inner.outbound = None;
            }
            self.set_state(ConnectionState::Reconnecting);

            match self.reestablish(generation, &identity).await {
                Some((new_link, new_rx)) => {
                    sink = new_link.sink;
                    source = new_link.source;
                    outbound_rx = new_rx;
                    self.set_state(ConnectionState::Connected);
                    let _ = self.lifecycle.send(ConnectionEvent::Reconnected);
                    info!("push channel reconnected");
                }
                None => {
                    {
                        let mut inner = self.inner.lock().await;
                        if inner.generation != generation {
                            return;
                        }
                        inner.outbound = None;
                        inner.supervisor = None;
                    }
                    self.set_state(ConnectionState::Disconnected);
                    let _ = self.lifecycle.send(ConnectionEvent::ReconnectFailed);
                    let _ = self.lifecycle.send(ConnectionEvent::Disconnected);
                    warn!(
                        attempts = self.reconnect_max_attempts,
                        "push channel reconnection exhausted"
                    );
                    return;
                }
            }
        }
    }

    async fn reestablish(
        &self,
        generation: u64,
        identity: &Identity,
    ) -> Option<(PushLink, mpsc::Receiver<ClientFrame>)> {
        let mut delay = self.reconnect_initial_delay;
        for attempt in 1..=self.reconnect_max_attempts {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RECONNECT_DELAY_CAP);

            {
                let inner = self.inner.lock().await;
                if inner.generation != generation {
                    return None;
                }
            }

            debug!(
                attempt,
                max_attempts = self.reconnect_max_attempts,
                "push channel reconnect attempt"
            );
            match timeout(
                self.handshake_timeout,
                self.transport.connect(&self.url, identity),
            )
            .await
            {
                Ok(Ok(link)) => {
                    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
                    let mut inner = self.inner.lock().await;
                    if inner.generation != generation {
                        return None;
                    }
                    inner.outbound = Some(tx);
                    return Some((link, rx));
                }
                Ok(Err(err)) => warn!(attempt, "push channel reconnect failed: {err}"),
                Err(_) => warn!(attempt, "push channel reconnect timed out"),
            }
        }
        None
    }
}

/// Derive the push endpoint from the REST base URL, the same scheme swap
/// the REST and push services share.
fn push_endpoint(server_url: &str) -> Result<Url, ConnectionError> {
    let ws = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ConnectionError::InvalidUrl(server_url.to_string()));
    };
    let ws = format!("{}/ws", ws.trim_end_matches('/'));
    Url::parse(&ws).map_err(|_| ConnectionError::InvalidUrl(server_url.to_string()))
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
