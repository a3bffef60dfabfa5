use std::sync::Arc;

use shared::domain::Identity;
use tracing::warn;

pub mod ai;
pub mod config;
pub mod connection;
pub mod gatekeeper;
pub mod presence;
pub mod rest;
pub mod sync;
pub mod transport;

pub use ai::{AiChat, AiLimits, AiSessionError, ChatSession, SessionState, TokenBalance};
pub use config::{load_settings, Settings};
pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState, PushLink, PushSink,
    PushSource, PushTransport,
};
pub use gatekeeper::{AccessState, RoomGatekeeper, RoomSubscription};
pub use presence::{PresenceChannel, PresenceEvent};
pub use rest::{AiConfigApi, HistoryApi, MembershipApi, RestApi};
pub use sync::{MessageSynchronizer, MessageWindow, SyncError, WindowSnapshot, WindowUpdate};
pub use transport::WebSocketTransport;

/// The assembled client core: one shared [`ConnectionManager`] injected
/// into every component, with an explicit lifecycle
/// ([`ChatCore::connect`] / [`ChatCore::disconnect`]).
pub struct ChatCore {
    pub connection: Arc<ConnectionManager>,
    pub gatekeeper: Arc<RoomGatekeeper>,
    pub sync: Arc<MessageSynchronizer>,
    pub ai: Arc<AiChat>,
    pub presence: PresenceChannel,
    ai_config: Arc<dyn AiConfigApi>,
}

impl ChatCore {
    /// Production wiring: WebSocket transport plus the reqwest REST client.
    pub fn new(settings: Settings) -> Result<Arc<Self>, ConnectionError> {
        let rest = Arc::new(RestApi::new(&settings));
        Self::with_dependencies(
            settings,
            Arc::new(WebSocketTransport),
            rest.clone(),
            rest.clone(),
            rest,
        )
    }

    pub fn with_dependencies(
        settings: Settings,
        push_transport: Arc<dyn PushTransport>,
        history: Arc<dyn HistoryApi>,
        membership: Arc<dyn MembershipApi>,
        ai_config: Arc<dyn AiConfigApi>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let connection = ConnectionManager::new(&settings, push_transport)?;
        let gatekeeper = RoomGatekeeper::new(Arc::clone(&connection), membership);
        let sync = MessageSynchronizer::new(
            Arc::clone(&connection),
            history,
            Arc::clone(&gatekeeper),
            &settings,
        );
        let ai = AiChat::new(Arc::clone(&connection), &settings);
        let presence = PresenceChannel::new(Arc::clone(&connection));
        Ok(Arc::new(Self {
            connection,
            gatekeeper,
            sync,
            ai,
            presence,
            ai_config,
        }))
    }

    /// Bind the identity and establish the channel, then refresh AI limits
    /// from the config service. Limits stay at their defaults when the
    /// config service is unreachable.
    pub async fn connect(&self, identity: Identity) -> Result<(), ConnectionError> {
        self.connection.connect(identity).await?;
        match self.ai_config.fetch_chat_config().await {
            Ok(chat_config) => self.ai.apply_config(chat_config).await,
            Err(err) => warn!("ai config fetch failed; keeping defaults: {err}"),
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
