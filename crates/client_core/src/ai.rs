use std::sync::{Arc, Weak};

use shared::{
    domain::SessionId,
    error::AiErrorCode,
    protocol::{AiChatConfig, ClientFrame, PromptTurn, ServerFrame},
};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, warn};

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState,
};
use crate::config::Settings;

/// Server-authoritative token balance, cached best-effort. Updates always
/// overwrite; the client never decrements locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBalance {
    pub current_tokens: u32,
    pub cost_per_message: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AiLimits {
    pub max_prompt_chars: usize,
    pub cost_per_message: u32,
}

impl From<AiChatConfig> for AiLimits {
    fn from(config: AiChatConfig) -> Self {
        Self {
            max_prompt_chars: config.max_prompt_chars,
            cost_per_message: config.cost_per_message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingTokenCheck,
    Streaming,
    Completed,
    Cancelled,
    Errored(AiErrorCode),
}

#[derive(Debug, Error)]
pub enum AiSessionError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("prompt exceeds {max} characters ({actual})")]
    PromptTooLong { max: usize, actual: usize },
    #[error("insufficient tokens: have {available}, need {required}")]
    InsufficientTokens { available: u32, required: u32 },
    #[error("session cannot do that from state {0:?}")]
    InvalidState(SessionState),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Entry point for AI chat: holds the shared token-balance cache and the
/// limits used for local precondition checks, and opens independent
/// [`ChatSession`]s over the shared channel.
pub struct AiChat {
    connection: Arc<ConnectionManager>,
    limits: Arc<RwLock<AiLimits>>,
    balance: Arc<RwLock<Option<TokenBalance>>>,
}

impl AiChat {
    pub fn new(connection: Arc<ConnectionManager>, settings: &Settings) -> Arc<Self> {
        let frames = connection.frames();
        let chat = Arc::new(Self {
            connection,
            limits: Arc::new(RwLock::new(AiLimits {
                max_prompt_chars: settings.ai_max_prompt_chars,
                cost_per_message: settings.ai_cost_per_message,
            })),
            balance: Arc::new(RwLock::new(None)),
        });
        tokio::spawn(run_token_status(Arc::downgrade(&chat), frames));
        chat
    }

    /// Overwrite limits with what the config service reports.
    pub async fn apply_config(&self, config: AiChatConfig) {
        *self.limits.write().await = config.into();
        debug!(
            max_prompt_chars = config.max_prompt_chars,
            cost_per_message = config.cost_per_message,
            "ai limits updated from config service"
        );
    }

    pub async fn balance(&self) -> Option<TokenBalance> {
        *self.balance.read().await
    }

    pub fn open_session(&self) -> Arc<ChatSession> {
        self.open_session_with_history(Vec::new())
    }

    /// Open a session seeded with prior conversation turns. Sessions are
    /// independent of each other; only the token-balance cache is shared.
    pub fn open_session_with_history(&self, history: Vec<PromptTurn>) -> Arc<ChatSession> {
        let frames = self.connection.frames();
        let lifecycle = self.connection.lifecycle_events();
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let session = Arc::new(ChatSession {
            id: SessionId::new(),
            connection: Arc::clone(&self.connection),
            limits: Arc::clone(&self.limits),
            balance: Arc::clone(&self.balance),
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                chunks: Vec::new(),
                history,
                pending_prompt: None,
                cancel_requested: false,
                final_response: None,
            }),
            state_tx,
        });
        tokio::spawn(run_session_events(
            Arc::downgrade(&session),
            frames,
            lifecycle,
        ));
        debug!(session_id = %session.id, "ai session opened");
        session
    }

    async fn apply_token_status(&self, current_tokens: u32, cost_per_message: Option<u32>) {
        let fallback_cost = self.limits.read().await.cost_per_message;
        let mut balance = self.balance.write().await;
        let cost = cost_per_message
            .or(balance.map(|b| b.cost_per_message))
            .unwrap_or(fallback_cost);
        *balance = Some(TokenBalance {
            current_tokens,
            cost_per_message: cost,
        });
        debug!(current_tokens, "token balance updated from status event");
    }
}

/// One AI conversation instance: prompt out, token check, chunked response
/// in, completion or typed failure, with client-initiated cancellation.
pub struct ChatSession {
    id: SessionId,
    connection: Arc<ConnectionManager>,
    limits: Arc<RwLock<AiLimits>>,
    balance: Arc<RwLock<Option<TokenBalance>>>,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
}

struct SessionInner {
    state: SessionState,
    chunks: Vec<String>,
    history: Vec<PromptTurn>,
    pending_prompt: Option<String>,
    cancel_requested: bool,
    final_response: Option<String>,
}

impl ChatSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Chunks accumulated so far, in arrival order.
    pub async fn transcript(&self) -> String {
        self.inner.lock().await.chunks.concat()
    }

    pub async fn final_response(&self) -> Option<String> {
        self.inner.lock().await.final_response.clone()
    }

    pub async fn history(&self) -> Vec<PromptTurn> {
        self.inner.lock().await.history.clone()
    }

    /// Send a prompt. Fails locally, without touching the channel, when the
    /// channel is down, the prompt is empty or too long, or the cached
    /// balance cannot cover one message.
    pub async fn start(&self, prompt: &str) -> Result<(), AiSessionError> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, SessionState::Idle | SessionState::Completed) {
            return Err(AiSessionError::InvalidState(inner.state));
        }
        if self.connection.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected.into());
        }
        if prompt.trim().is_empty() {
            return Err(AiSessionError::EmptyPrompt);
        }
        let max = self.limits.read().await.max_prompt_chars;
        let actual = prompt.chars().count();
        if actual > max {
            self.transition(&mut inner, SessionState::Errored(AiErrorCode::PromptTooLong));
            return Err(AiSessionError::PromptTooLong { max, actual });
        }
        if let Some(balance) = *self.balance.read().await {
            if balance.current_tokens < balance.cost_per_message {
                self.transition(
                    &mut inner,
                    SessionState::Errored(AiErrorCode::InsufficientTokens),
                );
                return Err(AiSessionError::InsufficientTokens {
                    available: balance.current_tokens,
                    required: balance.cost_per_message,
                });
            }
        }

        inner.pending_prompt = Some(prompt.to_string());
        inner.cancel_requested = false;
        inner.final_response = None;
        self.transition(&mut inner, SessionState::AwaitingTokenCheck);
        let frame = ClientFrame::AiSend {
            session_id: self.id,
            prompt: prompt.to_string(),
            conversation_history: inner.history.clone(),
        };
        drop(inner);

        if let Err(err) = self.connection.send(frame).await {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::AwaitingTokenCheck {
                inner.pending_prompt = None;
                self.transition(&mut inner, SessionState::Idle);
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Ask the server to stop producing chunks. Valid only while
    /// `Streaming` or `AwaitingTokenCheck`; the `Cancelled` transition
    /// happens on the server ack, but chunks stop accumulating immediately.
    pub async fn cancel(&self) -> Result<(), AiSessionError> {
        {
            let mut inner = self.inner.lock().await;
            if !matches!(
                inner.state,
                SessionState::Streaming | SessionState::AwaitingTokenCheck
            ) {
                return Err(AiSessionError::InvalidState(inner.state));
            }
            inner.cancel_requested = true;
        }
        self.connection
            .send(ClientFrame::AiCancel {
                session_id: self.id,
            })
            .await?;
        Ok(())
    }

    fn transition(&self, inner: &mut SessionInner, state: SessionState) {
        debug!(session_id = %self.id, from = ?inner.state, to = ?state, "ai session transition");
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    async fn overwrite_tokens(&self, current_tokens: u32) {
        let fallback_cost = self.limits.read().await.cost_per_message;
        let mut balance = self.balance.write().await;
        let cost = balance.map(|b| b.cost_per_message).unwrap_or(fallback_cost);
        *balance = Some(TokenBalance {
            current_tokens,
            cost_per_message: cost,
        });
    }

    async fn apply_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::AiStart { session_id } if session_id == self.id => {
                let mut inner = self.inner.lock().await;
                if inner.state == SessionState::AwaitingTokenCheck && !inner.cancel_requested {
                    inner.chunks.clear();
                    self.transition(&mut inner, SessionState::Streaming);
                }
            }
            ServerFrame::AiChunk {
                session_id, chunk, ..
            } if session_id == self.id => {
                let mut inner = self.inner.lock().await;
                // Arrival order is authoritative; the index is advisory.
                if inner.state == SessionState::Streaming && !inner.cancel_requested {
                    inner.chunks.push(chunk);
                } else {
                    debug!(session_id = %self.id, "chunk outside an active stream ignored");
                }
            }
            ServerFrame::AiComplete {
                session_id,
                response,
                tokens_used,
                remaining_tokens,
                ..
            } if session_id == self.id => {
                {
                    let mut inner = self.inner.lock().await;
                    if !matches!(
                        inner.state,
                        SessionState::Streaming | SessionState::AwaitingTokenCheck
                    ) || inner.cancel_requested
                    {
                        return;
                    }
                    if let Some(prompt) = inner.pending_prompt.take() {
                        inner.history.push(PromptTurn::user(prompt));
                    }
                    inner.history.push(PromptTurn::assistant(response.clone()));
                    inner.final_response = Some(response);
                    self.transition(&mut inner, SessionState::Completed);
                }
                self.overwrite_tokens(remaining_tokens).await;
                debug!(session_id = %self.id, tokens_used, "ai exchange completed");
            }
            ServerFrame::AiCancelled { session_id } if session_id == self.id => {
                let mut inner = self.inner.lock().await;
                if matches!(
                    inner.state,
                    SessionState::Streaming | SessionState::AwaitingTokenCheck
                ) {
                    inner.chunks.clear();
                    inner.pending_prompt = None;
                    self.transition(&mut inner, SessionState::Cancelled);
                }
            }
            ServerFrame::AiError {
                session_id,
                code,
                message,
                current_tokens,
            } => {
                // Errors without a session id apply to whichever session is
                // mid-exchange.
                if session_id.is_some_and(|sid| sid != self.id) {
                    return;
                }
                {
                    let mut inner = self.inner.lock().await;
                    if !matches!(
                        inner.state,
                        SessionState::Streaming | SessionState::AwaitingTokenCheck
                    ) {
                        return;
                    }
                    inner.pending_prompt = None;
                    self.transition(&mut inner, SessionState::Errored(code));
                }
                warn!(session_id = %self.id, %code, "ai session failed: {message}");
                if code == AiErrorCode::InsufficientTokens {
                    if let Some(tokens) = current_tokens {
                        self.overwrite_tokens(tokens).await;
                    }
                }
            }
            _ => {}
        }
    }

    async fn apply_lifecycle(&self, event: ConnectionEvent) {
        if matches!(
            event,
            ConnectionEvent::Disconnected | ConnectionEvent::ReconnectFailed
        ) {
            let mut inner = self.inner.lock().await;
            if matches!(
                inner.state,
                SessionState::AwaitingTokenCheck | SessionState::Streaming
            ) {
                inner.pending_prompt = None;
                self.transition(&mut inner, SessionState::Errored(AiErrorCode::Unknown));
                warn!(session_id = %self.id, "ai session lost the channel before a terminal event");
            }
        }
    }
}

async fn run_session_events(
    weak: Weak<ChatSession>,
    mut frames: broadcast::Receiver<ServerFrame>,
    mut lifecycle: broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    let Some(session) = weak.upgrade() else { return };
                    session.apply_frame(frame).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "ai session lagged behind push frames");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            event = lifecycle.recv() => match event {
                Ok(event) => {
                    let Some(session) = weak.upgrade() else { return };
                    session.apply_lifecycle(event).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn run_token_status(weak: Weak<AiChat>, mut frames: broadcast::Receiver<ServerFrame>) {
    loop {
        match frames.recv().await {
            Ok(ServerFrame::AiTokenStatus {
                current_tokens,
                cost_per_message,
            }) => {
                let Some(chat) = weak.upgrade() else { return };
                chat.apply_token_status(current_tokens, cost_per_message)
                    .await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "token status intake lagged behind push frames");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
#[path = "tests/ai_tests.rs"]
mod tests;
