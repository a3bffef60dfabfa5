use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::Identity,
    protocol::{ClientFrame, ServerFrame},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::warn;
use url::Url;

use crate::connection::{PushLink, PushSink, PushSource, PushTransport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production push transport: JSON frames over a WebSocket, credentials
/// bound through query parameters on the handshake URL.
pub struct WebSocketTransport;

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, url: &Url, identity: &Identity) -> Result<PushLink> {
        let mut url = url.clone();
        url.query_pairs_mut()
            .append_pair("userId", &identity.user_id.0.to_string())
            .append_pair("sessionToken", &identity.session_token);

        // The URL carries the session token; keep it out of error text.
        let (stream, _) = connect_async(url.as_str())
            .await
            .context("failed to connect push websocket")?;
        let (write, read) = stream.split();

        Ok(PushLink {
            sink: Box::new(WsSink { write }),
            source: Box::new(WsSource { read }),
        })
    }
}

struct WsSink {
    write: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl PushSink for WsSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let text = serde_json::to_string(&frame).context("failed to encode client frame")?;
        self.write.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.write.close().await?;
        Ok(())
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl PushSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<ServerFrame>> {
        while let Some(message) = self.read.next().await {
            match message {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => return Some(Ok(frame)),
                    Err(err) => {
                        warn!("invalid server event skipped: {err}");
                    }
                },
                Ok(WsMessage::Close(_)) => return None,
                // Ping/pong are handled by tungstenite; binary frames are
                // not part of this protocol.
                Ok(_) => {}
                Err(err) => return Some(Err(anyhow!("websocket receive failed: {err}"))),
            }
        }
        None
    }
}
