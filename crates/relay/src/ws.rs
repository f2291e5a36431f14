use anyhow::{bail, ensure, Context, Result};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::{Connection, Connector};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the collector over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        ensure!(
            url.starts_with("ws://") || url.starts_with("wss://"),
            "collector url must use ws:// or wss:// (got {url})"
        );
        Ok(Self { url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let (ws, resp) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("websocket handshake with {}", self.url))?;
        debug!(url = %self.url, status = %resp.status(), "websocket connected");
        Ok(Box::new(WsConnection { ws }))
    }
}

struct WsConnection {
    ws: WsStream,
}

impl WsConnection {
    /// Process whatever the collector sent without waiting for more;
    /// pongs are consumed here and a close frame fails the connection.
    fn drain_incoming(&mut self) -> Result<()> {
        while let Some(next) = self.ws.next().now_or_never() {
            match next {
                None => bail!("collector connection closed"),
                Some(Ok(Message::Close(frame))) => bail!("collector closed connection: {frame:?}"),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("reading from collector"),
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connection for WsConnection {
    async fn send_text(&mut self, body: String) -> Result<()> {
        self.drain_incoming()?;
        self.ws.send(Message::Text(body)).await.context("writing report frame")
    }

    async fn ping(&mut self) -> Result<()> {
        self.drain_incoming()?;
        self.ws.send(Message::Ping(Vec::new())).await.context("writing ping frame")
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "websocket close");
        }
    }
}
