//! Kollect relay: the single outbound connection to the collector and the
//! sender task that drains the change buffer into it.

#![forbid(unsafe_code)]

mod sender;
mod ws;

use anyhow::Result;

pub use sender::{ConnectionSender, SenderConfig};
pub use ws::WsConnector;

/// Establishes the outbound connection.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// An open connection to the collector. Owned by exactly one sender.
#[async_trait::async_trait]
pub trait Connection: Send {
    /// Transmit one serialized report batch.
    async fn send_text(&mut self, body: String) -> Result<()>;

    /// Liveness probe used when there is nothing to send.
    async fn ping(&mut self) -> Result<()>;

    async fn close(&mut self);
}
