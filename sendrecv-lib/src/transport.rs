mod websocket;

use anyhow::Result;
use async_trait::async_trait;

use crate::negotiation::EventSender;

pub use self::websocket::{WebSocketConfig, WebSocketConnector, WebSocketTransport};

/// The sending half of an open signaling connection. Incoming frames,
/// closure and failures are delivered as events on the queue given to
/// [`Connector::connect`].
pub trait SignalingTransport: Send {
    fn send(&mut self, text: String) -> Result<()>;
    /// Starts an orderly close. `TransportClosed` follows once the peer
    /// acknowledges or the connection drops.
    fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: SignalingTransport + 'static;

    async fn connect(&self, events: EventSender) -> Result<Self::Transport>;
}
