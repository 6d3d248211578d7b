use std::time::Duration;

use anyhow::{anyhow, ensure, Result};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    select, spawn,
    sync::mpsc,
    time::{interval_at, sleep_until, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, trace, warn};

use crate::{negotiation::EventSender, session::Event};

use super::{Connector, SignalingTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WebSocketConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

pub struct WebSocketConnector {
    url: String,
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(url: String, config: WebSocketConfig) -> Self {
        Self { url, config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&self, events: EventSender) -> Result<WebSocketTransport> {
        ensure!(
            !self.config.ping_interval.is_zero() && !self.config.ping_timeout.is_zero(),
            "ping interval and timeout must be positive"
        );
        info!("connecting to {}", self.url);
        let (stream, response) = connect_async(self.url.as_str()).await?;
        debug!("handshake status {}", response.status());
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        spawn(drive(stream, outgoing_rx, events, self.config));
        Ok(WebSocketTransport {
            outgoing: outgoing_tx,
            closing: false,
        })
    }
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

pub struct WebSocketTransport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    closing: bool,
}

impl SignalingTransport for WebSocketTransport {
    fn send(&mut self, text: String) -> Result<()> {
        trace!(">> {}", text);
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| anyhow!("signaling connection is gone"))
    }

    fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

async fn wait_for_pong(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns the socket until it closes. Ends with exactly one of
/// `TransportClosed`, `TransportError` or `LivenessCheckFailed`.
async fn drive<S>(
    stream: S,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: EventSender,
    config: WebSocketConfig,
) where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError>,
{
    let (mut write, mut read) = stream.split();
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;
    let mut closing = false;

    let last = loop {
        select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(Event::TransportMessage(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    warn!("ignoring binary frame ({} bytes)", data.len());
                }
                Some(Ok(Message::Pong(_))) => {
                    trace!("pong");
                    pong_deadline = None;
                }
                Some(Ok(Message::Ping(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!("close frame {:?}", frame);
                    break Event::TransportClosed;
                }
                Some(Err(err)) => {
                    if closing {
                        debug!("error while closing: {}", err);
                        break Event::TransportClosed;
                    }
                    break Event::TransportError(err.to_string());
                }
                None => break Event::TransportClosed,
            },
            msg = outgoing.recv(), if !closing => {
                let result = match msg {
                    Some(Outgoing::Text(text)) => write.send(Message::Text(text)).await,
                    Some(Outgoing::Close) | None => {
                        closing = true;
                        pong_deadline = None;
                        write.send(Message::Close(None)).await
                    }
                };
                if let Err(err) = result {
                    if closing {
                        break Event::TransportClosed;
                    }
                    break Event::TransportError(err.to_string());
                }
            },
            _ = ping.tick(), if !closing => {
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + config.ping_timeout);
                }
                if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                    break Event::TransportError(err.to_string());
                }
            },
            _ = wait_for_pong(pong_deadline) => break Event::LivenessCheckFailed,
        }
    };
    debug!("signaling connection ended: {:?}", last);
    let _ = events.send(last);
}
