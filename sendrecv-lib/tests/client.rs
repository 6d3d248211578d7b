use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use async_trait::async_trait;
use sendrecv_lib::{
    negotiation::{EarlyCandidatePolicy, Engine, EngineFactory, EventSender, MediaKind},
    transport::{Connector, SignalingTransport},
    Client, ClientId, Event, IceCandidate, SdpKind, Session, SessionError, SignalingMessage,
};
use tokio::{spawn, sync::mpsc, time::timeout};

const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n";
const ANSWER: &str = "v=0\r\no=- 2 1 IN IP4 0.0.0.0\r\n";

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Text(String),
    Close,
}

struct ChannelTransport {
    frames: mpsc::UnboundedSender<Frame>,
}

impl SignalingTransport for ChannelTransport {
    fn send(&mut self, text: String) -> Result<()> {
        self.frames.send(Frame::Text(text))?;
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.frames.send(Frame::Close);
    }
}

/// Hands the client's event queue to the test, which plays the server.
struct ChannelConnector {
    frames: mpsc::UnboundedSender<Frame>,
    server: mpsc::UnboundedSender<EventSender>,
    refuse: bool,
}

#[async_trait]
impl Connector for ChannelConnector {
    type Transport = ChannelTransport;

    async fn connect(&self, events: EventSender) -> Result<ChannelTransport> {
        if self.refuse {
            bail!("connection refused");
        }
        self.server.send(events)?;
        Ok(ChannelTransport {
            frames: self.frames.clone(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Call {
    Created,
    CreateOffer,
    SetLocal,
    SetRemote(SdpKind),
    AddIce(IceCandidate),
    Close,
}

/// Behaves like a peer connection that connects as soon as the answer is
/// applied.
struct FakeEngine {
    events: EventSender,
    calls: mpsc::UnboundedSender<Call>,
}

#[async_trait]
impl Engine for FakeEngine {
    async fn create_offer(&self) -> Result<String> {
        self.calls.send(Call::CreateOffer)?;
        Ok(OFFER.to_owned())
    }
    async fn set_local_description(&self, _sdp: String) -> Result<()> {
        self.events.send(Event::LocalIceCandidate(local_candidate()))?;
        self.calls.send(Call::SetLocal)?;
        Ok(())
    }
    async fn set_remote_description(&self, kind: SdpKind, _sdp: String) -> Result<()> {
        self.events.send(Event::IncomingTrack(MediaKind::Video))?;
        self.events.send(Event::MediaConnected)?;
        self.calls.send(Call::SetRemote(kind))?;
        Ok(())
    }
    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.calls.send(Call::AddIce(candidate))?;
        Ok(())
    }
    async fn wire_track(&self, _kind: MediaKind) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        self.calls.send(Call::Close)?;
        Ok(())
    }
}

struct FakeEngineFactory {
    calls: mpsc::UnboundedSender<Call>,
}

#[async_trait]
impl EngineFactory for FakeEngineFactory {
    async fn create(&self, events: EventSender) -> Result<Box<dyn Engine>> {
        self.calls.send(Call::Created)?;
        events.send(Event::NegotiationNeeded)?;
        Ok(Box::new(FakeEngine {
            events,
            calls: self.calls.clone(),
        }))
    }
}

fn local_candidate() -> IceCandidate {
    IceCandidate::new(
        "candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host".to_owned(),
        0,
    )
}

fn remote_candidate() -> IceCandidate {
    IceCandidate::new(
        "candidate:2 1 udp 2122260223 192.168.1.3 50001 typ host".to_owned(),
        0,
    )
}

struct Harness {
    frames: mpsc::UnboundedReceiver<Frame>,
    server: mpsc::UnboundedReceiver<EventSender>,
    calls: mpsc::UnboundedReceiver<Call>,
    result: tokio::task::JoinHandle<Result<(), SessionError>>,
}

fn start(refuse: bool) -> Harness {
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (server_tx, server) = mpsc::unbounded_channel();
    let (calls_tx, calls) = mpsc::unbounded_channel();
    let connector = ChannelConnector {
        frames: frames_tx,
        server: server_tx,
        refuse,
    };
    let client = Client::new(
        Session::new(ClientId::new(42), "bob".to_owned()),
        Arc::new(FakeEngineFactory { calls: calls_tx }),
        EarlyCandidatePolicy::Buffer,
        Duration::from_millis(200),
    );
    let result = spawn(async move { client.run(&connector).await });
    Harness {
        frames,
        server,
        calls,
        result,
    }
}

async fn next_frame(frames: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
    timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("no frame within 5s")
        .expect("transport dropped")
}

#[tokio::test]
async fn full_call_reaches_media_and_ends_cleanly() {
    let mut h = start(false);
    let server = h.server.recv().await.unwrap();
    let message = |text: &str| server.send(Event::TransportMessage(text.to_owned())).unwrap();

    assert_eq!(next_frame(&mut h.frames).await, Frame::Text("HELLO 42".to_owned()));
    message("HELLO");
    assert_eq!(
        next_frame(&mut h.frames).await,
        Frame::Text("SESSION bob".to_owned())
    );
    message("SESSION_OK");
    // arrives before the answer and has to wait for it
    message(&format!(
        r#"{{"ice":{{"candidate":"{}","sdpMLineIndex":0}}}}"#,
        remote_candidate().candidate
    ));

    let Frame::Text(offer) = next_frame(&mut h.frames).await else {
        panic!("expected the offer");
    };
    assert_eq!(
        SignalingMessage::decode(&offer),
        Ok(SignalingMessage::SdpPayload {
            kind: SdpKind::Offer,
            sdp: OFFER.to_owned()
        })
    );
    let Frame::Text(ice) = next_frame(&mut h.frames).await else {
        panic!("expected a local candidate");
    };
    assert_eq!(
        ice,
        format!(
            r#"{{"ice":{{"candidate":"{}","sdpMLineIndex":0}}}}"#,
            local_candidate().candidate
        )
    );

    message(
        &SignalingMessage::SdpPayload {
            kind: SdpKind::Answer,
            sdp: ANSWER.to_owned(),
        }
        .encode(),
    );
    let mut calls = Vec::new();
    while calls.last() != Some(&Call::AddIce(remote_candidate())) {
        calls.push(h.calls.recv().await.unwrap());
    }
    assert_eq!(
        calls,
        vec![
            Call::Created,
            Call::CreateOffer,
            Call::SetLocal,
            Call::SetRemote(SdpKind::Answer),
            Call::AddIce(remote_candidate()),
        ]
    );

    server.send(Event::Hangup("test over".to_owned())).unwrap();
    assert_eq!(next_frame(&mut h.frames).await, Frame::Close);
    server.send(Event::TransportClosed).unwrap();

    let result = timeout(Duration::from_secs(5), h.result)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(h.calls.recv().await, Some(Call::Close));
}

#[tokio::test]
async fn server_closing_mid_call_is_a_transport_failure() {
    let mut h = start(false);
    let server = h.server.recv().await.unwrap();
    let message = |text: &str| server.send(Event::TransportMessage(text.to_owned())).unwrap();

    assert_eq!(next_frame(&mut h.frames).await, Frame::Text("HELLO 42".to_owned()));
    message("HELLO");
    assert_eq!(
        next_frame(&mut h.frames).await,
        Frame::Text("SESSION bob".to_owned())
    );
    message("SESSION_OK");
    let Frame::Text(_offer) = next_frame(&mut h.frames).await else {
        panic!("expected the offer");
    };
    server.send(Event::TransportClosed).unwrap();

    let result = timeout(Duration::from_secs(5), h.result)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        result,
        Err(SessionError::TransportFailure(
            "connection closed by the server".to_owned()
        ))
    );
}

#[tokio::test]
async fn server_error_ends_the_session_with_that_error() {
    let mut h = start(false);
    let server = h.server.recv().await.unwrap();

    assert_eq!(next_frame(&mut h.frames).await, Frame::Text("HELLO 42".to_owned()));
    server
        .send(Event::TransportMessage("HELLO".to_owned()))
        .unwrap();
    assert_eq!(
        next_frame(&mut h.frames).await,
        Frame::Text("SESSION bob".to_owned())
    );
    server
        .send(Event::TransportMessage("ERROR peer 'bob' not found".to_owned()))
        .unwrap();
    assert_eq!(next_frame(&mut h.frames).await, Frame::Close);

    // the server never acknowledges the close; the client gives up waiting
    let result = timeout(Duration::from_secs(5), h.result)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        result,
        Err(SessionError::ServerError("peer 'bob' not found".to_owned()))
    );
    assert_eq!(h.calls.try_recv().ok(), None);
}

#[tokio::test]
async fn malformed_frame_is_fatal() {
    let mut h = start(false);
    let server = h.server.recv().await.unwrap();

    assert_eq!(next_frame(&mut h.frames).await, Frame::Text("HELLO 42".to_owned()));
    server
        .send(Event::TransportMessage("{\"sdp\":".to_owned()))
        .unwrap();
    assert_eq!(next_frame(&mut h.frames).await, Frame::Close);
    server.send(Event::TransportClosed).unwrap();

    let result = timeout(Duration::from_secs(5), h.result)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(SessionError::MalformedPayload(_))));
}

#[tokio::test]
async fn refused_connection_is_a_transport_failure() {
    let h = start(true);
    let result = timeout(Duration::from_secs(5), h.result)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        result,
        Err(SessionError::TransportFailure(
            "connection refused".to_owned()
        ))
    );
}
