mod audio_source;
mod engine;
mod peer_connection;

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    spawn,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, trace, warn};

use crate::{
    error::SessionError,
    session::Event,
    signaling::{IceCandidate, SdpKind},
};

pub use self::{
    engine::{Engine, EngineFactory, EventSender, MediaKind},
    peer_connection::{PeerConnectionFactory, DEFAULT_STUN_SERVER},
};

/// What to do with remote candidates that arrive before the answer has been
/// applied. Some engines reject candidates without a remote description.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EarlyCandidatePolicy {
    #[default]
    Buffer,
    Forward,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationPhase {
    Idle,
    OfferRequested,
    OfferSent,
    AnswerApplied,
    Established,
}

/// Work the state machine hands to the coordinator once it has validated the
/// triggering event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NegotiationCommand {
    CreateOffer,
    PublishLocalDescription(String),
    PublishLocalCandidate(IceCandidate),
    ApplyRemoteDescription { kind: SdpKind, sdp: String },
    AddRemoteCandidate(IceCandidate),
    WireTrack(MediaKind),
    MarkEstablished,
}

#[derive(Debug)]
enum EngineCommand {
    CreateOffer,
    SetLocalDescription(String),
    SetRemoteDescription(SdpKind, String),
    AddIceCandidate(IceCandidate),
    WireTrack(MediaKind),
    Close,
}

/// The active peer connection of one call attempt: a worker task owning the
/// engine, fed through an ordered command channel.
struct NegotiationHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    worker: JoinHandle<()>,
}

impl NegotiationHandle {
    fn spawn(factory: Arc<dyn EngineFactory>, events: EventSender) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let worker = spawn(run_engine(factory, events, commands_rx));
        Self { commands, worker }
    }

    fn send(&self, command: EngineCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::NegotiationFailure("media engine has stopped".to_owned()))
    }
}

async fn run_engine(
    factory: Arc<dyn EngineFactory>,
    events: EventSender,
    mut commands: mpsc::UnboundedReceiver<EngineCommand>,
) {
    let engine = match factory.create(events.clone()).await {
        Ok(engine) => engine,
        Err(err) => {
            let _ = events.send(Event::Failed(SessionError::NegotiationFailure(format!(
                "failed to create peer connection: {:#}",
                err
            ))));
            return;
        }
    };
    while let Some(command) = commands.recv().await {
        trace!("engine: {:?}", command);
        let result = match command {
            EngineCommand::CreateOffer => engine.create_offer().await.map(|sdp| {
                let _ = events.send(Event::LocalOfferReady(sdp));
            }),
            EngineCommand::SetLocalDescription(sdp) => engine.set_local_description(sdp).await,
            EngineCommand::SetRemoteDescription(kind, sdp) => {
                engine.set_remote_description(kind, sdp).await
            }
            EngineCommand::AddIceCandidate(candidate) => {
                engine.add_remote_ice_candidate(candidate).await
            }
            EngineCommand::WireTrack(kind) => engine.wire_track(kind).await,
            EngineCommand::Close => break,
        };
        if let Err(err) = result {
            let _ = events.send(Event::Failed(SessionError::NegotiationFailure(format!(
                "{:#}",
                err
            ))));
            break;
        }
    }
    if let Err(err) = engine.close().await {
        warn!("failed to close peer connection: {:#}", err);
    }
    debug!("peer connection released");
}

/// Drives the offer/answer exchange for the state machine and owns the
/// negotiation handle. Engine work is never awaited here; completions come
/// back as [`Event`]s.
pub struct NegotiationCoordinator {
    factory: Arc<dyn EngineFactory>,
    events: EventSender,
    policy: EarlyCandidatePolicy,
    phase: NegotiationPhase,
    handle: Option<NegotiationHandle>,
    early_candidates: Vec<IceCandidate>,
    closing: Vec<JoinHandle<()>>,
}

impl NegotiationCoordinator {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        events: EventSender,
        policy: EarlyCandidatePolicy,
    ) -> Self {
        Self {
            factory,
            events,
            policy,
            phase: NegotiationPhase::Idle,
            handle: None,
            early_candidates: Vec::new(),
            closing: Vec::new(),
        }
    }

    fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("peer connection already exists");
            return;
        }
        debug!("creating peer connection");
        self.phase = NegotiationPhase::Idle;
        self.handle = Some(NegotiationHandle::spawn(
            self.factory.clone(),
            self.events.clone(),
        ));
    }

    pub fn execute(&mut self, command: NegotiationCommand) -> Result<(), SessionError> {
        match command {
            NegotiationCommand::CreateOffer => self.on_negotiation_needed(),
            NegotiationCommand::PublishLocalDescription(sdp) => {
                self.on_local_description_ready(sdp)
            }
            NegotiationCommand::PublishLocalCandidate(candidate) => {
                self.on_local_ice_candidate(&candidate)
            }
            NegotiationCommand::ApplyRemoteDescription { kind, sdp } => {
                self.on_remote_sdp(kind, sdp)
            }
            NegotiationCommand::AddRemoteCandidate(candidate) => self.on_remote_ice(candidate),
            NegotiationCommand::WireTrack(kind) => self.on_incoming_track(kind),
            NegotiationCommand::MarkEstablished => {
                self.on_media_connected();
                Ok(())
            }
        }
    }

    pub fn on_negotiation_needed(&mut self) -> Result<(), SessionError> {
        if self.phase != NegotiationPhase::Idle {
            return Err(SessionError::ProtocolViolation(format!(
                "offer requested again in {:?}",
                self.phase
            )));
        }
        self.handle()?.send(EngineCommand::CreateOffer)?;
        self.phase = NegotiationPhase::OfferRequested;
        Ok(())
    }

    pub fn on_local_description_ready(&mut self, sdp: String) -> Result<(), SessionError> {
        if self.phase != NegotiationPhase::OfferRequested {
            return Err(SessionError::ProtocolViolation(format!(
                "local offer produced in {:?}",
                self.phase
            )));
        }
        self.handle()?
            .send(EngineCommand::SetLocalDescription(sdp))?;
        self.phase = NegotiationPhase::OfferSent;
        Ok(())
    }

    pub fn on_local_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), SessionError> {
        if self.phase < NegotiationPhase::OfferRequested {
            return Err(SessionError::NegotiationFailure(format!(
                "local ICE candidate before an offer was requested ({:?})",
                self.phase
            )));
        }
        trace!(
            "local candidate {} (m-line {})",
            candidate.candidate,
            candidate.sdp_mline_index
        );
        Ok(())
    }

    pub fn on_remote_sdp(&mut self, kind: SdpKind, sdp: String) -> Result<(), SessionError> {
        if kind != SdpKind::Answer {
            return Err(SessionError::ProtocolViolation(format!(
                "received an {} but this client always makes the offer",
                kind
            )));
        }
        if self.phase != NegotiationPhase::OfferSent {
            return Err(SessionError::ProtocolViolation(format!(
                "answer received in {:?}",
                self.phase
            )));
        }
        self.handle()?
            .send(EngineCommand::SetRemoteDescription(kind, sdp))?;
        let early_candidates = std::mem::take(&mut self.early_candidates);
        if !early_candidates.is_empty() {
            debug!("flushing {} early candidates", early_candidates.len());
        }
        for candidate in early_candidates {
            self.handle()?
                .send(EngineCommand::AddIceCandidate(candidate))?;
        }
        self.phase = NegotiationPhase::AnswerApplied;
        Ok(())
    }

    pub fn on_remote_ice(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        let handle = self.handle()?;
        if self.phase >= NegotiationPhase::AnswerApplied
            || self.policy == EarlyCandidatePolicy::Forward
        {
            return handle.send(EngineCommand::AddIceCandidate(candidate));
        }
        debug!("buffering remote candidate until the answer is applied");
        self.early_candidates.push(candidate);
        Ok(())
    }

    pub fn on_incoming_track(&mut self, kind: MediaKind) -> Result<(), SessionError> {
        let Some(handle) = &self.handle else {
            warn!("incoming {} track without a peer connection", kind);
            return Ok(());
        };
        info!("incoming {} track", kind);
        handle.send(EngineCommand::WireTrack(kind))
    }

    pub fn on_media_connected(&mut self) {
        if self.phase != NegotiationPhase::AnswerApplied {
            warn!("media connected in {:?}", self.phase);
        }
        self.phase = NegotiationPhase::Established;
    }

    /// Releases the negotiation handle. Calling it again is a no-op.
    pub fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("releasing peer connection");
            let _ = handle.send(EngineCommand::Close);
            self.closing.push(handle.worker);
        }
        self.phase = NegotiationPhase::Idle;
        self.early_candidates.clear();
    }

    /// Waits for released engines to finish closing.
    pub async fn wait_closed(&mut self, limit: Duration) {
        for worker in self.closing.drain(..) {
            if timeout(limit, worker).await.is_err() {
                warn!("peer connection did not close within {:?}", limit);
            }
        }
    }

    fn handle(&self) -> Result<&NegotiationHandle, SessionError> {
        self.handle
            .as_ref()
            .ok_or_else(|| SessionError::ProtocolViolation("no peer connection".to_owned()))
    }
}
