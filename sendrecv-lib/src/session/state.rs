use tracing::{debug, info, trace, warn};

use crate::{
    error::SessionError,
    negotiation::{MediaKind, NegotiationCommand},
    signaling::{IceCandidate, SdpKind, SignalingMessage},
};

use super::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    Error,
    ServerConnecting,
    ServerConnectionError,
    /// Ready to register
    ServerConnected,
    ServerRegistering,
    ServerRegistrationError,
    /// Ready to call a peer
    ServerRegistered,
    /// Server connection closed by us or the server
    ServerClosed,
    PeerConnecting,
    PeerConnectionError,
    PeerConnected,
    PeerCallNegotiating,
    PeerCallStarted,
    PeerCallStopping,
    PeerCallStopped,
    PeerCallError,
}

impl SessionState {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::Error
                | Self::ServerConnectionError
                | Self::ServerRegistrationError
                | Self::PeerConnectionError
                | Self::PeerCallError
        )
    }

    fn is_in_call(self) -> bool {
        matches!(
            self,
            Self::PeerConnected | Self::PeerCallNegotiating | Self::PeerCallStarted
        )
    }
}

/// Everything that can happen to a session, from the signaling transport or
/// from the media engine. All of them go through [`StateMachine::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Connect,
    TransportOpened,
    Register,
    TransportMessage(String),
    TransportClosed,
    TransportError(String),
    LivenessCheckFailed,
    NegotiationNeeded,
    LocalOfferReady(String),
    LocalIceCandidate(IceCandidate),
    MediaConnected,
    IncomingTrack(MediaKind),
    Failed(SessionError),
    Hangup(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    SendMessage(SignalingMessage),
    StartNegotiation,
    Negotiate(NegotiationCommand),
    Teardown,
    Fatal(SessionError),
}

pub struct StateMachine {
    session: Session,
    state: SessionState,
    /// A negotiation handle has been requested and not yet released.
    negotiating: bool,
    torn_down: bool,
}

impl StateMachine {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            state: SessionState::Unknown,
            negotiating: false,
            torn_down: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn apply(&mut self, event: Event) -> Vec<Action> {
        if self.torn_down {
            if event == Event::TransportClosed && self.state == SessionState::PeerCallStopping {
                self.transition(SessionState::PeerCallStopped);
            } else {
                debug!("ignored after teardown: {:?}", event);
            }
            return vec![];
        }

        match event {
            Event::Connect => match self.state {
                SessionState::Unknown => {
                    self.transition(SessionState::ServerConnecting);
                    vec![]
                }
                state => self.violation(format!("connect requested in {:?}", state)),
            },
            Event::TransportOpened => match self.state {
                SessionState::Unknown | SessionState::ServerConnecting => {
                    self.transition(SessionState::ServerConnected);
                    vec![]
                }
                state => self.violation(format!("transport opened in {:?}", state)),
            },
            Event::Register => match self.state {
                SessionState::ServerConnected => {
                    self.transition(SessionState::ServerRegistering);
                    vec![Action::SendMessage(SignalingMessage::Hello(Some(
                        self.session.client_id(),
                    )))]
                }
                state => self.violation(format!("register requested in {:?}", state)),
            },
            Event::TransportMessage(text) => self.on_message(&text),
            Event::TransportClosed => self.fail(
                SessionState::ServerClosed,
                SessionError::TransportFailure("connection closed by the server".to_owned()),
            ),
            Event::TransportError(reason) => {
                self.fail(SessionState::Error, SessionError::TransportFailure(reason))
            }
            Event::LivenessCheckFailed => self.fail(
                SessionState::Error,
                SessionError::TransportFailure("liveness check failed".to_owned()),
            ),
            Event::NegotiationNeeded => match self.state {
                SessionState::PeerConnected => {
                    self.transition(SessionState::PeerCallNegotiating);
                    vec![Action::Negotiate(NegotiationCommand::CreateOffer)]
                }
                _ => self.violation("negotiation needed out of call".to_owned()),
            },
            Event::LocalOfferReady(sdp) => match self.state {
                SessionState::PeerCallNegotiating => vec![
                    Action::Negotiate(NegotiationCommand::PublishLocalDescription(sdp.clone())),
                    Action::SendMessage(SignalingMessage::SdpPayload {
                        kind: SdpKind::Offer,
                        sdp,
                    }),
                ],
                _ => self.violation("offer created out of call".to_owned()),
            },
            Event::LocalIceCandidate(candidate) => match self.state {
                SessionState::PeerCallNegotiating | SessionState::PeerCallStarted => vec![
                    Action::Negotiate(NegotiationCommand::PublishLocalCandidate(
                        candidate.clone(),
                    )),
                    Action::SendMessage(SignalingMessage::IcePayload(candidate)),
                ],
                _ => self.violation("ICE candidate out of call".to_owned()),
            },
            Event::MediaConnected => match self.state {
                SessionState::PeerCallNegotiating => {
                    info!("call started with peer {}", self.session.peer_id());
                    self.transition(SessionState::PeerCallStarted);
                    vec![Action::Negotiate(NegotiationCommand::MarkEstablished)]
                }
                state => self.violation(format!("media connected in {:?}", state)),
            },
            Event::IncomingTrack(kind) => {
                if !self.negotiating {
                    return self.violation(format!("incoming {} track without a call", kind));
                }
                vec![Action::Negotiate(NegotiationCommand::WireTrack(kind))]
            }
            Event::Failed(err) => {
                let next = if self.state.is_in_call() {
                    SessionState::PeerCallError
                } else {
                    SessionState::Error
                };
                self.fail(next, err)
            }
            Event::Hangup(reason) => {
                info!("hanging up: {}", reason);
                if self.state.is_in_call() {
                    self.transition(SessionState::PeerCallStopping);
                } else {
                    self.transition(SessionState::ServerClosed);
                }
                self.teardown()
            }
        }
    }

    fn on_message(&mut self, text: &str) -> Vec<Action> {
        trace!("<< {}", text);
        let msg = match SignalingMessage::decode(text) {
            Ok(msg) => msg,
            Err(err) => return self.fail(SessionState::Error, err.into()),
        };
        match msg {
            SignalingMessage::Hello(None) => match self.state {
                SessionState::ServerRegistering => {
                    self.transition(SessionState::ServerRegistered);
                    info!("registered with server as {}", self.session.client_id());
                    self.transition(SessionState::PeerConnecting);
                    vec![Action::SendMessage(SignalingMessage::SessionRequest(
                        self.session.peer_id().clone(),
                    ))]
                }
                _ => self.violation("unexpected HELLO".to_owned()),
            },
            SignalingMessage::SessionOk => match self.state {
                SessionState::PeerConnecting => {
                    self.transition(SessionState::PeerConnected);
                    self.negotiating = true;
                    vec![Action::StartNegotiation]
                }
                _ => self.violation("unexpected SESSION_OK".to_owned()),
            },
            SignalingMessage::ErrorNotice(notice) => {
                let next = match self.state {
                    SessionState::ServerConnecting => SessionState::ServerConnectionError,
                    SessionState::ServerRegistering => SessionState::ServerRegistrationError,
                    SessionState::PeerConnecting => SessionState::PeerConnectionError,
                    SessionState::PeerConnected | SessionState::PeerCallNegotiating => {
                        SessionState::PeerCallError
                    }
                    _ => SessionState::Error,
                };
                self.fail(next, SessionError::ServerError(notice.trim().to_owned()))
            }
            SignalingMessage::SdpPayload { kind, sdp } => self.forward_remote(
                NegotiationCommand::ApplyRemoteDescription { kind, sdp },
                "remote description",
            ),
            SignalingMessage::IcePayload(candidate) => self.forward_remote(
                NegotiationCommand::AddRemoteCandidate(candidate),
                "remote ICE candidate",
            ),
            SignalingMessage::Hello(Some(_)) | SignalingMessage::SessionRequest(_) => {
                self.violation(format!("client-only message from server: {}", text))
            }
        }
    }

    fn forward_remote(&mut self, command: NegotiationCommand, what: &str) -> Vec<Action> {
        if !self.state.is_in_call() || !self.negotiating {
            return self.violation(format!("{} received in {:?}", what, self.state));
        }
        vec![Action::Negotiate(command)]
    }

    fn transition(&mut self, next: SessionState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn violation(&mut self, reason: String) -> Vec<Action> {
        self.fail(SessionState::Error, SessionError::ProtocolViolation(reason))
    }

    fn fail(&mut self, next: SessionState, err: SessionError) -> Vec<Action> {
        warn!("{} (in {:?})", err, self.state);
        if !self.state.is_error() {
            self.transition(next);
        }
        let mut actions = vec![Action::Fatal(err)];
        actions.extend(self.teardown());
        actions
    }

    fn teardown(&mut self) -> Vec<Action> {
        self.torn_down = true;
        self.negotiating = false;
        vec![Action::Teardown]
    }
}
