pub mod client;
pub mod error;
pub mod negotiation;
pub mod session;
pub mod signaling;
pub mod transport;

pub use client::Client;
pub use error::SessionError;
pub use session::{Action, ClientId, Event, Session, SessionState, StateMachine};
pub use signaling::{IceCandidate, SdpKind, SignalingMessage};
