use thiserror::Error;

use crate::signaling::DecodeError;

/// Every way a call attempt can end abnormally. All of them are fatal: the
/// state machine tears the session down and nothing is retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] DecodeError),
    #[error("signaling server error: {0}")]
    ServerError(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("negotiation failure: {0}")]
    NegotiationFailure(String),
}
