use std::fmt;

use derive_new::new;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::ClientId;

const HELLO: &str = "HELLO";
const SESSION_OK: &str = "SESSION_OK";
const ERROR: &str = "ERROR";
const HELLO_WITH_ID: &str = "HELLO ";
const SESSION_WITH_PEER: &str = "SESSION ";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid client id: {0:?}")]
    InvalidClientId(String),
    #[error("unrecognized payload: {0}")]
    Payload(String),
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        })
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize, new)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

/// One text frame of the signaling protocol.
///
/// `Hello(Some(id))` is the registration we send (`HELLO <id>`), `Hello(None)`
/// is the server's acknowledgement (`HELLO`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalingMessage {
    Hello(Option<ClientId>),
    SessionRequest(String),
    SessionOk,
    ErrorNotice(String),
    SdpPayload { kind: SdpKind, sdp: String },
    IcePayload(IceCandidate),
}

#[derive(Deserialize, Serialize)]
struct SdpBody {
    #[serde(rename = "type")]
    kind: SdpKind,
    sdp: String,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum JsonEnvelope {
    Sdp(SdpBody),
    Ice(IceCandidate),
}

impl SignalingMessage {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        if text == HELLO {
            return Ok(Self::Hello(None));
        }
        if text == SESSION_OK {
            return Ok(Self::SessionOk);
        }
        if let Some(rest) = text.strip_prefix(ERROR) {
            return Ok(Self::ErrorNotice(rest.to_owned()));
        }
        if let Some(id) = text.strip_prefix(HELLO_WITH_ID) {
            let id = id
                .parse()
                .map_err(|_| DecodeError::InvalidClientId(id.to_owned()))?;
            return Ok(Self::Hello(Some(id)));
        }
        if let Some(peer_id) = text.strip_prefix(SESSION_WITH_PEER) {
            return Ok(Self::SessionRequest(peer_id.to_owned()));
        }

        let envelope: JsonEnvelope =
            serde_json::from_str(text).map_err(|err| DecodeError::Payload(err.to_string()))?;
        Ok(match envelope {
            JsonEnvelope::Sdp(SdpBody { kind, sdp }) => Self::SdpPayload { kind, sdp },
            JsonEnvelope::Ice(candidate) => Self::IcePayload(candidate),
        })
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SignalingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let envelope = match self {
            Self::Hello(None) => return f.write_str(HELLO),
            Self::Hello(Some(id)) => return write!(f, "{}{}", HELLO_WITH_ID, id),
            Self::SessionRequest(peer_id) => return write!(f, "{}{}", SESSION_WITH_PEER, peer_id),
            Self::SessionOk => return f.write_str(SESSION_OK),
            Self::ErrorNotice(text) => return write!(f, "{}{}", ERROR, text),
            Self::SdpPayload { kind, sdp } => JsonEnvelope::Sdp(SdpBody {
                kind: *kind,
                sdp: sdp.clone(),
            }),
            Self::IcePayload(candidate) => JsonEnvelope::Ice(candidate.clone()),
        };
        f.write_str(&serde_json::to_string(&envelope).map_err(|_| fmt::Error)?)
    }
}
