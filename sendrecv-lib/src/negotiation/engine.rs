use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    session::Event,
    signaling::{IceCandidate, SdpKind},
};

pub type EventSender = mpsc::UnboundedSender<Event>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

/// The media side of a call: one peer connection.
///
/// Methods are only called from the negotiation worker, one at a time and in
/// the order the state machine issued them. Spontaneous notifications
/// (negotiation needed, local candidates, incoming tracks, connection state)
/// are reported through the [`EventSender`] handed to [`EngineFactory::create`].
#[async_trait]
pub trait Engine: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    async fn set_local_description(&self, sdp: String) -> Result<()>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()>;
    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Connects the incoming tracks of `kind` to the rendering path.
    async fn wire_track(&self, kind: MediaKind) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, events: EventSender) -> Result<Box<dyn Engine>>;
}
