use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::{spawn, sync::Mutex, task::JoinHandle, time::interval};
use tracing::{debug, info, trace, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS},
        APIBuilder,
    },
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    interceptor::registry::Registry,
    media::Sample,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use crate::{
    error::SessionError,
    session::Event,
    signaling::{IceCandidate, SdpKind},
};

use super::{
    audio_source::{AudioTestSource, CHANNELS, FRAME_DURATION, SAMPLE_RATE},
    engine::{Engine, EngineFactory, EventSender, MediaKind},
};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

fn media_kind(codec_type: RTPCodecType) -> Option<MediaKind> {
    match codec_type {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        RTPCodecType::Unspecified => None,
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: SAMPLE_RATE,
        channels: CHANNELS,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        ..Default::default()
    }
}

fn recvonly() -> RTCRtpTransceiverInit {
    RTCRtpTransceiverInit {
        direction: RTCRtpTransceiverDirection::Recvonly,
        send_encodings: vec![],
    }
}

/// Builds webrtc-rs peer connections that send and receive one audio stream
/// and receive one video stream. Outgoing audio comes from
/// [`AudioTestSource`].
#[derive(Clone, Debug)]
pub struct PeerConnectionFactory {
    ice_servers: Vec<String>,
}

impl PeerConnectionFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

impl Default for PeerConnectionFactory {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STUN_SERVER.to_owned()])
    }
}

#[async_trait]
impl EngineFactory for PeerConnectionFactory {
    async fn create(&self, events: EventSender) -> Result<Box<dyn Engine>> {
        Ok(Box::new(PeerConnection::new(self.config(), events).await?))
    }
}

pub struct PeerConnection {
    rtc: RTCPeerConnection,
    pending_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
    audio_pump: JoinHandle<()>,
}

fn spawn_audio_pump(
    track: Arc<TrackLocalStaticSample>,
    mut source: AudioTestSource,
) -> JoinHandle<()> {
    spawn(async move {
        let mut ticker = interval(FRAME_DURATION);
        loop {
            ticker.tick().await;
            let data = match source.next_packet() {
                Ok(data) => data,
                Err(err) => {
                    warn!("audio source stopped: {:#}", err);
                    return;
                }
            };
            let sample = Sample {
                data,
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(err) = track.write_sample(&sample).await {
                debug!("failed to write audio sample: {}", err);
            }
        }
    })
}

impl PeerConnection {
    async fn new(config: RTCConfiguration, events: EventSender) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let rtc = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build()
            .new_peer_connection(config)
            .await?;

        let tx = events.clone();
        rtc.on_negotiation_needed(Box::new(move || {
            let _ = tx.send(Event::NegotiationNeeded);
            Box::pin(async {})
        }));

        let tx = events.clone();
        rtc.on_ice_candidate(Box::new(move |candidate| {
            let Some(candidate) = candidate else {
                trace!("ICE gathering complete");
                return Box::pin(async {});
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(Event::LocalIceCandidate(IceCandidate::new(
                        init.candidate,
                        init.sdp_mline_index.unwrap_or_default(),
                    )));
                }
                Err(err) => warn!("failed to serialize local candidate: {}", err),
            }
            Box::pin(async {})
        }));

        let pending_tracks = Arc::new(Mutex::new(Vec::new()));
        let tracks = pending_tracks.clone();
        let tx = events.clone();
        rtc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tracks = tracks.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let Some(kind) = media_kind(track.kind()) else {
                    warn!("track {} has no media kind", track.id());
                    return;
                };
                debug!(
                    "on_track {} {} {}",
                    kind,
                    track.id(),
                    track.codec().capability.mime_type
                );
                tracks.lock().await.push(track);
                let _ = tx.send(Event::IncomingTrack(kind));
            })
        }));

        let mut connected = false;
        rtc.on_peer_connection_state_change(Box::new(move |state| {
            debug!("on_peer_connection_state_change {}", state);
            match state {
                RTCPeerConnectionState::Connected if !connected => {
                    connected = true;
                    let _ = events.send(Event::MediaConnected);
                }
                RTCPeerConnectionState::Disconnected => {
                    let _ = events.send(Event::Hangup("peer disconnected".to_owned()));
                }
                RTCPeerConnectionState::Failed => {
                    let _ = events.send(Event::Failed(SessionError::NegotiationFailure(
                        "peer connection failed".to_owned(),
                    )));
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        rtc.add_transceiver_from_kind(RTPCodecType::Video, Some(recvonly()))
            .await?;
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_owned(),
            "sendrecv".to_owned(),
        ));
        let sender = rtc
            .add_track(audio_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        let audio_pump = spawn_audio_pump(audio_track, AudioTestSource::new()?);

        Ok(Self {
            rtc,
            pending_tracks,
            audio_pump,
        })
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.audio_pump.abort();
    }
}

#[async_trait]
impl Engine for PeerConnection {
    async fn create_offer(&self) -> Result<String> {
        Ok(self.rtc.create_offer(None).await?.sdp)
    }

    async fn set_local_description(&self, sdp: String) -> Result<()> {
        self.rtc
            .set_local_description(RTCSessionDescription::offer(sdp)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
        };
        self.rtc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.rtc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mline_index: Some(candidate.sdp_mline_index),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn wire_track(&self, kind: MediaKind) -> Result<()> {
        let mut pending = self.pending_tracks.lock().await;
        let (wired, rest): (Vec<_>, Vec<_>) = pending
            .drain(..)
            .partition(|track| media_kind(track.kind()) == Some(kind));
        *pending = rest;
        for track in wired {
            info!("receiving {} on track {}", kind, track.id());
            spawn(async move {
                let mut packets = 0u64;
                loop {
                    match track.read_rtp().await {
                        Ok((packet, _)) => {
                            packets += 1;
                            trace!(
                                "{} rtp seq={} ts={} len={}",
                                kind,
                                packet.header.sequence_number,
                                packet.header.timestamp,
                                packet.payload.len()
                            );
                        }
                        Err(err) => {
                            debug!("{} track ended after {} packets: {}", kind, packets, err);
                            break;
                        }
                    }
                }
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.audio_pump.abort();
        self.rtc.close().await?;
        trace!("connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_factory_uses_public_stun() {
        let config = PeerConnectionFactory::default().config();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_SERVER]);
    }

    #[test]
    fn audio_is_offered_as_stereo_opus_and_video_is_receive_only() {
        let capability = opus_capability();
        assert_eq!(capability.mime_type, MIME_TYPE_OPUS);
        assert_eq!(capability.clock_rate, 48_000);
        assert_eq!(capability.channels, 2);

        let init = recvonly();
        assert_eq!(init.direction, RTCRtpTransceiverDirection::Recvonly);
        assert!(init.send_encodings.is_empty());
    }

    #[tokio::test]
    async fn audio_pump_keeps_writing_until_aborted() {
        let track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_owned(),
            "test".to_owned(),
        ));
        let pump = spawn_audio_pump(track, AudioTestSource::new().unwrap());
        tokio::time::sleep(FRAME_DURATION * 3).await;
        assert!(!pump.is_finished());
        pump.abort();
        assert!(pump.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn unspecified_tracks_have_no_kind() {
        assert_eq!(media_kind(RTPCodecType::Audio), Some(MediaKind::Audio));
        assert_eq!(media_kind(RTPCodecType::Video), Some(MediaKind::Video));
        assert_eq!(media_kind(RTPCodecType::Unspecified), None);
    }
}
