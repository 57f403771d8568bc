//! WebRTC-Negotiation auf Basis von `webrtc-rs`
//!
//! Implementiert [`NegotiatorFactory`] mit einer `RTCPeerConnection` pro
//! Anruf. Lokale Spuren werden als Opus-Tracks angemeldet; die Audio-Bytes
//! selbst fließen außerhalb dieser Crate.

use super::media::{LocalStream, RemoteStream};
use super::negotiation::{
    ConnectivityState, NegotiationError, NegotiationEvent, NegotiationEventHandler, Negotiator,
    NegotiatorFactory,
};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Sample Rate der Opus-Tracks
const OPUS_CLOCK_RATE: u32 = 48000;

fn backend(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Backend(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt `RTCPeerConnection`s mit den konfigurierten ICE Servern
#[derive(Debug, Clone)]
pub struct WebRtcNegotiatorFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcNegotiatorFactory {
    pub fn new(ice_server_urls: &[String]) -> Self {
        let ice_servers = if ice_server_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_server_urls.to_vec(),
                ..Default::default()
            }]
        };
        Self { ice_servers }
    }
}

#[async_trait]
impl NegotiatorFactory for WebRtcNegotiatorFactory {
    async fn create(
        &self,
        handler: NegotiationEventHandler,
    ) -> Result<Arc<dyn Negotiator>, NegotiationError> {
        // Media Engine mit Default-Codecs (inkl. Opus)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(backend)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(backend)?);
        install_handlers(&pc, handler);

        Ok(Arc::new(WebRtcNegotiator { pc }))
    }
}

/// Leitet die Callbacks der Peer Connection an den Engine-Handler weiter
fn install_handlers(pc: &Arc<RTCPeerConnection>, handler: NegotiationEventHandler) {
    let on_state = Arc::clone(&handler);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        if let Some(state) = map_connection_state(s) {
            on_state(NegotiationEvent::ConnectivityChanged(state));
        }
        Box::pin(async {})
    }));

    let on_candidate = Arc::clone(&handler);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // `None` signalisiert das Ende des Gatherings
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => on_candidate(NegotiationEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                    ..Default::default()
                })),
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let on_track = handler;
    pc.on_track(Box::new(move |track, _, _| {
        tracing::info!("Received remote track: {:?}", track.codec());
        on_track(NegotiationEvent::RemoteTrack(RemoteStream {
            id: track.stream_id(),
            track_ids: vec![track.id()],
        }));
        Box::pin(async {})
    }));
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectivityState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

/// Eine `RTCPeerConnection` als [`Negotiator`]
pub struct WebRtcNegotiator {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl Negotiator for WebRtcNegotiator {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), NegotiationError> {
        for track in stream.tracks() {
            let audio_track = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: OPUS_CLOCK_RATE,
                    channels: 1,
                    ..Default::default()
                },
                track.id().to_string(),
                stream.id().to_string(),
            ));

            self.pc
                .add_track(audio_track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(backend)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(backend)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let parsed = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            other => {
                return Err(NegotiationError::InvalidDescription(format!(
                    "unsupported description type {}",
                    other.as_str()
                )))
            }
        }
        .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?;

        self.pc
            .set_remote_description(parsed)
            .await
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
