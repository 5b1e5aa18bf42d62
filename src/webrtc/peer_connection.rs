//! WebRTC PeerConnection management
//!
//! Owns the lifecycle of the one live peer connection of a call. A new
//! connection is never created while another is open: `acquire` always
//! closes the previous handle first, including when setting up the new one
//! fails part-way.

use super::media_track::{LocalTrack, TrackKind};
use super::{IceCandidate, SdpType, SessionDescription, WebRTCError};
use crate::call::{CallError, PeerState, SessionId};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

/// Callback for locally gathered ICE candidates
pub type IceCandidateCallback = Arc<dyn Fn(IceCandidate) + Send + Sync>;

/// Callback for remote tracks (kind, track id)
pub type RemoteTrackCallback = Arc<dyn Fn(TrackKind, String) + Send + Sync>;

/// Callback for connection state changes
pub type StateChangeCallback = Arc<dyn Fn(PeerState) + Send + Sync>;

/// The three callbacks registered on every new connection
#[derive(Clone)]
pub struct PeerCallbacks {
    pub on_ice_candidate: IceCandidateCallback,
    pub on_remote_track: RemoteTrackCallback,
    pub on_connection_state_change: StateChangeCallback,
}

/// Factory for peer connections
#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn create(&self, callbacks: PeerCallbacks) -> Result<Arc<dyn PeerLink>, WebRTCError>;
}

/// Operations on one underlying connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), WebRTCError>;
    /// Create an offer and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, WebRTCError>;
    /// Create an answer and set it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), WebRTCError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), WebRTCError>;
    async fn close(&self) -> Result<(), WebRTCError>;
}

/// The live connection of one call session
pub struct PeerConnectionHandle {
    session: SessionId,
    link: Arc<dyn PeerLink>,
    attached: HashSet<String>,
}

impl PeerConnectionHandle {
    /// Shared reference for operations spawned off the event loop
    pub fn link(&self) -> Arc<dyn PeerLink> {
        self.link.clone()
    }

    pub fn attached_tracks(&self) -> usize {
        self.attached.len()
    }

    /// Attach a track once; attaching the same track id again is a no-op.
    async fn attach(&mut self, track: &LocalTrack) -> Result<bool, WebRTCError> {
        if self.attached.contains(&track.id) {
            debug!("Track {} already attached", track.id);
            return Ok(false);
        }
        self.link.add_track(track).await?;
        self.attached.insert(track.id.clone());
        Ok(true)
    }
}

/// Owner of the single live peer connection
pub struct PeerConnectionManager {
    backend: Arc<dyn PeerBackend>,
    current: Option<PeerConnectionHandle>,
}

impl PeerConnectionManager {
    pub fn new(backend: Arc<dyn PeerBackend>) -> Self {
        Self { backend, current: None }
    }

    /// Replace any existing connection with a fresh one carrying `tracks`.
    pub async fn acquire(
        &mut self,
        session: SessionId,
        tracks: &[LocalTrack],
        callbacks: PeerCallbacks,
    ) -> Result<&PeerConnectionHandle, WebRTCError> {
        self.release().await;

        let link = self.backend.create(callbacks).await?;
        let mut handle = PeerConnectionHandle {
            session,
            link,
            attached: HashSet::new(),
        };
        for track in tracks {
            if let Err(e) = handle.attach(track).await {
                warn!("Session {} failed to attach {}: {}", session, track.id, e);
                if let Err(close_err) = handle.link.close().await {
                    debug!("Close after failed attach: {}", close_err);
                }
                return Err(e);
            }
        }

        info!("Session {} peer connection ready with {} tracks", session, handle.attached_tracks());
        let handle = self.current.insert(handle);
        Ok(&*handle)
    }

    /// Close the live connection, if any. Returns whether one was closed.
    pub async fn release(&mut self) -> bool {
        let Some(handle) = self.current.take() else {
            return false;
        };
        if let Err(e) = handle.link.close().await {
            warn!("Session {} close failed: {}", handle.session, e);
        }
        info!("Session {} peer connection released", handle.session);
        true
    }

    /// Connection for `session`, if it is the live one
    pub fn link_for(&self, session: SessionId) -> Option<Arc<dyn PeerLink>> {
        self.current
            .as_ref()
            .filter(|h| h.session == session)
            .map(|h| h.link())
    }

    /// Apply remote candidates in order. A candidate that fails is logged and
    /// dropped; the rest still go through. Returns how many were applied.
    pub async fn apply_candidates(&self, session: SessionId, candidates: &[IceCandidate]) -> usize {
        let Some(link) = self.link_for(session) else {
            debug!("Dropping {} candidates for session {} without a connection", candidates.len(), session);
            return 0;
        };
        let mut applied = 0;
        for candidate in candidates {
            if candidate.is_end_of_candidates() {
                debug!("Session {} remote end of candidates", session);
                continue;
            }
            match link.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("{}", CallError::MalformedCandidate(e.to_string())),
            }
        }
        applied
    }
}

/// webrtc-rs backed connections configured with a single STUN server
pub struct RtcPeerBackend {
    stun_server: String,
}

impl RtcPeerBackend {
    pub fn new(stun_server: impl Into<String>) -> Self {
        Self { stun_server: stun_server.into() }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.stun_server.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: vec![self.stun_server.clone()],
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerBackend for RtcPeerBackend {
    async fn create(&self, callbacks: PeerCallbacks) -> Result<Arc<dyn PeerLink>, WebRTCError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;
        let peer_connection = Arc::new(peer_connection);

        setup_callbacks(&peer_connection, callbacks);
        Ok(Arc::new(RtcPeerLink { peer_connection }))
    }
}

fn setup_callbacks(peer_connection: &Arc<RTCPeerConnection>, callbacks: PeerCallbacks) {
    let on_candidate = callbacks.on_ice_candidate;
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let on_candidate = on_candidate.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!("ICE gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => on_candidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                }),
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    let on_track = callbacks.on_remote_track;
    peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        on_track(kind, track.id());
        Box::pin(async {})
    }));

    let on_state = callbacks.on_connection_state_change;
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let on_state = on_state.clone();
        Box::pin(async move {
            debug!("Peer connection state: {}", state);
            let mapped = match state {
                RTCPeerConnectionState::Connected => PeerState::Connected,
                RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                RTCPeerConnectionState::Failed => PeerState::Failed,
                RTCPeerConnectionState::Closed => PeerState::Closed,
                _ => return,
            };
            on_state(mapped);
        })
    }));
}

struct RtcPeerLink {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), WebRTCError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.track.clone();
        let sender = self
            .peer_connection
            .add_track(local)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add {} track: {}", track.id, e)))?;

        // Drain RTCP so the interceptors keep running
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, WebRTCError> {
        let offer = self.peer_connection.create_offer(None).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection.set_local_description(offer.clone()).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError> {
        let answer = self.peer_connection.create_answer(None).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection.set_local_description(answer.clone()).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), WebRTCError> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| WebRTCError::SdpError(format!("Invalid remote SDP: {}", e)))?;

        self.peer_connection.set_remote_description(remote).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), WebRTCError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.peer_connection.add_ice_candidate(candidate_init).await
            .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.peer_connection.close().await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))
    }
}
