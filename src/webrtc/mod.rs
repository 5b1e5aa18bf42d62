//! WebRTC call plumbing
//!
//! This module provides the pieces of a call that talk to webrtc-rs:
//! - Signaling message types (offer/answer/ICE/end/reject)
//! - Peer connection lifecycle (one live connection at a time)
//! - Local media tracks and their capture source

pub mod peer_connection;
pub mod signaling;
pub mod media_track;

pub use signaling::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
pub use peer_connection::{
    PeerBackend, PeerCallbacks, PeerConnectionHandle, PeerConnectionManager, PeerLink, RtcPeerBackend,
};
pub use media_track::{LocalTrack, MediaCapture, SampleMediaCapture, TrackKind};

use std::error::Error;
use std::fmt;

/// WebRTC-related errors
#[derive(Debug)]
pub enum WebRTCError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Media track error
    MediaError(String),
    /// No live peer connection to operate on
    NoConnection,
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
            WebRTCError::NoConnection => write!(f, "No live peer connection"),
        }
    }
}

impl Error for WebRTCError {}
