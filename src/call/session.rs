//! Call session data
//!
//! The single active or pending call and the small value types around it.

use crate::webrtc::SessionDescription;
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;

/// Identifier of one call attempt. Every asynchronous completion and every
/// buffered candidate is tagged with it so stale results can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No call
    #[default]
    Idle,
    /// Local offer being prepared or sent, awaiting answer
    Dialing,
    /// Remote offer received, awaiting local accept/reject
    Ringing,
    /// Answer exchanged, ICE negotiating
    Connecting,
    /// Media flowing
    Active,
    /// Teardown in progress
    Ending,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Ringing => "ringing",
            CallState::Connecting => "connecting",
            CallState::Active => "active",
            CallState::Ending => "ending",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaMode {
    AudioOnly,
    AudioVideo,
}

impl MediaMode {
    pub fn from_audio_only(audio_only: bool) -> Self {
        if audio_only {
            MediaMode::AudioOnly
        } else {
            MediaMode::AudioVideo
        }
    }

    pub fn is_audio_only(&self) -> bool {
        matches!(self, MediaMode::AudioOnly)
    }
}

/// The single call the state machine is working on
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: SessionId,
    pub local_participant: String,
    /// Known from the start for outgoing calls, from the offer for incoming ones
    pub remote_participant: Option<String>,
    pub direction: CallDirection,
    pub media_mode: MediaMode,
    /// Set only when the call reaches `Active`
    pub started_at: Option<SystemTime>,
    pub elapsed_seconds: u64,
    pub muted: bool,
    /// Remote offer held while ringing
    pub(crate) pending_offer: Option<SessionDescription>,
    /// Whether our offer has gone out (answers are only legal after that)
    pub(crate) offer_sent: bool,
    /// Whether a connection was requested, so teardown must wait for release
    pub(crate) connection_requested: bool,
}

impl CallSession {
    pub fn outgoing(local: &str, remote: &str, media_mode: MediaMode) -> Self {
        Self::new(local, Some(remote.to_string()), CallDirection::Outgoing, media_mode)
    }

    pub fn incoming(local: &str, remote: &str, media_mode: MediaMode, offer: SessionDescription) -> Self {
        let mut session = Self::new(local, Some(remote.to_string()), CallDirection::Incoming, media_mode);
        session.pending_offer = Some(offer);
        session
    }

    fn new(local: &str, remote: Option<String>, direction: CallDirection, media_mode: MediaMode) -> Self {
        Self {
            id: SessionId::new(),
            local_participant: local.to_string(),
            remote_participant: remote,
            direction,
            media_mode,
            started_at: None,
            elapsed_seconds: 0,
            muted: false,
            pending_offer: None,
            offer_sent: false,
            connection_requested: false,
        }
    }

    pub fn remote(&self) -> &str {
        self.remote_participant.as_deref().unwrap_or_default()
    }
}

/// Read-only view handed to the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub remote_participant: Option<String>,
    pub direction: Option<CallDirection>,
    pub media_mode: Option<MediaMode>,
    pub started_at: Option<SystemTime>,
    pub elapsed_seconds: u64,
    pub muted: bool,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            state: CallState::Idle,
            remote_participant: None,
            direction: None,
            media_mode: None,
            started_at: None,
            elapsed_seconds: 0,
            muted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_mode_from_flag() {
        assert_eq!(MediaMode::from_audio_only(true), MediaMode::AudioOnly);
        assert!(!MediaMode::from_audio_only(false).is_audio_only());
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let a = CallSession::outgoing("alice", "bob", MediaMode::AudioVideo);
        let b = CallSession::outgoing("alice", "bob", MediaMode::AudioVideo);
        assert_ne!(a.id, b.id);
        assert_eq!(a.remote(), "bob");
        assert!(a.started_at.is_none());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&CallState::Connecting).unwrap(), "\"connecting\"");
        assert_eq!(CallState::Ending.to_string(), "ending");
    }
}
