//! Call signaling messages
//!
//! Canonical, already-normalized form of everything the signaling transport
//! carries for a call. The loosely shaped wire payloads are decoded into these
//! types by `transport::codec` before they reach the call state machine.

use serde::{Deserialize, Serialize};

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP session description as exchanged with browsers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate in RTCIceCandidateInit shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the SDP attribute line set
    pub fn from_line(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// End-of-candidates marker (empty candidate line)
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// A signaling message received from or sent to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Remote peer wants to start a call
    Offer {
        from: String,
        to: String,
        description: SessionDescription,
        audio_only: bool,
    },

    /// Remote peer accepted our offer
    Answer {
        from: String,
        to: String,
        description: SessionDescription,
    },

    /// Trickled ICE candidate (unaddressed; routed to the paired peer)
    IceCandidate(IceCandidate),

    /// Remote peer hung up or cancelled before answer
    CallEnded,

    /// Remote peer declined (or was busy / unreachable)
    CallRejected {
        from: String,
        to: String,
    },
}

impl SignalingMessage {
    /// Wire event name
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate(_) => "icecandidate",
            SignalingMessage::CallEnded => "call-ended",
            SignalingMessage::CallRejected { .. } => "call-rejected",
        }
    }

    /// Explicit recipient, if the message is addressed
    pub fn recipient(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::CallRejected { to, .. } => Some(to),
            SignalingMessage::IceCandidate(_) | SignalingMessage::CallEnded => None,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_description_json_shape() {
        let desc = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains(r#""type":"offer""#));
        let back: SessionDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let cand: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(cand.sdp_mid.as_deref(), Some("0"));
        assert_eq!(cand.sdp_mline_index, Some(0));
        assert!(!cand.is_end_of_candidates());
    }

    #[test]
    fn test_unaddressed_messages() {
        assert_eq!(SignalingMessage::CallEnded.recipient(), None);
        let rejected = SignalingMessage::CallRejected { from: "b".into(), to: "a".into() };
        assert_eq!(rejected.recipient(), Some("a"));
        assert_eq!(rejected.event_name(), "call-rejected");
    }
}
