//! Signaling wire codec
//!
//! Frames are JSON objects `{"event": <name>, "data": <payload>}`. Decoding
//! normalizes the loosely shaped payloads (an ICE candidate may arrive bare,
//! wrapped in `{candidate: ...}`, or as a plain string) into one
//! `SignalingMessage`.

use super::TransportError;
use crate::webrtc::{IceCandidate, SessionDescription, SignalingMessage};
use serde::{Deserialize, Serialize};

/// `register` payload (client -> relay)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub from: String,
    pub to: String,
    pub offer: SessionDescription,
    #[serde(rename = "isAudioOnly", default)]
    pub is_audio_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub from: String,
    pub to: String,
    pub answer: SessionDescription,
}

/// All accepted `icecandidate` payload shapes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CandidatePayload {
    Wrapped { candidate: IceCandidate },
    Bare(IceCandidate),
    Line(String),
}

impl CandidatePayload {
    fn into_candidate(self) -> IceCandidate {
        match self {
            CandidatePayload::Wrapped { candidate } | CandidatePayload::Bare(candidate) => candidate,
            CandidatePayload::Line(line) => IceCandidate::from_line(line),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndedPayload {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectPayload {
    pub from: String,
    pub to: String,
}

/// Raw frame as it travels over the socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum WireFrame {
    #[serde(rename = "register")]
    Register(RegisterPayload),
    #[serde(rename = "offer")]
    Offer(OfferPayload),
    #[serde(rename = "answer")]
    Answer(AnswerPayload),
    #[serde(rename = "icecandidate")]
    IceCandidate(CandidatePayload),
    #[serde(rename = "call-ended")]
    CallEnded(EndedPayload),
    #[serde(rename = "call-rejected")]
    CallRejected(RejectPayload),
}

/// A decoded frame: either transport control or a call signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Register { user_id: String },
    Signal(SignalingMessage),
}

impl WireFrame {
    pub fn register(user_id: impl Into<String>) -> Self {
        WireFrame::Register(RegisterPayload { user_id: user_id.into() })
    }

    /// Wrap a canonical message. Candidates always go out in the wrapped shape.
    pub fn from_message(message: SignalingMessage) -> Self {
        match message {
            SignalingMessage::Offer { from, to, description, audio_only } => {
                WireFrame::Offer(OfferPayload { from, to, offer: description, is_audio_only: audio_only })
            }
            SignalingMessage::Answer { from, to, description } => {
                WireFrame::Answer(AnswerPayload { from, to, answer: description })
            }
            SignalingMessage::IceCandidate(candidate) => {
                WireFrame::IceCandidate(CandidatePayload::Wrapped { candidate })
            }
            SignalingMessage::CallEnded => WireFrame::CallEnded(EndedPayload::default()),
            SignalingMessage::CallRejected { from, to } => {
                WireFrame::CallRejected(RejectPayload { from, to })
            }
        }
    }

    pub fn into_inbound(self) -> InboundFrame {
        match self {
            WireFrame::Register(p) => InboundFrame::Register { user_id: p.user_id },
            WireFrame::Offer(p) => InboundFrame::Signal(SignalingMessage::Offer {
                from: p.from,
                to: p.to,
                description: p.offer,
                audio_only: p.is_audio_only,
            }),
            WireFrame::Answer(p) => InboundFrame::Signal(SignalingMessage::Answer {
                from: p.from,
                to: p.to,
                description: p.answer,
            }),
            WireFrame::IceCandidate(p) => {
                InboundFrame::Signal(SignalingMessage::IceCandidate(p.into_candidate()))
            }
            WireFrame::CallEnded(_) => InboundFrame::Signal(SignalingMessage::CallEnded),
            WireFrame::CallRejected(p) => {
                InboundFrame::Signal(SignalingMessage::CallRejected { from: p.from, to: p.to })
            }
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text.trim()).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Decode a text frame into its normalized form
pub fn decode(text: &str) -> Result<InboundFrame, TransportError> {
    WireFrame::from_json(text).map(WireFrame::into_inbound)
}

/// Encode a call signal as a text frame
pub fn encode(message: &SignalingMessage) -> Result<String, TransportError> {
    WireFrame::from_message(message.clone()).to_json()
}
