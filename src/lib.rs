//! callcore - WebRTC call-session core
//!
//! A call state machine that turns offer/answer/ICE signaling into a live
//! webrtc-rs peer connection, the driver that runs it, a WebSocket signaling
//! client, and the relay server those clients talk through.

pub mod config;
pub mod call;
pub mod transport;
pub mod web;
pub mod webrtc;

// Re-exports
pub use config::{CallConfig, Config, SignalingConfig};
pub use call::{CallDriver, CallError, CallHandle, CallNotification, CallSnapshot, CallState};
pub use transport::{SignalingTransport, WsSignalingClient};
pub use crate::webrtc::{IceCandidate, SessionDescription, SignalingMessage};
