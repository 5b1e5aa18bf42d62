//! Signaling transport
//!
//! Wire codec, the WebSocket client a call driver talks through, and the
//! relay server that routes events between registered participants.

pub mod codec;
pub mod websocket;
pub mod signaling_server;

pub use codec::{InboundFrame, WireFrame};
pub use websocket::WsSignalingClient;
pub use signaling_server::handle_signaling_connection;

use crate::webrtc::SignalingMessage;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;

/// Transport-level errors
#[derive(Debug)]
pub enum TransportError {
    /// Frame could not be decoded
    Decode(String),
    /// Frame could not be encoded
    Encode(String),
    /// Socket connect/IO failure
    Io(String),
    /// The transport has shut down
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Decode(msg) => write!(f, "Invalid signaling frame: {}", msg),
            TransportError::Encode(msg) => write!(f, "Failed to encode frame: {}", msg),
            TransportError::Io(msg) => write!(f, "Transport IO error: {}", msg),
            TransportError::Closed => write!(f, "Signaling transport closed"),
        }
    }
}

impl Error for TransportError {}

/// Outgoing half of a signaling channel.
///
/// Incoming messages are delivered separately on an mpsc receiver so the call
/// driver can merge them into its single event loop.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError>;
}
