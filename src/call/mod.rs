//! Call session orchestration
//!
//! - `session`: the single call and its value types
//! - `candidate_buffer`: remote ICE candidates waiting for the remote description
//! - `machine`: the pure transition function
//! - `driver`: the event loop that executes effects against real collaborators

pub mod session;
pub mod candidate_buffer;
pub mod machine;
pub mod driver;

pub use session::{CallDirection, CallSession, CallSnapshot, CallState, MediaMode, SessionId};
pub use candidate_buffer::IceCandidateQueue;
pub use machine::{CallEvent, CallMachine, CallNotification, Command, Effect, EndReason, PeerState};
pub use driver::{CallDriver, CallHandle};

use std::error::Error;
use std::fmt;

/// Failures surfaced by the call API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Camera/microphone denied or unavailable
    MediaAccess(String),
    /// Event not legal in the current state; logged and ignored
    ProtocolViolation(String),
    /// Peer connection failed or disconnected
    ConnectionFailure(String),
    /// A call is already in progress
    ConcurrentCall,
    /// A remote candidate could not be applied
    MalformedCandidate(String),
    /// Start-call target is empty or ourselves
    InvalidTarget(String),
    /// Accept/reject with no incoming call ringing
    NoIncomingCall,
    /// Command needs a call in progress
    NoActiveCall,
    /// The driver loop has exited
    DriverStopped,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::MediaAccess(msg) => write!(f, "Media access error: {}", msg),
            CallError::ProtocolViolation(msg) => write!(f, "Signaling protocol violation: {}", msg),
            CallError::ConnectionFailure(msg) => write!(f, "Connection failure: {}", msg),
            CallError::ConcurrentCall => write!(f, "Already in a call"),
            CallError::MalformedCandidate(msg) => write!(f, "Malformed ICE candidate: {}", msg),
            CallError::InvalidTarget(to) => write!(f, "Cannot call '{}'", to),
            CallError::NoIncomingCall => write!(f, "No incoming call"),
            CallError::NoActiveCall => write!(f, "Not in a call"),
            CallError::DriverStopped => write!(f, "Call driver is not running"),
        }
    }
}

impl Error for CallError {}
