//! ICE candidate buffer
//!
//! Remote candidates can outrun the session description they belong to.
//! Until the remote description is set they are queued in arrival order;
//! afterwards they pass straight through.

use super::session::SessionId;
use crate::webrtc::IceCandidate;
use log::debug;
use std::collections::VecDeque;

/// A candidate tagged with the session it was received under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedCandidate {
    pub session: SessionId,
    pub candidate: IceCandidate,
}

/// FIFO of candidates waiting for the remote description.
///
/// Owned by the state machine rather than by a session, so every candidate
/// is tagged with the session it was received under and `flush` only hands
/// back the ones that belong to the session whose description was set.
#[derive(Debug, Clone, Default)]
pub struct IceCandidateQueue {
    /// Session whose remote description has been set
    ready: Option<SessionId>,
    queue: VecDeque<BufferedCandidate>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate received under `session`, or hand it back when that
    /// session's remote description is already set.
    pub fn enqueue(&mut self, session: SessionId, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.ready == Some(session) {
            return Some(candidate);
        }
        self.queue.push_back(BufferedCandidate { session, candidate });
        None
    }

    /// Mark the remote description of `session` as set and drain the queue
    /// in FIFO order. Candidates tagged with another session are discarded.
    pub fn flush(&mut self, session: SessionId) -> Vec<IceCandidate> {
        self.ready = Some(session);
        let mut flushed = Vec::with_capacity(self.queue.len());
        for item in self.queue.drain(..) {
            if item.session == session {
                flushed.push(item.candidate);
            } else {
                debug!("Dropping candidate buffered for stale session {}", item.session);
            }
        }
        flushed
    }

    /// Drop everything without applying it
    pub fn clear(&mut self) {
        self.queue.clear();
        self.ready = None;
    }

    /// Whether `session` has already been flushed
    pub fn is_ready(&self, session: SessionId) -> bool {
        self.ready == Some(session)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
