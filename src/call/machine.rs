//! Call state machine
//!
//! A pure transition function: every local command, transport message and
//! completion of an asynchronous operation is fed in as an event, and the
//! machine answers with the effects the driver has to execute. Nothing here
//! touches the network, media devices or timers.
//!
//! Completions are tagged with the `SessionId` they were started for; a
//! completion for any other session is stale and dropped, which is what makes
//! "end while media acquisition is still pending" come out clean.

use super::candidate_buffer::IceCandidateQueue;
use super::session::{CallDirection, CallSession, CallSnapshot, CallState, MediaMode, SessionId};
use super::CallError;
use crate::webrtc::{IceCandidate, SdpType, SessionDescription, SignalingMessage, TrackKind};
use log::{debug, info, warn};
use std::time::SystemTime;

/// Local actions issued by the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartCall { to: String, audio_only: bool },
    Accept,
    Reject,
    End,
    ToggleMute,
}

/// Peer connection states the machine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Everything that is not a local command
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Message from the signaling transport
    Signal(SignalingMessage),
    /// Local media capture finished
    MediaReady { session: SessionId },
    /// Local media capture was denied or no device is available
    MediaFailed { session: SessionId, reason: String },
    /// Peer connection acquired with local tracks attached
    ConnectionReady { session: SessionId },
    OfferCreated { session: SessionId, description: SessionDescription },
    AnswerCreated { session: SessionId, description: SessionDescription },
    RemoteDescriptionApplied { session: SessionId },
    /// Connection setup or an SDP step failed
    NegotiationFailed { session: SessionId, reason: String },
    /// Locally gathered candidate to trickle to the remote peer
    LocalCandidate { session: SessionId, candidate: IceCandidate },
    RemoteTrack { session: SessionId, kind: TrackKind, track_id: String },
    PeerStateChanged { session: SessionId, state: PeerState, at: SystemTime },
    /// One elapsed-time tick while active
    Tick { session: SessionId },
    /// Nobody answered in time
    RingTimeout { session: SessionId },
    /// The driver finished releasing the connection
    TeardownComplete { session: SessionId },
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// Caller gave up before we answered
    RemoteCancelled,
    /// We declined an incoming call
    Declined,
    /// The remote side declined, was busy, or could not be reached
    Rejected,
    Timeout,
    MediaAccess(String),
    ConnectionFailed(String),
    NegotiationFailed(String),
}

impl EndReason {
    /// The failure a pending start/accept should report, if any
    pub fn as_error(&self) -> Option<CallError> {
        match self {
            EndReason::MediaAccess(msg) => Some(CallError::MediaAccess(msg.clone())),
            EndReason::ConnectionFailed(msg) | EndReason::NegotiationFailed(msg) => {
                Some(CallError::ConnectionFailure(msg.clone()))
            }
            _ => None,
        }
    }
}

/// What the UI layer is told
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotification {
    StateChanged(CallState),
    /// Start the ring signal for an incoming call
    IncomingCall { from: String, audio_only: bool },
    /// Stop the ring signal
    RingStopped,
    Connected,
    Elapsed(u64),
    MuteChanged(bool),
    RemoteTrack { kind: TrackKind, track_id: String },
    Ended(EndReason),
}

/// Side effects requested by a transition, executed in order by the driver
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    AcquireMedia { session: SessionId, mode: MediaMode },
    OpenConnection { session: SessionId },
    CreateOffer { session: SessionId },
    CreateAnswer { session: SessionId },
    SetRemoteDescription { session: SessionId, description: SessionDescription },
    ApplyCandidates { session: SessionId, candidates: Vec<IceCandidate> },
    Send(SignalingMessage),
    SetMuted(bool),
    StartTimer { session: SessionId },
    StopTimer,
    ArmRingTimeout { session: SessionId },
    ReleaseConnection { session: SessionId },
    Notify(CallNotification),
}

/// The call state machine for one local participant
#[derive(Debug)]
pub struct CallMachine {
    local: String,
    state: CallState,
    session: Option<CallSession>,
    /// Remote candidates waiting for the remote description
    candidates: IceCandidateQueue,
    /// Local candidates held until our offer/answer has gone out
    outbound: Vec<IceCandidate>,
}

impl CallMachine {
    pub fn new(local_participant: impl Into<String>) -> Self {
        Self {
            local: local_participant.into(),
            state: CallState::Idle,
            session: None,
            candidates: IceCandidateQueue::new(),
            outbound: Vec::new(),
        }
    }

    pub fn local_participant(&self) -> &str {
        &self.local
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Number of remote candidates waiting for the remote description
    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        match self.session {
            Some(ref s) => CallSnapshot {
                state: self.state,
                remote_participant: s.remote_participant.clone(),
                direction: Some(s.direction),
                media_mode: Some(s.media_mode),
                started_at: s.started_at,
                elapsed_seconds: s.elapsed_seconds,
                muted: s.muted,
            },
            None => CallSnapshot::idle(),
        }
    }

    /// Apply a local command. Rejected commands produce no effects.
    pub fn command(&mut self, command: Command) -> Result<Vec<Effect>, CallError> {
        let mut out = Vec::new();
        match command {
            Command::StartCall { to, audio_only } => self.start_call(&to, audio_only, &mut out)?,
            Command::Accept => self.accept(&mut out)?,
            Command::Reject => {
                if self.state != CallState::Ringing {
                    return Err(CallError::NoIncomingCall);
                }
                self.decline(EndReason::Declined, &mut out);
            }
            Command::End => self.end_local(&mut out),
            Command::ToggleMute => {
                let session = match (self.state, self.session.as_mut()) {
                    (CallState::Idle | CallState::Ending, _) | (_, None) => {
                        return Err(CallError::NoActiveCall)
                    }
                    (_, Some(session)) => session,
                };
                session.muted = !session.muted;
                out.push(Effect::SetMuted(session.muted));
                out.push(Effect::Notify(CallNotification::MuteChanged(session.muted)));
            }
        }
        Ok(out)
    }

    /// Apply a transport message or an operation completion.
    pub fn handle(&mut self, event: CallEvent) -> Vec<Effect> {
        let mut out = Vec::new();
        match event {
            CallEvent::Signal(message) => self.on_signal(message, &mut out),

            CallEvent::MediaReady { session } => {
                if !self.is_current(session, "media ready") {
                    return out;
                }
                if matches!(self.state, CallState::Dialing | CallState::Connecting) {
                    out.push(Effect::OpenConnection { session });
                } else {
                    self.violation(format!("media ready while {}", self.state));
                }
            }

            CallEvent::MediaFailed { session, reason } => {
                if self.is_current(session, "media failure") && self.is_live() {
                    warn!("Session {} media access failed: {}", session, reason);
                    self.abort(EndReason::MediaAccess(reason), &mut out);
                }
            }

            CallEvent::ConnectionReady { session } => {
                if !self.is_current(session, "connection ready") {
                    return out;
                }
                match (self.state, self.direction()) {
                    (CallState::Dialing, Some(CallDirection::Outgoing)) => {
                        out.push(Effect::CreateOffer { session });
                    }
                    (CallState::Connecting, Some(CallDirection::Incoming)) => {
                        let offer = self.session.as_mut().and_then(|s| s.pending_offer.take());
                        match offer {
                            Some(description) => {
                                out.push(Effect::SetRemoteDescription { session, description });
                            }
                            None => self.violation("connection ready without a stored offer".into()),
                        }
                    }
                    (state, _) => self.violation(format!("connection ready while {}", state)),
                }
            }

            CallEvent::OfferCreated { session, description } => {
                if !self.is_current(session, "offer") {
                    return out;
                }
                let local = self.local.clone();
                match self.session.as_mut() {
                    Some(s) if self.state == CallState::Dialing && !s.offer_sent => {
                        s.offer_sent = true;
                        info!("Session {} sending offer to {}", session, s.remote());
                        out.push(Effect::Send(SignalingMessage::Offer {
                            from: local,
                            to: s.remote().to_string(),
                            description,
                            audio_only: s.media_mode.is_audio_only(),
                        }));
                        self.release_outbound(&mut out);
                    }
                    _ => self.violation(format!("offer created while {}", self.state)),
                }
            }

            CallEvent::AnswerCreated { session, description } => {
                if !self.is_current(session, "answer") {
                    return out;
                }
                let local = self.local.clone();
                match self.session.as_mut() {
                    Some(s) if self.state == CallState::Connecting && s.direction == CallDirection::Incoming => {
                        s.offer_sent = true;
                        info!("Session {} sending answer to {}", session, s.remote());
                        out.push(Effect::Send(SignalingMessage::Answer {
                            from: local,
                            to: s.remote().to_string(),
                            description,
                        }));
                        self.release_outbound(&mut out);
                    }
                    _ => self.violation(format!("answer created while {}", self.state)),
                }
            }

            CallEvent::RemoteDescriptionApplied { session } => {
                if !self.is_current(session, "remote description") || !self.is_live() {
                    return out;
                }
                if self.candidates.is_ready(session) {
                    debug!("Session {} remote description already applied", session);
                    return out;
                }
                if self.direction() == Some(CallDirection::Incoming) {
                    out.push(Effect::CreateAnswer { session });
                }
                let candidates = self.candidates.flush(session);
                if !candidates.is_empty() {
                    debug!("Session {} flushing {} buffered candidates", session, candidates.len());
                    out.push(Effect::ApplyCandidates { session, candidates });
                }
            }

            CallEvent::NegotiationFailed { session, reason } => {
                if self.is_current(session, "negotiation failure") && self.is_live() {
                    warn!("Session {} negotiation failed: {}", session, reason);
                    self.abort(EndReason::NegotiationFailed(reason), &mut out);
                }
            }

            CallEvent::LocalCandidate { session, candidate } => {
                if !self.is_current(session, "local candidate") || !self.is_live() {
                    return out;
                }
                let signaled = self.session.as_ref().map(|s| s.offer_sent).unwrap_or(false);
                if signaled {
                    out.push(Effect::Send(SignalingMessage::IceCandidate(candidate)));
                } else {
                    self.outbound.push(candidate);
                }
            }

            CallEvent::RemoteTrack { session, kind, track_id } => {
                if self.is_current(session, "remote track") && self.is_live() {
                    out.push(Effect::Notify(CallNotification::RemoteTrack { kind, track_id }));
                }
            }

            CallEvent::PeerStateChanged { session, state, at } => {
                if self.is_current(session, "peer state") {
                    self.on_peer_state(session, state, at, &mut out);
                }
            }

            CallEvent::Tick { session } => {
                if !self.is_current(session, "tick") || self.state != CallState::Active {
                    return out;
                }
                if let Some(s) = self.session.as_mut() {
                    s.elapsed_seconds += 1;
                    out.push(Effect::Notify(CallNotification::Elapsed(s.elapsed_seconds)));
                }
            }

            CallEvent::RingTimeout { session } => {
                if !self.is_current(session, "ring timeout") {
                    return out;
                }
                match self.state {
                    CallState::Dialing => {
                        info!("Session {} unanswered, giving up", session);
                        self.hang_up(EndReason::Timeout, &mut out);
                    }
                    CallState::Ringing => {
                        info!("Session {} not picked up, declining", session);
                        self.decline(EndReason::Timeout, &mut out);
                    }
                    _ => {}
                }
            }

            CallEvent::TeardownComplete { session } => {
                if self.state == CallState::Ending && self.session_id() == Some(session) {
                    self.session = None;
                    self.set_state(CallState::Idle, &mut out);
                } else {
                    debug!("Ignoring teardown completion for {} while {}", session, self.state);
                }
            }
        }
        out
    }

    fn start_call(&mut self, to: &str, audio_only: bool, out: &mut Vec<Effect>) -> Result<(), CallError> {
        if self.state != CallState::Idle {
            return Err(CallError::ConcurrentCall);
        }
        let to = to.trim();
        if to.is_empty() || to == self.local {
            return Err(CallError::InvalidTarget(to.to_string()));
        }

        let mode = MediaMode::from_audio_only(audio_only);
        let mut session = CallSession::outgoing(&self.local, to, mode);
        session.connection_requested = true;
        let id = session.id;
        info!("Session {} calling {} ({:?})", id, to, mode);

        self.session = Some(session);
        self.outbound.clear();
        self.set_state(CallState::Dialing, out);
        out.push(Effect::AcquireMedia { session: id, mode });
        out.push(Effect::ArmRingTimeout { session: id });
        Ok(())
    }

    fn accept(&mut self, out: &mut Vec<Effect>) -> Result<(), CallError> {
        if self.state != CallState::Ringing {
            return Err(CallError::NoIncomingCall);
        }
        let (id, mode) = match self.session.as_mut() {
            Some(s) => {
                s.connection_requested = true;
                (s.id, s.media_mode)
            }
            None => return Err(CallError::NoIncomingCall),
        };
        info!("Session {} accepted", id);
        out.push(Effect::Notify(CallNotification::RingStopped));
        self.set_state(CallState::Connecting, out);
        out.push(Effect::AcquireMedia { session: id, mode });
        Ok(())
    }

    fn end_local(&mut self, out: &mut Vec<Effect>) {
        match self.state {
            CallState::Idle | CallState::Ending => {
                debug!("End requested while {}, nothing to do", self.state);
            }
            CallState::Ringing => self.decline(EndReason::Declined, out),
            CallState::Dialing | CallState::Connecting | CallState::Active => {
                self.hang_up(EndReason::LocalHangup, out);
            }
        }
    }

    fn on_signal(&mut self, message: SignalingMessage, out: &mut Vec<Effect>) {
        match message {
            SignalingMessage::Offer { from, to, description, audio_only } => {
                if to != self.local {
                    self.violation(format!("offer addressed to {}", to));
                    return;
                }
                if self.state == CallState::Idle {
                    let mode = MediaMode::from_audio_only(audio_only);
                    let session = CallSession::incoming(&self.local, &from, mode, description);
                    let id = session.id;
                    info!("Session {} incoming call from {} ({:?})", id, from, mode);
                    self.session = Some(session);
                    self.outbound.clear();
                    self.set_state(CallState::Ringing, out);
                    out.push(Effect::Notify(CallNotification::IncomingCall { from, audio_only }));
                    out.push(Effect::ArmRingTimeout { session: id });
                } else if self.remote() == Some(from.as_str()) {
                    debug!("Ignoring duplicate offer from {}", from);
                } else {
                    info!("Busy, declining offer from {}", from);
                    out.push(Effect::Send(SignalingMessage::CallRejected {
                        from: self.local.clone(),
                        to: from,
                    }));
                }
            }

            SignalingMessage::Answer { from, description, .. } => {
                if self.state == CallState::Idle {
                    debug!("Ignoring stale answer from {}", from);
                    return;
                }
                let acceptable = self.state == CallState::Dialing
                    && description.sdp_type == SdpType::Answer
                    && self
                        .session
                        .as_ref()
                        .map(|s| s.offer_sent && s.remote() == from)
                        .unwrap_or(false);
                if !acceptable {
                    self.violation(format!("answer from {} while {}", from, self.state));
                    return;
                }
                if let Some(session) = self.session_id() {
                    self.set_state(CallState::Connecting, out);
                    out.push(Effect::SetRemoteDescription { session, description });
                }
            }

            SignalingMessage::IceCandidate(candidate) => {
                if !self.is_live() {
                    debug!("Ignoring remote candidate while {}", self.state);
                    return;
                }
                if let Some(session) = self.session_id() {
                    match self.candidates.enqueue(session, candidate) {
                        Some(candidate) => out.push(Effect::ApplyCandidates {
                            session,
                            candidates: vec![candidate],
                        }),
                        None => debug!("Session {} buffered remote candidate ({} queued)", session, self.candidates.len()),
                    }
                }
            }

            SignalingMessage::CallEnded => match self.state {
                CallState::Idle | CallState::Ending => {
                    debug!("Ignoring call-ended while {}", self.state);
                }
                CallState::Ringing => {
                    info!("Caller cancelled");
                    out.push(Effect::Notify(CallNotification::RingStopped));
                    self.terminate(EndReason::RemoteCancelled, out);
                }
                CallState::Dialing | CallState::Connecting | CallState::Active => {
                    info!("Remote hung up");
                    self.terminate(EndReason::RemoteHangup, out);
                }
            },

            SignalingMessage::CallRejected { from, .. } => {
                if self.state == CallState::Idle {
                    debug!("Ignoring stale call-rejected from {}", from);
                } else if self.state == CallState::Dialing && self.remote() == Some(from.as_str()) {
                    info!("Call rejected by {}", from);
                    self.terminate(EndReason::Rejected, out);
                } else {
                    self.violation(format!("call-rejected from {} while {}", from, self.state));
                }
            }
        }
    }

    fn on_peer_state(&mut self, session: SessionId, state: PeerState, at: SystemTime, out: &mut Vec<Effect>) {
        match state {
            PeerState::Connected => {
                if self.state != CallState::Connecting {
                    debug!("Session {} connected while {}", session, self.state);
                    return;
                }
                if let Some(s) = self.session.as_mut() {
                    s.started_at = Some(at);
                    s.elapsed_seconds = 0;
                }
                info!("Session {} media connected", session);
                self.set_state(CallState::Active, out);
                out.push(Effect::Notify(CallNotification::Connected));
                out.push(Effect::StartTimer { session });
            }
            PeerState::Disconnected | PeerState::Failed => {
                if matches!(self.state, CallState::Connecting | CallState::Active) {
                    warn!("Session {} connection {:?}", session, state);
                    let reason = format!("peer connection {}", if state == PeerState::Failed { "failed" } else { "disconnected" });
                    self.terminate(EndReason::ConnectionFailed(reason), out);
                }
            }
            PeerState::Closed => {}
        }
    }

    /// Local hangup of a call the remote side may already know about
    fn hang_up(&mut self, reason: EndReason, out: &mut Vec<Effect>) {
        if self.remote_knows() {
            out.push(Effect::Send(SignalingMessage::CallEnded));
        }
        self.terminate(reason, out);
    }

    /// Decline the ringing incoming call
    fn decline(&mut self, reason: EndReason, out: &mut Vec<Effect>) {
        if let Some(remote) = self.remote().map(str::to_string) {
            out.push(Effect::Notify(CallNotification::RingStopped));
            out.push(Effect::Send(SignalingMessage::CallRejected {
                from: self.local.clone(),
                to: remote,
            }));
        }
        self.terminate(reason, out);
    }

    /// Local failure: tell the remote side (if it knows about us) and tear down
    fn abort(&mut self, reason: EndReason, out: &mut Vec<Effect>) {
        if self.state == CallState::Ringing {
            self.decline(reason, out);
        } else {
            self.hang_up(reason, out);
        }
    }

    /// Common teardown. Always clears the candidate queue and asks for the
    /// connection to be released; waits in `Ending` only if one was requested.
    fn terminate(&mut self, reason: EndReason, out: &mut Vec<Effect>) {
        let was_active = self.state == CallState::Active;
        self.outbound.clear();
        self.candidates.clear();
        let Some(session) = self.session.as_mut() else {
            self.set_state(CallState::Idle, out);
            return;
        };
        session.pending_offer = None;
        let id = session.id;
        let wait_for_release = session.connection_requested;

        if was_active {
            out.push(Effect::StopTimer);
        }
        out.push(Effect::ReleaseConnection { session: id });
        out.push(Effect::Notify(CallNotification::Ended(reason)));

        if wait_for_release {
            self.set_state(CallState::Ending, out);
        } else {
            self.session = None;
            self.set_state(CallState::Idle, out);
        }
    }

    fn release_outbound(&mut self, out: &mut Vec<Effect>) {
        for candidate in self.outbound.drain(..) {
            out.push(Effect::Send(SignalingMessage::IceCandidate(candidate)));
        }
    }

    fn set_state(&mut self, state: CallState, out: &mut Vec<Effect>) {
        if self.state != state {
            debug!("Call state change: {} -> {}", self.state, state);
            self.state = state;
            out.push(Effect::Notify(CallNotification::StateChanged(state)));
        }
    }

    fn is_current(&self, session: SessionId, what: &str) -> bool {
        if self.session_id() == Some(session) {
            true
        } else {
            debug!("Ignoring stale {} for session {}", what, session);
            false
        }
    }

    /// A session exists and is not being torn down
    fn is_live(&self) -> bool {
        !matches!(self.state, CallState::Idle | CallState::Ending)
    }

    /// Whether the remote participant has heard from us in this session
    fn remote_knows(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.offer_sent || s.direction == CallDirection::Incoming)
            .unwrap_or(false)
    }

    fn direction(&self) -> Option<CallDirection> {
        self.session.as_ref().map(|s| s.direction)
    }

    fn remote(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.remote_participant.as_deref())
    }

    fn violation(&self, detail: String) {
        warn!("{}", CallError::ProtocolViolation(detail));
    }
}
