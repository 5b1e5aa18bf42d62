//! Call driver
//!
//! The one context object that owns the state machine, the peer connection
//! manager, the signaling transport and media capture. A single task runs
//! `CallDriver::run`; the UI talks to it through a cloneable `CallHandle`.
//!
//! Slow operations (media capture, SDP creation, setting the remote
//! description) are spawned and report back as session-tagged events on the
//! driver's own channel. Sends and candidate application are awaited in the
//! loop so they keep the order the machine emitted them in.

use super::machine::{CallEvent, CallMachine, CallNotification, Command, Effect, PeerState};
use super::session::{CallSnapshot, CallState, SessionId};
use super::CallError;
use crate::config::CallConfig;
use crate::transport::SignalingTransport;
use crate::webrtc::media_track::{LocalTrack, MediaCapture};
use crate::webrtc::peer_connection::{PeerBackend, PeerCallbacks, PeerConnectionManager, PeerLink};
use crate::webrtc::{SignalingMessage, WebRTCError};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_QUEUE: usize = 32;
const NOTIFICATION_QUEUE: usize = 128;

type Reply = oneshot::Sender<Result<(), CallError>>;

struct Request {
    command: Command,
    reply: Reply,
}

/// Internal events: machine events plus media results that carry tracks
enum DriverEvent {
    Call(CallEvent),
    Media {
        session: SessionId,
        result: Result<Vec<LocalTrack>, WebRTCError>,
    },
}

/// Cloneable front end of a running `CallDriver`
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Request>,
    notifications: broadcast::Sender<CallNotification>,
    snapshot: Arc<RwLock<CallSnapshot>>,
}

impl CallHandle {
    /// Call `to`. Resolves once the peer connection is open, or with the
    /// error that ended the call first (`CallError::MediaAccess` when the
    /// devices could not be captured).
    pub async fn start_call(&self, to: &str, audio_only: bool) -> Result<(), CallError> {
        self.request(Command::StartCall { to: to.to_string(), audio_only }).await
    }

    /// Accept the ringing call. Resolves like `start_call`.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(Command::Accept).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(Command::Reject).await
    }

    /// End the current call. Does nothing when idle.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(Command::End).await
    }

    /// Flip local audio mute and return the new mute state
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleMute).await?;
        Ok(self.snapshot.read().muted)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.notifications.subscribe()
    }

    async fn request(&self, command: Command) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Request { command, reply })
            .await
            .map_err(|_| CallError::DriverStopped)?;
        rx.await.map_err(|_| CallError::DriverStopped)?
    }
}

/// Timing knobs taken from `CallConfig`
#[derive(Debug, Clone, Copy)]
struct Timing {
    ring_timeout: Option<Duration>,
    tick_interval: Duration,
}

pub struct CallDriver {
    machine: CallMachine,
    peers: PeerConnectionManager,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaCapture>,
    timing: Timing,

    commands: mpsc::Receiver<Request>,
    signals: mpsc::Receiver<SignalingMessage>,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    events_rx: mpsc::UnboundedReceiver<DriverEvent>,
    notifications: broadcast::Sender<CallNotification>,
    snapshot: Arc<RwLock<CallSnapshot>>,

    /// Tracks captured for the current session
    tracks: Option<(SessionId, Vec<LocalTrack>)>,
    /// start/accept reply held until the connection is open or the call ends
    pending_reply: Option<(SessionId, Reply)>,
    ticker: Option<JoinHandle<()>>,
    ring_timer: Option<JoinHandle<()>>,
}

impl CallDriver {
    /// Build a driver for `local_participant`. `signals` carries decoded
    /// messages from the signaling transport.
    pub fn new(
        local_participant: impl Into<String>,
        config: &CallConfig,
        backend: Arc<dyn PeerBackend>,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaCapture>,
        signals: mpsc::Receiver<SignalingMessage>,
    ) -> (Self, CallHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_QUEUE);
        let snapshot = Arc::new(RwLock::new(CallSnapshot::idle()));

        let handle = CallHandle {
            commands: commands_tx,
            notifications: notifications.clone(),
            snapshot: snapshot.clone(),
        };

        let driver = Self {
            machine: CallMachine::new(local_participant),
            peers: PeerConnectionManager::new(backend),
            transport,
            media,
            timing: Timing {
                ring_timeout: config.ring_timeout(),
                tick_interval: config.tick_interval(),
            },
            commands,
            signals,
            events_tx,
            events_rx,
            notifications,
            snapshot,
            tracks: None,
            pending_reply: None,
            ticker: None,
            ring_timer: None,
        };
        (driver, handle)
    }

    /// Run on a new task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process commands and events until every `CallHandle` is dropped.
    pub async fn run(mut self) {
        info!("Call driver started for {}", self.machine.local_participant());
        let mut signals_open = true;

        loop {
            tokio::select! {
                request = self.commands.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
                message = self.signals.recv(), if signals_open => match message {
                    Some(message) => self.dispatch(CallEvent::Signal(message)).await,
                    None => {
                        warn!("Signaling transport closed");
                        signals_open = false;
                    }
                },
                Some(event) = self.events_rx.recv() => match event {
                    DriverEvent::Call(event) => self.dispatch(event).await,
                    DriverEvent::Media { session, result } => self.on_media(session, result).await,
                },
            }
        }

        self.shutdown().await;
        info!("Call driver stopped for {}", self.machine.local_participant());
    }

    async fn on_request(&mut self, request: Request) {
        let Request { command, reply } = request;
        let waits_for_media = matches!(command, Command::StartCall { .. } | Command::Accept);

        match self.machine.command(command) {
            Err(e) => {
                debug!("Command refused: {}", e);
                let _ = reply.send(Err(e));
            }
            Ok(effects) => {
                self.publish_snapshot();
                match (waits_for_media, self.machine.session_id()) {
                    (true, Some(session)) => {
                        if let Some((_, previous)) = self.pending_reply.replace((session, reply)) {
                            let _ = previous.send(Ok(()));
                        }
                        self.execute(effects).await;
                    }
                    _ => {
                        self.execute(effects).await;
                        let _ = reply.send(Ok(()));
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, event: CallEvent) {
        let effects = self.machine.handle(event);
        self.publish_snapshot();
        self.execute(effects).await;
    }

    async fn on_media(&mut self, session: SessionId, result: Result<Vec<LocalTrack>, WebRTCError>) {
        if self.machine.session_id() != Some(session) {
            debug!("Discarding media captured for stale session {}", session);
            if let Ok(tracks) = result {
                self.media.release(&tracks);
            }
            return;
        }
        match result {
            Ok(tracks) if !matches!(self.machine.state(), CallState::Dialing | CallState::Connecting) => {
                debug!("Session {} no longer needs media ({})", session, self.machine.state());
                self.media.release(&tracks);
            }
            Ok(tracks) => {
                self.tracks = Some((session, tracks));
                self.dispatch(CallEvent::MediaReady { session }).await;
            }
            Err(e) => {
                let reason = e.to_string();
                self.dispatch(CallEvent::MediaFailed { session, reason }).await;
            }
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.apply(effect).await;
        }
    }

    async fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::AcquireMedia { session, mode } => {
                let media = self.media.clone();
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = media.acquire(mode).await;
                    let _ = tx.send(DriverEvent::Media { session, result });
                });
            }

            Effect::OpenConnection { session } => {
                let tracks = match self.tracks.as_ref() {
                    Some((id, tracks)) if *id == session => tracks.clone(),
                    _ => Vec::new(),
                };
                let callbacks = self.callbacks(session);
                let opened = self.peers.acquire(session, &tracks, callbacks).await.map(|_| ());
                let event = match opened {
                    Ok(_) => {
                        self.resolve_pending(session, Ok(()));
                        CallEvent::ConnectionReady { session }
                    }
                    Err(e) => CallEvent::NegotiationFailed { session, reason: e.to_string() },
                };
                self.post(event);
            }

            Effect::CreateOffer { session } => {
                self.spawn_on_link(session, move |link| async move {
                    match link.create_offer().await {
                        Ok(description) => CallEvent::OfferCreated { session, description },
                        Err(e) => CallEvent::NegotiationFailed { session, reason: e.to_string() },
                    }
                });
            }

            Effect::CreateAnswer { session } => {
                self.spawn_on_link(session, move |link| async move {
                    match link.create_answer().await {
                        Ok(description) => CallEvent::AnswerCreated { session, description },
                        Err(e) => CallEvent::NegotiationFailed { session, reason: e.to_string() },
                    }
                });
            }

            Effect::SetRemoteDescription { session, description } => {
                self.spawn_on_link(session, move |link| async move {
                    match link.set_remote_description(description).await {
                        Ok(()) => CallEvent::RemoteDescriptionApplied { session },
                        Err(e) => CallEvent::NegotiationFailed { session, reason: e.to_string() },
                    }
                });
            }

            Effect::ApplyCandidates { session, candidates } => {
                let applied = self.peers.apply_candidates(session, &candidates).await;
                debug!("Session {} applied {}/{} remote candidates", session, applied, candidates.len());
            }

            Effect::Send(message) => {
                let event = message.event_name();
                if let Err(e) = self.transport.send(message).await {
                    error!("Failed to send {}: {}", event, e);
                }
            }

            Effect::SetMuted(muted) => self.media.set_muted(muted),

            Effect::StartTimer { session } => {
                abort(&mut self.ticker);
                let tx = self.events_tx.clone();
                let period = self.timing.tick_interval;
                self.ticker = Some(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        if tx.send(DriverEvent::Call(CallEvent::Tick { session })).is_err() {
                            break;
                        }
                    }
                }));
            }

            Effect::StopTimer => abort(&mut self.ticker),

            Effect::ArmRingTimeout { session } => {
                abort(&mut self.ring_timer);
                if let Some(timeout) = self.timing.ring_timeout {
                    let tx = self.events_tx.clone();
                    self.ring_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let _ = tx.send(DriverEvent::Call(CallEvent::RingTimeout { session }));
                    }));
                }
            }

            Effect::ReleaseConnection { session } => {
                abort(&mut self.ticker);
                abort(&mut self.ring_timer);
                self.peers.release().await;
                self.media.stop();
                self.tracks = None;
                self.post(CallEvent::TeardownComplete { session });
            }

            Effect::Notify(notification) => {
                if let CallNotification::Ended(ref reason) = notification {
                    if let Some((session, _)) = self.pending_reply {
                        self.resolve_pending(session, reason.as_error().map_or(Ok(()), Err));
                    }
                }
                // No subscribers is fine
                let _ = self.notifications.send(notification);
            }
        }
    }

    /// Run `op` against the live connection of `session` off the loop and
    /// post its resulting event back.
    fn spawn_on_link<F, Fut>(&self, session: SessionId, op: F)
    where
        F: FnOnce(Arc<dyn PeerLink>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = CallEvent> + Send + 'static,
    {
        let Some(link) = self.peers.link_for(session) else {
            self.post(CallEvent::NegotiationFailed {
                session,
                reason: WebRTCError::NoConnection.to_string(),
            });
            return;
        };
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = op(link).await;
            let _ = tx.send(DriverEvent::Call(event));
        });
    }

    fn callbacks(&self, session: SessionId) -> PeerCallbacks {
        let candidates = self.events_tx.clone();
        let tracks = self.events_tx.clone();
        let states = self.events_tx.clone();
        PeerCallbacks {
            on_ice_candidate: Arc::new(move |candidate| {
                let _ = candidates.send(DriverEvent::Call(CallEvent::LocalCandidate { session, candidate }));
            }),
            on_remote_track: Arc::new(move |kind, track_id| {
                let _ = tracks.send(DriverEvent::Call(CallEvent::RemoteTrack { session, kind, track_id }));
            }),
            on_connection_state_change: Arc::new(move |state: PeerState| {
                let at = SystemTime::now();
                let _ = states.send(DriverEvent::Call(CallEvent::PeerStateChanged { session, state, at }));
            }),
        }
    }

    fn post(&self, event: CallEvent) {
        let _ = self.events_tx.send(DriverEvent::Call(event));
    }

    fn resolve_pending(&mut self, session: SessionId, result: Result<(), CallError>) {
        if matches!(self.pending_reply, Some((id, _)) if id == session) {
            if let Some((_, reply)) = self.pending_reply.take() {
                let _ = reply.send(result);
            }
        }
    }

    /// Publish before executing effects so replies and notifications never
    /// run ahead of the snapshot.
    fn publish_snapshot(&self) {
        *self.snapshot.write() = self.machine.snapshot();
    }

    async fn shutdown(&mut self) {
        abort(&mut self.ticker);
        abort(&mut self.ring_timer);
        let released = self.peers.release().await;
        if released || self.tracks.take().is_some() {
            self.media.stop();
        }
        if let Some((_, reply)) = self.pending_reply.take() {
            let _ = reply.send(Err(CallError::DriverStopped));
        }
    }
}

fn abort(task: &mut Option<JoinHandle<()>>) {
    if let Some(task) = task.take() {
        task.abort();
    }
}
