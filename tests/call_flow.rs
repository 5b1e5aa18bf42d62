//! End-to-end call flows: drivers talking through the relay routing, with a
//! scripted peer backend standing in for webrtc-rs.

use async_trait::async_trait;
use bytes::Bytes;
use callcore::call::{CallDriver, CallError, CallHandle, CallNotification, CallState, EndReason, MediaMode, PeerState};
use callcore::config::{CallConfig, Config, DEFAULT_STUN_SERVER};
use callcore::transport::codec::{self, InboundFrame};
use callcore::transport::signaling_server::route_signal;
use callcore::transport::{SignalingTransport, TransportError};
use callcore::web::RelayState;
use callcore::webrtc::{
    IceCandidate, LocalTrack, MediaCapture, PeerBackend, PeerCallbacks, PeerLink, SampleMediaCapture,
    SessionDescription, SignalingMessage, TrackKind, WebRTCError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

/// Sends through the relay routing as a registered participant
struct LoopbackTransport {
    relay: RelayState,
    user: String,
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        route_signal(&self.relay, &self.user, message);
        Ok(())
    }
}

#[derive(Default)]
struct LinkStats {
    created: AtomicUsize,
    closed: AtomicUsize,
    /// Track ids attached to the most recent link
    attached: Mutex<Vec<String>>,
}

impl LinkStats {
    fn live(&self) -> usize {
        self.created.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }

    fn attached(&self) -> Vec<String> {
        let mut ids = self.attached.lock().clone();
        ids.sort();
        ids
    }
}

struct FakeBackend {
    stats: Arc<LinkStats>,
    /// Fail every connection attempt
    refuse: bool,
}

#[async_trait]
impl PeerBackend for FakeBackend {
    async fn create(&self, callbacks: PeerCallbacks) -> Result<Arc<dyn PeerLink>, WebRTCError> {
        if self.refuse {
            return Err(WebRTCError::ConnectionFailed("no route to STUN server".into()));
        }
        self.stats.attached.lock().clear();
        let n = self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeLink {
            stats: self.stats.clone(),
            callbacks,
            tag: n,
            progress: Mutex::new(Progress::default()),
        }))
    }
}

#[derive(Default)]
struct Progress {
    local: bool,
    remote: bool,
    candidate: bool,
    connected: bool,
}

/// Reports connected once it has both descriptions and a remote candidate
struct FakeLink {
    stats: Arc<LinkStats>,
    callbacks: PeerCallbacks,
    tag: usize,
    progress: Mutex<Progress>,
}

impl FakeLink {
    fn update(&self, f: impl FnOnce(&mut Progress)) {
        let ready = {
            let mut p = self.progress.lock();
            f(&mut p);
            let ready = p.local && p.remote && p.candidate && !p.connected;
            if ready {
                p.connected = true;
            }
            ready
        };
        if ready {
            let on_state = self.callbacks.on_connection_state_change.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                on_state(PeerState::Connected);
            });
        }
    }

    fn gather(&self) {
        let line = format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", self.tag, self.tag + 1);
        (self.callbacks.on_ice_candidate)(IceCandidate::from_line(line));
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), WebRTCError> {
        self.stats.attached.lock().push(track.id.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, WebRTCError> {
        self.gather();
        self.update(|p| p.local = true);
        Ok(SessionDescription::offer("v=0 fake offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError> {
        self.gather();
        self.update(|p| p.local = true);
        Ok(SessionDescription::answer("v=0 fake answer"))
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<(), WebRTCError> {
        self.update(|p| p.remote = true);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), WebRTCError> {
        self.update(|p| p.candidate = true);
        Ok(())
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Capture whose first acquisition takes `delay`, like a permission prompt
/// the user sits on
struct SlowFirstCapture {
    inner: Arc<SampleMediaCapture>,
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl MediaCapture for SlowFirstCapture {
    async fn acquire(&self, mode: MediaMode) -> Result<Vec<LocalTrack>, WebRTCError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.acquire(mode).await
    }

    fn set_muted(&self, muted: bool) {
        self.inner.set_muted(muted);
    }

    fn release(&self, tracks: &[LocalTrack]) {
        self.inner.release(tracks);
    }

    fn stop(&self) {
        self.inner.stop();
    }
}

fn capturing(capture: &SampleMediaCapture) -> Vec<String> {
    let mut ids: Vec<_> = capture.tracks().into_iter().map(|t| t.id).collect();
    ids.sort();
    ids
}

struct Participant {
    handle: CallHandle,
    notes: broadcast::Receiver<CallNotification>,
    links: Arc<LinkStats>,
}

impl Participant {
    fn join(relay: &RelayState, name: &str, camera: bool) -> Self {
        Self::join_with(relay, name, Arc::new(SampleMediaCapture::new(camera)), false)
    }

    fn join_with(relay: &RelayState, name: &str, media: Arc<dyn MediaCapture>, refuse: bool) -> Self {
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
        relay.register(name, relay.next_connection_id(), frames_tx);

        let (signals_tx, signals_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(text) = frames_rx.recv().await {
                if let Ok(InboundFrame::Signal(message)) = codec::decode(&text) {
                    if signals_tx.send(message).await.is_err() {
                        break;
                    }
                }
            }
        });

        let config = CallConfig {
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            ring_timeout_secs: 0,
            tick_interval_ms: 20,
        };
        let links = Arc::new(LinkStats::default());
        let (driver, handle) = CallDriver::new(
            name,
            &config,
            Arc::new(FakeBackend { stats: links.clone(), refuse }),
            Arc::new(LoopbackTransport { relay: relay.clone(), user: name.to_string() }),
            media,
            signals_rx,
        );
        let notes = handle.subscribe();
        driver.spawn();
        Self { handle, notes, links }
    }

    async fn expect(&mut self, wanted: impl Fn(&CallNotification) -> bool) -> CallNotification {
        let notes = &mut self.notes;
        tokio::time::timeout(WAIT, async {
            loop {
                match notes.recv().await {
                    Ok(note) if wanted(&note) => return note,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(e) => panic!("notifications closed: {}", e),
                }
            }
        })
        .await
        .expect("timed out waiting for notification")
    }

    async fn settle(&self, state: CallState) {
        tokio::time::timeout(WAIT, async {
            while self.handle.snapshot().state != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {}, stuck in {}", state, self.handle.snapshot().state));
    }
}

fn relay() -> RelayState {
    RelayState::new(Config::default())
}

#[tokio::test]
async fn audio_video_call_connects_ticks_and_hangs_up() {
    let relay = relay();
    let mut alice = Participant::join(&relay, "alice", true);
    let mut bob = Participant::join(&relay, "bob", true);

    alice.handle.start_call("bob", false).await.unwrap();
    assert_eq!(alice.handle.snapshot().state, CallState::Dialing);

    let incoming = bob.expect(|n| matches!(n, CallNotification::IncomingCall { .. })).await;
    assert_eq!(incoming, CallNotification::IncomingCall { from: "alice".into(), audio_only: false });
    assert_eq!(bob.handle.snapshot().state, CallState::Ringing);

    bob.handle.accept_call().await.unwrap();

    alice.settle(CallState::Active).await;
    bob.settle(CallState::Active).await;
    assert!(alice.handle.snapshot().started_at.is_some());

    alice.expect(|n| matches!(n, CallNotification::Elapsed(2))).await;
    assert!(alice.handle.snapshot().elapsed_seconds >= 2);

    assert!(alice.handle.toggle_mute().await.unwrap());
    assert!(alice.handle.snapshot().muted);

    alice.handle.end_call().await.unwrap();
    let ended = bob.expect(|n| matches!(n, CallNotification::Ended(_))).await;
    assert_eq!(ended, CallNotification::Ended(EndReason::RemoteHangup));

    alice.settle(CallState::Idle).await;
    bob.settle(CallState::Idle).await;
    assert_eq!(alice.links.live(), 0);
    assert_eq!(bob.links.live(), 0);
    assert_eq!(relay.active_pairs(), 0);
}

#[tokio::test]
async fn rejected_call_leaves_caller_idle() {
    let relay = relay();
    let mut alice = Participant::join(&relay, "alice", true);
    let mut bob = Participant::join(&relay, "bob", true);

    alice.handle.start_call("bob", true).await.unwrap();
    bob.expect(|n| matches!(n, CallNotification::IncomingCall { .. })).await;
    bob.handle.reject_call().await.unwrap();

    let ended = alice.expect(|n| matches!(n, CallNotification::Ended(_))).await;
    assert_eq!(ended, CallNotification::Ended(EndReason::Rejected));
    alice.settle(CallState::Idle).await;
    bob.settle(CallState::Idle).await;
    assert_eq!(alice.links.live(), 0);
    assert_eq!(bob.links.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn offline_callee_is_rejected_by_relay() {
    let relay = relay();
    let mut alice = Participant::join(&relay, "alice", false);

    alice.handle.start_call("nobody", true).await.unwrap();
    let ended = alice.expect(|n| matches!(n, CallNotification::Ended(_))).await;
    assert_eq!(ended, CallNotification::Ended(EndReason::Rejected));
    alice.settle(CallState::Idle).await;
    assert_eq!(alice.links.live(), 0);
}

#[tokio::test]
async fn busy_callee_rejects_second_caller() {
    let relay = relay();
    let mut alice = Participant::join(&relay, "alice", true);
    let mut bob = Participant::join(&relay, "bob", true);
    let mut carol = Participant::join(&relay, "carol", true);

    alice.handle.start_call("bob", true).await.unwrap();
    bob.expect(|n| matches!(n, CallNotification::IncomingCall { .. })).await;

    carol.handle.start_call("bob", true).await.unwrap();
    let ended = carol.expect(|n| matches!(n, CallNotification::Ended(_))).await;
    assert_eq!(ended, CallNotification::Ended(EndReason::Rejected));
    carol.settle(CallState::Idle).await;

    assert_eq!(bob.handle.snapshot().remote_participant.as_deref(), Some("alice"));
    assert_eq!(bob.handle.snapshot().state, CallState::Ringing);
    alice.handle.end_call().await.unwrap();
    bob.expect(|n| matches!(n, CallNotification::Ended(EndReason::RemoteCancelled))).await;
    bob.settle(CallState::Idle).await;
}

#[tokio::test]
async fn media_denied_fails_start_call() {
    let relay = relay();
    let alice = Participant::join(&relay, "alice", false);
    let _bob = Participant::join(&relay, "bob", true);

    let err = alice.handle.start_call("bob", false).await.unwrap_err();
    assert!(matches!(err, CallError::MediaAccess(_)));
    alice.settle(CallState::Idle).await;
    assert_eq!(alice.links.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_connection_fails_start_call() {
    let relay = relay();
    let capture = Arc::new(SampleMediaCapture::new(true));
    let alice = Participant::join_with(&relay, "alice", capture.clone(), true);
    let _bob = Participant::join(&relay, "bob", true);

    let err = alice.handle.start_call("bob", true).await.unwrap_err();
    assert!(matches!(err, CallError::ConnectionFailure(_)));
    alice.settle(CallState::Idle).await;
    assert!(capturing(&capture).is_empty());
}

/// Alice starts a call whose media takes `delay`, then hangs up before it
/// arrives
async fn cancel_during_media(relay: &RelayState, delay: Duration) -> (Participant, Arc<SampleMediaCapture>) {
    let capture = Arc::new(SampleMediaCapture::new(true));
    let media = Arc::new(SlowFirstCapture {
        inner: capture.clone(),
        delay,
        calls: AtomicUsize::new(0),
    });
    let alice = Participant::join_with(relay, "alice", media, false);

    let caller = alice.handle.clone();
    let pending = tokio::spawn(async move { caller.start_call("bob", false).await });
    alice.settle(CallState::Dialing).await;
    alice.handle.end_call().await.unwrap();
    alice.settle(CallState::Idle).await;

    let reply = tokio::time::timeout(WAIT, pending).await.expect("start_call never resolved").unwrap();
    assert!(reply.is_ok());
    (alice, capture)
}

#[tokio::test]
async fn ending_during_media_capture_leaves_nothing_behind() {
    let relay = relay();
    let mut bob = Participant::join(&relay, "bob", true);
    let (alice, capture) = cancel_during_media(&relay, Duration::from_millis(200)).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.handle.snapshot().state, CallState::Idle);
    assert_eq!(alice.links.created.load(Ordering::SeqCst), 0);
    assert_eq!(alice.links.live(), 0);
    assert!(capturing(&capture).is_empty());
    assert!(capture
        .write_sample(TrackKind::Audio, Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
        .await
        .is_err());
    assert!(bob.notes.try_recv().is_err());
    assert_eq!(bob.handle.snapshot().state, CallState::Idle);
}

#[tokio::test]
async fn quick_redial_captures_only_live_tracks() {
    let relay = relay();
    let mut bob = Participant::join(&relay, "bob", true);
    let (alice, capture) = cancel_during_media(&relay, Duration::from_millis(300)).await;

    alice.handle.start_call("bob", false).await.unwrap();
    bob.expect(|n| matches!(n, CallNotification::IncomingCall { .. })).await;

    // the first acquisition lands while the second call is dialing
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(alice.handle.snapshot().state, CallState::Dialing);
    assert_eq!(alice.links.live(), 1);
    let live = alice.links.attached();
    assert_eq!(live.len(), 2);
    assert_eq!(capturing(&capture), live);

    alice.handle.end_call().await.unwrap();
    bob.expect(|n| matches!(n, CallNotification::Ended(EndReason::RemoteCancelled))).await;
    alice.settle(CallState::Idle).await;
    assert_eq!(alice.links.live(), 0);
    assert!(capturing(&capture).is_empty());
}

#[tokio::test]
async fn second_start_call_is_refused() {
    let relay = relay();
    let alice = Participant::join(&relay, "alice", true);
    let _bob = Participant::join(&relay, "bob", true);

    alice.handle.start_call("bob", true).await.unwrap();
    let err = alice.handle.start_call("bob", true).await.unwrap_err();
    assert_eq!(err, CallError::ConcurrentCall);
    assert_eq!(alice.links.live(), 1);
}

#[tokio::test]
async fn stale_answer_while_idle_is_ignored() {
    let relay = relay();
    let alice = Participant::join(&relay, "alice", true);

    route_signal(
        &relay,
        "bob",
        SignalingMessage::Answer {
            from: "bob".into(),
            to: "alice".into(),
            description: SessionDescription::answer("v=0 late"),
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.handle.snapshot().state, CallState::Idle);
    assert_eq!(alice.links.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handle_reports_stopped_driver() {
    let relay = relay();
    let (_signals_tx, signals_rx) = mpsc::channel(1);
    let (driver, handle) = CallDriver::new(
        "alice",
        &CallConfig::default(),
        Arc::new(FakeBackend { stats: Arc::new(LinkStats::default()), refuse: false }),
        Arc::new(LoopbackTransport { relay, user: "alice".into() }),
        Arc::new(SampleMediaCapture::new(false)),
        signals_rx,
    );
    drop(driver);
    assert_eq!(handle.end_call().await, Err(CallError::DriverStopped));
}
