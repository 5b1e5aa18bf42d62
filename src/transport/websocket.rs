//! WebSocket signaling client
//!
//! Connects to the relay, registers the local participant and shuttles
//! frames in both directions. Reconnection with exponential backoff lives
//! here; the call state machine never sees a dropped socket, only messages
//! that stop arriving.

use super::codec::{self, InboundFrame, WireFrame};
use super::{SignalingTransport, TransportError};
use crate::config::SignalingConfig;
use crate::webrtc::SignalingMessage;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const INCOMING_QUEUE: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Exponential reconnect delay, doubling up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum SessionEnd {
    Disconnected,
    Shutdown,
}

/// Relay client implementing `SignalingTransport`
pub struct WsSignalingClient {
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WsSignalingClient {
    /// Start the connection task for `local_participant`. Decoded call
    /// signals are delivered on the returned receiver.
    pub fn start(local_participant: &str, config: &SignalingConfig) -> (Self, mpsc::Receiver<SignalingMessage>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(connection_loop(
            config.url.clone(),
            local_participant.to_string(),
            Backoff::new(config.reconnect_initial(), config.reconnect_max()),
            outbound_rx,
            incoming_tx,
            connected.clone(),
        ));

        (Self { outbound, connected, task }, incoming_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Stop the connection task
    pub fn shutdown(&self) {
        self.task.abort();
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for WsSignalingClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl SignalingTransport for WsSignalingClient {
    async fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.outbound.send(message).map_err(|_| TransportError::Closed)
    }
}

async fn connection_loop(
    url: String,
    local: String,
    mut backoff: Backoff,
    mut outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    incoming: mpsc::Sender<SignalingMessage>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Signaling connected to {}", url);
                backoff.reset();
                // Anything queued while offline belongs to a pairing the relay has dropped
                while let Ok(stale) = outbound.try_recv() {
                    warn!("Dropping {} queued while disconnected", stale.event_name());
                }
                connected.store(true, Ordering::Relaxed);
                let end = run_session(ws, &local, &mut outbound, &incoming).await;
                connected.store(false, Ordering::Relaxed);
                if let SessionEnd::Shutdown = end {
                    info!("Signaling client for {} shutting down", local);
                    return;
                }
            }
            Err(e) => error!("Signaling connect to {} failed: {}", url, e),
        }

        let delay = backoff.next_delay();
        info!("Reconnecting to signaling in {:?}", delay);
        tokio::time::sleep(delay).await;
        if incoming.is_closed() {
            return;
        }
    }
}

async fn run_session(
    ws: WsStream,
    local: &str,
    outbound: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    incoming: &mpsc::Sender<SignalingMessage>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    let register = match WireFrame::register(local).to_json() {
        Ok(text) => text,
        Err(e) => {
            error!("{}", e);
            return SessionEnd::Shutdown;
        }
    };
    if let Err(e) = write.send(Message::Text(register)).await {
        warn!("Failed to register {}: {}", local, e);
        return SessionEnd::Disconnected;
    }
    debug!("Registered as {}", local);

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                };
                let text = match codec::encode(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("{}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("Signaling send failed: {}", e);
                    return SessionEnd::Disconnected;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match codec::decode(&text) {
                    Ok(InboundFrame::Signal(message)) => {
                        debug!("Signaling received {}", message.event_name());
                        if incoming.send(message).await.is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Ok(InboundFrame::Register { .. }) => debug!("Ignoring register frame from relay"),
                    Err(e) => warn!("{}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Signaling connection closed");
                    return SessionEnd::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Signaling connection error: {}", e);
                    return SessionEnd::Disconnected;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let config = SignalingConfig {
            url: "ws://127.0.0.1:9/signaling".to_string(),
            reconnect_initial_ms: 10_000,
            reconnect_max_ms: 10_000,
        };
        let (client, _incoming) = WsSignalingClient::start("alice", &config);
        let res = client.send(SignalingMessage::CallEnded).await;
        assert!(matches!(res, Err(TransportError::Closed)));
        client.shutdown();
    }
}
