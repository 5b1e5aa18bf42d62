//! Signaling relay
//!
//! Routes call signals between registered participants:
//! 1. A client opens `/signaling` and sends `register {userId}`
//! 2. `offer`, `answer` and `call-rejected` are delivered to their `to`
//! 3. `icecandidate` and `call-ended` carry no address; they go to the
//!    participant paired with the sender when the offer was relayed
//!
//! An offer for someone who is not connected is answered with
//! `call-rejected` on their behalf.

use super::codec::{self, InboundFrame};
use crate::web::RelayState;
use crate::webrtc::SignalingMessage;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;

/// Handle one relay WebSocket connection
pub async fn handle_signaling_connection(socket: WebSocket, state: RelayState) {
    let connection_id = state.next_connection_id();
    info!("New signaling connection {}", connection_id);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let mut user: Option<String> = None;

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let text_str: &str = text.as_str();
                match codec::decode(text_str) {
                    Ok(InboundFrame::Register { user_id }) => {
                        if let Some(previous) = user.take() {
                            if previous != user_id {
                                state.unregister(&previous, connection_id);
                            }
                        }
                        state.register(&user_id, connection_id, tx.clone());
                        user = Some(user_id);
                    }
                    Ok(InboundFrame::Signal(message)) => match user.as_deref() {
                        Some(sender) => route_signal(&state, sender, message),
                        None => warn!("Connection {} sent {} before registering", connection_id, message.event_name()),
                    },
                    Err(e) => {
                        warn!("Connection {}: {}", connection_id, e);
                        state.stats.lock().invalid_frames += 1;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                info!("Signaling connection {} closed by client", connection_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Signaling connection {} error: {}", connection_id, e);
                break;
            }
        }
    }

    if let Some(user) = user {
        state.unregister(&user, connection_id);
    }
    send_task.abort();
    info!("Signaling connection {} finished", connection_id);
}

/// Deliver one signal from the registered participant `sender`
pub fn route_signal(state: &RelayState, sender: &str, message: SignalingMessage) {
    let target = match &message {
        SignalingMessage::Offer { to, .. } => {
            state.stats.lock().offers += 1;
            if !state.is_online(to) {
                info!("Offer from {} to offline {}, rejecting", sender, to);
                state.stats.lock().offline_rejections += 1;
                let rejection = SignalingMessage::CallRejected {
                    from: to.clone(),
                    to: sender.to_string(),
                };
                deliver(state, sender, &rejection);
                return;
            }
            match state.partner(to) {
                Some(partner) if partner != sender => debug!("{} is busy with {}, not re-pairing", to, partner),
                _ => state.pair(sender, to),
            }
            Some(to.clone())
        }
        SignalingMessage::Answer { .. } => message.recipient().map(str::to_string),
        SignalingMessage::CallRejected { to, .. } => {
            if state.partner(sender).as_deref() == Some(to.as_str()) {
                state.unpair(sender);
            }
            Some(to.clone())
        }
        SignalingMessage::IceCandidate(_) => state.partner(sender),
        SignalingMessage::CallEnded => state.unpair(sender),
    };

    match target {
        Some(target) => deliver(state, &target, &message),
        None => debug!("No recipient for {} from {}", message.event_name(), sender),
    }
}

fn deliver(state: &RelayState, target: &str, message: &SignalingMessage) {
    let frame = match codec::encode(message) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };
    if !state.send_to(target, frame) {
        debug!("Dropping {} for offline {}", message.event_name(), target);
    }
}
