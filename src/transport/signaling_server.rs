//! Coordinator signaling endpoint
//!
//! One WebSocket per participant. The flow is:
//! 1. Upgrade registers the connection with the matchmaker
//! 2. `find_match` / `end_chat` drive the pairing queue
//! 3. `offer` / `answer` / `candidate` are relayed verbatim to the partner
//! 4. Close, error or prolonged silence unregisters the connection

use crate::pairing::{Matchmaker, ParticipantId};
use crate::web::SharedState;
use crate::webrtc::signaling::{ClientMessage, ServerMessage, SignalingParser};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};

/// Handle one participant's signaling WebSocket until it goes away
pub async fn handle_signaling_connection(socket: WebSocket, state: Arc<SharedState>) {
    let matchmaker = state.matchmaker.clone();
    let ping_interval = state.config.signaling.ping_interval();
    let idle_timeout = state.config.signaling.timeout();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let id = matchmaker.connect(tx.clone());

    // Writer task: outbound messages plus keepalive pings
    let send_task = tokio::spawn(async move {
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match SignalingParser::format(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {:?}: {}", msg, e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        let result = match timeout(idle_timeout, ws_receiver.next()).await {
            Ok(Some(result)) => result,
            Ok(None) => break,
            Err(_) => {
                info!("Participant {} silent for {:?}, closing", id, idle_timeout);
                break;
            }
        };
        match result {
            Ok(Message::Text(text)) => {
                let text_str: &str = text.as_ref();
                match SignalingParser::parse(text_str) {
                    Ok(msg) => {
                        if let Some(reply) = handle_client_message(&matchmaker, &id, msg) {
                            let _ = tx.send(reply);
                        }
                    }
                    Err(e) => {
                        warn!("Invalid signaling message from {}: {}", id, e);
                        let _ = tx.send(ServerMessage::error(&e.to_string()));
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame from {}", id);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("Participant {} closed the signaling socket", id);
                break;
            }
            Err(e) => {
                error!("WebSocket error for {}: {}", id, e);
                break;
            }
        }
    }

    matchmaker.disconnect(&id);
    send_task.abort();
    debug!("Signaling handler for {} finished", id);
}

/// Apply one participant message; returns a reply for the sender, if any
fn handle_client_message(
    matchmaker: &Matchmaker,
    id: &ParticipantId,
    message: ClientMessage,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::FindMatch => match matchmaker.find_match(id) {
            Ok(()) => None,
            Err(e) => {
                warn!("find_match from {} rejected: {}", id, e);
                Some(ServerMessage::error(&e.to_string()))
            }
        },
        ClientMessage::EndChat => {
            if let Err(e) = matchmaker.end_chat(id) {
                warn!("end_chat from {} rejected: {}", id, e);
            }
            None
        }
        other => {
            if let Ok(signal) = other.into_signal() {
                let kind = signal.kind();
                let outcome = matchmaker.relay(id, signal);
                if !outcome.is_forwarded() {
                    debug!("Dropped {} from {}: {:?}", kind, id, outcome);
                }
            }
            None
        }
    }
}
