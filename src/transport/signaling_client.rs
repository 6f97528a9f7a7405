//! Participant-side signaling connection
//!
//! Connects to the coordinator, encodes outbound [`ClientMessage`]s and decodes
//! inbound [`ServerMessage`]s on two background tasks. [`SignalingClient::run`]
//! keeps a lifecycle attached across brief drops by reconnecting.

use crate::config::ClientConfig;
use crate::webrtc::session::{LifecycleEvent, LifecycleHandle};
use crate::webrtc::signaling::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Signaling client errors
#[derive(Debug)]
pub enum SignalingClientError {
    /// WebSocket handshake failed
    Connect(String),
    /// Message could not be encoded
    Encode(String),
    /// Connection already closed
    Closed,
    /// Every reconnect attempt failed
    ReconnectFailed(u32),
}

impl fmt::Display for SignalingClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingClientError::Connect(msg) => write!(f, "Signaling connect failed: {}", msg),
            SignalingClientError::Encode(msg) => write!(f, "Signaling encode failed: {}", msg),
            SignalingClientError::Closed => write!(f, "Signaling connection closed"),
            SignalingClientError::ReconnectFailed(attempts) => {
                write!(f, "Signaling reconnect gave up after {} attempts", attempts)
            }
        }
    }
}

impl Error for SignalingClientError {}

/// How hard to try before giving up on the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ReconnectPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            attempts: config.reconnect_attempts,
            delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }
}

/// One WebSocket connection to the coordinator
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self, SignalingClientError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SignalingClientError::Connect(e.to_string()))?;
        info!("Signaling connected to {}", url);
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerMessage>();

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Undecodable coordinator message: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Signaling socket error: {}", e);
                        break;
                    }
                }
            }
            debug!("Signaling reader finished");
        });

        Ok(Self {
            outbound,
            inbound,
            tasks: vec![writer, reader],
        })
    }

    pub fn send(&self, message: &ClientMessage) -> Result<(), SignalingClientError> {
        let text = message
            .to_json()
            .map_err(|e| SignalingClientError::Encode(e.to_string()))?;
        self.outbound.send(text).map_err(|_| SignalingClientError::Closed)
    }

    /// Next coordinator message; `None` once the socket is gone
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    /// Pump messages between this connection and a lifecycle until either side
    /// stops. A lost socket is reported as [`LifecycleEvent::TransportLost`].
    ///
    /// Returns the lifecycle's outbound queue when the socket was lost, so it
    /// can be attached to the next connection, and `None` once the lifecycle
    /// has stopped.
    pub async fn attach(
        mut self,
        handle: LifecycleHandle,
        mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    ) -> Option<mpsc::UnboundedReceiver<ClientMessage>> {
        loop {
            tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(message) => {
                        if handle.deliver(message).is_err() {
                            return None;
                        }
                    }
                    None => {
                        warn!("Signaling connection lost");
                        if handle.send(LifecycleEvent::TransportLost).is_err() {
                            return None;
                        }
                        return Some(outbound);
                    }
                },
                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.send(&message) {
                            warn!("Dropping {:?}: {}", message, e);
                        }
                    }
                    None => return None,
                },
            }
        }
    }

    /// Connect to `url` and keep `handle`'s lifecycle attached until it stops.
    ///
    /// After a drop, reconnects up to `policy.attempts` times and reports
    /// [`LifecycleEvent::TransportRestored`] on success. Messages queued while
    /// disconnected belonged to the dead session and are discarded.
    pub async fn run(
        url: &str,
        handle: LifecycleHandle,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        policy: ReconnectPolicy,
    ) -> Result<(), SignalingClientError> {
        let mut client = Self::connect(url).await?;
        let mut outbound = outbound;
        loop {
            outbound = match client.attach(handle.clone(), outbound).await {
                Some(outbound) => outbound,
                None => {
                    debug!("Lifecycle stopped, leaving signaling");
                    return Ok(());
                }
            };
            client = Self::reconnect(url, policy).await?;

            let mut stale = 0;
            while outbound.try_recv().is_ok() {
                stale += 1;
            }
            if stale > 0 {
                debug!("Discarded {} messages queued while disconnected", stale);
            }
            if handle.send(LifecycleEvent::TransportRestored).is_err() {
                return Ok(());
            }
        }
    }

    async fn reconnect(url: &str, policy: ReconnectPolicy) -> Result<Self, SignalingClientError> {
        for attempt in 1..=policy.attempts {
            tokio::time::sleep(policy.delay).await;
            info!("Reconnecting ({}/{})", attempt, policy.attempts);
            match Self::connect(url).await {
                Ok(client) => return Ok(client),
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
        Err(SignalingClientError::ReconnectFailed(policy.attempts))
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_reconnect_policy_from_config() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = SignalingClient::connect(&format!("ws://{}/signaling", addr))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SignalingClientError::Connect(_)));
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_policy_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let policy = ReconnectPolicy { attempts: 2, delay: Duration::from_millis(10) };
        let err = SignalingClient::reconnect(&format!("ws://{}/signaling", addr), policy)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SignalingClientError::ReconnectFailed(2)));
    }
}
