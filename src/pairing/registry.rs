//! Connection handle registry
//!
//! Maps each live transport connection to the channel feeding its socket writer.

use super::{PairingError, ParticipantId};
use crate::webrtc::ServerMessage;
use log::debug;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;

/// Outbound half of one participant's transport
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
    connected_at: Instant,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>, connected_at: Instant) -> Self {
        Self { tx, connected_at }
    }

    /// The socket writer is still draining this channel
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a message for the participant; false if the transport is gone
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }
}

/// Registry of connected participants; sole owner of connection handles
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    handles: HashMap<ParticipantId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ParticipantId, handle: ConnectionHandle) -> Result<(), PairingError> {
        if self.handles.contains_key(&id) {
            return Err(PairingError::AlreadyRegistered(id));
        }
        self.handles.insert(id, handle);
        debug!("Registered participant {} ({} online)", id, self.handles.len());
        Ok(())
    }

    pub fn unregister(&mut self, id: &ParticipantId) -> Option<ConnectionHandle> {
        self.handles.remove(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.handles.contains_key(id)
    }

    /// Registered and its transport still open
    pub fn is_live(&self, id: &ParticipantId) -> bool {
        self.handles.get(id).map(|h| h.is_live()).unwrap_or(false)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&ConnectionHandle> {
        self.handles.get(id)
    }

    /// Deliver to a live participant; dead or unknown ids are skipped
    pub fn send(&self, id: &ParticipantId, message: ServerMessage) -> bool {
        match self.handles.get(id) {
            Some(handle) => handle.send(message),
            None => false,
        }
    }

    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        self.handles
            .values()
            .filter(|h| h.send(message.clone()))
            .count()
    }

    /// Handles whose transport closed without a disconnect being processed
    pub fn dead_handles(&self) -> Vec<ParticipantId> {
        self.handles
            .iter()
            .filter(|(_, h)| !h.is_live())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
