//! Signaling Protocol
//!
//! JSON messages exchanged between participants and the coordinator over the
//! signaling WebSocket. Session descriptions and connectivity candidates travel
//! as opaque strings: nothing on the coordinator side ever looks inside them.

use super::SessionError;
use serde::{Deserialize, Serialize};

/// One of the three relayable handshake messages.
///
/// The payload is carried verbatim; the relay moves it between partners without
/// parsing or rewriting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Session offer (initiator → receiver)
    Offer(String),
    /// Session answer (receiver → initiator)
    Answer(String),
    /// Connectivity candidate (either direction)
    Candidate(String),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::Candidate(_) => "candidate",
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            Signal::Offer(p) | Signal::Answer(p) | Signal::Candidate(p) => p,
        }
    }

    pub fn len(&self) -> usize {
        self.payload().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }
}

/// Messages sent by a participant to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the waiting queue (or move to its tail)
    FindMatch,

    /// Session offer for the current partner
    Offer { payload: String },

    /// Session answer for the current partner
    Answer { payload: String },

    /// Connectivity candidate for the current partner
    #[serde(alias = "ice_candidate")]
    Candidate { payload: String },

    /// Leave the current pair and the queue
    EndChat,
}

impl ClientMessage {
    /// Parse a client message from JSON
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        serde_json::from_str(json)
            .map_err(|e| SessionError::Signaling(format!("Invalid client message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self)
            .map_err(|e| SessionError::Signaling(format!("Failed to serialize message: {}", e)))
    }

    /// Wrap a handshake message for the coordinator
    pub fn signal(signal: Signal) -> Self {
        match signal {
            Signal::Offer(payload) => ClientMessage::Offer { payload },
            Signal::Answer(payload) => ClientMessage::Answer { payload },
            Signal::Candidate(payload) => ClientMessage::Candidate { payload },
        }
    }

    /// Split off the relayable part, if this is a handshake message
    pub fn into_signal(self) -> Result<Signal, ClientMessage> {
        match self {
            ClientMessage::Offer { payload } => Ok(Signal::Offer(payload)),
            ClientMessage::Answer { payload } => Ok(Signal::Answer(payload)),
            ClientMessage::Candidate { payload } => Ok(Signal::Candidate(payload)),
            other => Err(other),
        }
    }
}

/// Messages sent by the coordinator to a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Number of participants currently online
    UserCount { count: usize },

    /// Paired, and this participant drives the offer
    StartCall,

    /// Paired, and this participant answers
    CallStarted,

    /// Informational: a new partner was found
    NextUser,

    /// Relayed session offer
    Offer { payload: String },

    /// Relayed session answer
    Answer { payload: String },

    /// Relayed connectivity candidate
    Candidate { payload: String },

    /// The partner left the pair
    UserDisconnected,

    /// Error message
    Error { message: String },
}

impl ServerMessage {
    /// Parse a server message from JSON
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        serde_json::from_str(json)
            .map_err(|e| SessionError::Signaling(format!("Invalid server message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self)
            .map_err(|e| SessionError::Signaling(format!("Failed to serialize message: {}", e)))
    }

    /// Create an error message
    pub fn error(message: &str) -> Self {
        ServerMessage::Error {
            message: message.to_string(),
        }
    }

    /// Forward a relayed handshake message
    pub fn signal(signal: Signal) -> Self {
        match signal {
            Signal::Offer(payload) => ServerMessage::Offer { payload },
            Signal::Answer(payload) => ServerMessage::Answer { payload },
            Signal::Candidate(payload) => ServerMessage::Candidate { payload },
        }
    }

    /// Split off the relayed handshake message, if any
    pub fn into_signal(self) -> Result<Signal, ServerMessage> {
        match self {
            ServerMessage::Offer { payload } => Ok(Signal::Offer(payload)),
            ServerMessage::Answer { payload } => Ok(Signal::Answer(payload)),
            ServerMessage::Candidate { payload } => Ok(Signal::Candidate(payload)),
            other => Err(other),
        }
    }
}

/// Signaling message parser for WebSocket text frames
pub struct SignalingParser;

impl SignalingParser {
    /// Parse a text frame received by the coordinator
    pub fn parse(text: &str) -> Result<ClientMessage, SessionError> {
        let text = text.trim();
        if !text.starts_with('{') {
            let preview: String = text.chars().take(50).collect();
            return Err(SessionError::Signaling(format!("Unknown message format: {}", preview)));
        }
        ClientMessage::from_json(text)
    }

    /// Format a message for the participant
    pub fn format(message: &ServerMessage) -> Result<String, SessionError> {
        message.to_json()
    }
}
