//! Participant-side session logic
//!
//! This module provides:
//! - Signaling message types shared with the coordinator
//! - The media engine seam (peer sessions, engine events)
//! - Local media acquisition with its fallback ladder
//! - Link quality classification
//! - The connection lifecycle driver

pub mod signaling;
pub mod engine;
pub mod media;
pub mod quality;
pub mod session;

pub use signaling::{ClientMessage, ServerMessage, Signal, SignalingParser};
pub use engine::{EngineError, EngineEvent, LinkState, MediaEngine, PeerSession};
pub use media::{DeviceClass, LocalMedia, MediaConstraints, MediaDevices, MediaError, MediaErrorKind};
pub use quality::{QualityTier, TransportStats};
pub use session::{Lifecycle, LifecycleEvent, LifecycleHandle, LifecycleNotice, LifecycleState};

use std::error::Error;
use std::fmt;

/// Session-related errors
#[derive(Debug)]
pub enum SessionError {
    /// Malformed or unserializable signaling message
    Signaling(String),
    /// Handshake step out of order or missing local state
    Negotiation(String),
    /// Media engine operation failed
    Engine(EngineError),
    /// Local media could not be acquired
    Media(MediaError),
    /// Operation not valid in the current state
    InvalidState(String),
    /// Signaling transport is gone
    TransportClosed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Signaling(msg) => write!(f, "Signaling error: {}", msg),
            SessionError::Negotiation(msg) => write!(f, "Negotiation error: {}", msg),
            SessionError::Engine(e) => write!(f, "Engine error: {}", e),
            SessionError::Media(e) => write!(f, "Media error: {}", e),
            SessionError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            SessionError::TransportClosed => write!(f, "Signaling transport closed"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SessionError::Engine(e) => Some(e),
            SessionError::Media(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        SessionError::Engine(e)
    }
}

impl From<MediaError> for SessionError {
    fn from(e: MediaError) -> Self {
        SessionError::Media(e)
    }
}
