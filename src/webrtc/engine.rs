//! Media engine seam
//!
//! The platform real-time engine does capture, encoding, NAT traversal and
//! transport. The lifecycle only drives it through [`PeerSession`] and listens
//! to the [`EngineEvent`]s it reports.

use super::media::LocalMedia;
use super::quality::StatsSample;
use super::session::Internal;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use tokio::sync::mpsc;

/// Link state as reported by the engine, for both the peer connection and ICE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Disconnected or failed; the lifecycle reacts to both the same way
    pub fn is_broken(&self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed)
    }
}

/// Asynchronous reports from one peer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A local connectivity candidate to stream to the partner
    LocalCandidate(String),
    /// Candidate gathering finished
    GatheringComplete,
    /// Peer connection state change
    ConnectionState(LinkState),
    /// ICE transport state change
    IceState(LinkState),
    /// First remote media track arrived
    RemoteTrack,
}

/// Sink handed to [`MediaEngine::open`]; events are tagged with the session
/// they belong to so reports from a closed session are ignored.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<Internal>,
}

impl EngineEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Internal>) -> Self {
        Self { generation, tx }
    }

    /// Report an event; false once the lifecycle has shut down
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx
            .send(Internal::Engine {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Engine-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Peer session could not be created
    Unavailable(String),
    /// Session description rejected or not produced
    Sdp(String),
    /// Candidate rejected
    Ice(String),
    /// Statistics not available
    Stats(String),
    /// Session already closed
    Closed,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Unavailable(msg) => write!(f, "Peer session unavailable: {}", msg),
            EngineError::Sdp(msg) => write!(f, "SDP error: {}", msg),
            EngineError::Ice(msg) => write!(f, "ICE error: {}", msg),
            EngineError::Stats(msg) => write!(f, "Stats error: {}", msg),
            EngineError::Closed => write!(f, "Peer session closed"),
        }
    }
}

impl Error for EngineError {}

/// One peer connection inside the engine
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Produce a local offer; `ice_restart` asks for fresh credentials
    async fn create_offer(&self, ice_restart: bool) -> Result<String, EngineError>;

    async fn create_answer(&self) -> Result<String, EngineError>;

    async fn set_local_description(&self, sdp: &str) -> Result<(), EngineError>;

    async fn set_remote_description(&self, sdp: &str) -> Result<(), EngineError>;

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), EngineError>;

    /// Restart connectivity in place; returns a new offer if one must be sent
    async fn restart_ice(&self) -> Result<Option<String>, EngineError>;

    async fn stats(&self) -> Result<StatsSample, EngineError>;

    async fn close(&self);
}

/// Factory for peer sessions carrying the local media
#[async_trait]
pub trait MediaEngine: Send + Sync {
    type Session: PeerSession + 'static;

    async fn open(&self, media: &LocalMedia, events: EngineEvents) -> Result<Self::Session, EngineError>;
}
