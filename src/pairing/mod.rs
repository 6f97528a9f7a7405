//! Pairing coordinator
//!
//! Owns the connection registry, the waiting queue and the active pair table,
//! and relays handshake messages between paired participants.
//! - Matching is strict FIFO on arrival order, gated only by liveness
//! - Every structural change happens under a single write lock
//! - Relay lookups take the read lock only and fail closed

pub mod registry;
pub mod queue;
pub mod pairs;
pub mod matcher;
pub mod relay;
pub mod sweeper;
pub mod metrics;

pub use matcher::{Matchmaker, PairingStatus};
pub use metrics::PairingMetrics;
pub use pairs::Role;
pub use relay::RelayOutcome;
pub use sweeper::{Sweeper, SweepReport};

use std::error::Error;
use std::fmt;
use uuid::Uuid;

/// Ephemeral handle of one live transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one active pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairId(Uuid);

impl PairId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PairId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pairing-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// The participant is not (or no longer) registered
    UnknownParticipant(ParticipantId),
    /// The participant is registered twice
    AlreadyRegistered(ParticipantId),
}

impl fmt::Display for PairingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingError::UnknownParticipant(id) => write!(f, "Unknown participant: {}", id),
            PairingError::AlreadyRegistered(id) => write!(f, "Participant already registered: {}", id),
        }
    }
}

impl Error for PairingError {}
