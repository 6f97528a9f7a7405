//! Matchmaker service
//!
//! Single owner of the registry, the waiting queue and the pair table. Every
//! structural mutation takes the write guard, so the queue/pair invariants hold
//! between any two calls:
//! - an id is in the queue or in the pair table, never both
//! - an id is in the queue at most once
//! - pairs are symmetric and inserted/removed atomically

use super::metrics::PairingMetrics;
use super::pairs::{ActivePair, ActivePairTable, Role};
use super::queue::PairingQueue;
use super::registry::{ConnectionHandle, ConnectionRegistry};
use super::{PairingError, ParticipantId};
use crate::config::MatchingConfig;
use crate::webrtc::ServerMessage;
use log::{debug, info};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Snapshot for the diagnostic endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingStatus {
    pub online: usize,
    pub waiting: usize,
    pub active_pairs: usize,
    pub oldest_wait: Option<Duration>,
}

/// State guarded by the matchmaker lock
#[derive(Debug, Default)]
pub(crate) struct PairingState {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) queue: PairingQueue,
    pub(crate) pairs: ActivePairTable,
}

impl PairingState {
    /// Take `id` out of its pair (telling the partner) and out of the queue.
    ///
    /// Returns the former partner, if there was one.
    pub(crate) fn leave(&mut self, id: &ParticipantId) -> Option<ParticipantId> {
        self.queue.remove(id);
        let partner = self.pairs.unpair(id)?;
        if self.registry.send(&partner, ServerMessage::UserDisconnected) {
            debug!("Notified {} that partner {} left", partner, id);
        }
        Some(partner)
    }

    /// Pair the two oldest live waiting entries until fewer than two remain.
    pub(crate) fn try_match(&mut self, now: Instant) -> Vec<Arc<ActivePair>> {
        let mut formed = Vec::new();
        while self.queue.len() >= 2 {
            let (first, second) = match (self.queue.pop_front(), self.queue.pop_front()) {
                (Some(first), Some(second)) => (first, second),
                (Some(only), None) => {
                    self.queue.push_front(only);
                    break;
                }
                _ => break,
            };

            match (self.registry.is_live(&first.id), self.registry.is_live(&second.id)) {
                (true, true) => {
                    let pair = self.pairs.pair(first.id, second.id, now);
                    self.announce(&pair);
                    formed.push(pair);
                }
                (true, false) => {
                    debug!("Dropping dead waiting entry {}", second.id);
                    self.queue.push_front(first);
                }
                (false, true) => {
                    debug!("Dropping dead waiting entry {}", first.id);
                    self.queue.push_front(second);
                }
                (false, false) => {
                    debug!("Dropping dead waiting entries {} and {}", first.id, second.id);
                }
            }
        }
        formed
    }

    fn announce(&self, pair: &ActivePair) {
        info!(
            "Matched {} (initiator) with {} (receiver), pair {}",
            pair.initiator, pair.receiver, pair.id
        );
        self.registry.send(&pair.initiator, ServerMessage::StartCall);
        self.registry.send(&pair.receiver, ServerMessage::CallStarted);
        self.registry.send(&pair.initiator, ServerMessage::NextUser);
        self.registry.send(&pair.receiver, ServerMessage::NextUser);
    }

    pub(crate) fn broadcast_user_count(&self) {
        let count = self.registry.len();
        self.registry.broadcast(&ServerMessage::UserCount { count });
    }

    pub(crate) fn status(&self, now: Instant) -> PairingStatus {
        PairingStatus {
            online: self.registry.len(),
            waiting: self.queue.len(),
            active_pairs: self.pairs.pair_count(),
            oldest_wait: self.queue.oldest().map(|e| e.age(now)),
        }
    }
}

/// Pairing coordinator shared by all connection handlers and the sweeper
pub struct Matchmaker {
    pub(crate) state: RwLock<PairingState>,
    pub(crate) config: MatchingConfig,
    pub(crate) metrics: Arc<PairingMetrics>,
}

impl Matchmaker {
    pub fn new(config: MatchingConfig, metrics: Arc<PairingMetrics>) -> Self {
        Self {
            state: RwLock::new(PairingState::default()),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PairingMetrics> {
        &self.metrics
    }

    /// Register a new transport connection and announce the new online count
    pub fn connect(&self, tx: mpsc::UnboundedSender<ServerMessage>) -> ParticipantId {
        let id = ParticipantId::new();
        let mut state = self.state.write();
        // fresh v4 ids do not collide
        let _ = state.registry.register(id, ConnectionHandle::new(tx, Instant::now()));
        state.broadcast_user_count();
        info!("Participant {} connected ({} online)", id, state.registry.len());
        id
    }

    /// Drop a transport connection: the partner is told, the queue forgets it,
    /// and anyone left waiting gets another chance to match.
    pub fn disconnect(&self, id: &ParticipantId) {
        let now = Instant::now();
        let mut state = self.state.write();
        state.leave(id);
        if state.registry.unregister(id).is_none() {
            return;
        }
        info!("Participant {} disconnected ({} online)", id, state.registry.len());
        state.broadcast_user_count();
        let formed = state.try_match(now);
        self.metrics.record_pairs_formed(formed.len());
    }

    /// Queue `id` for a partner, leaving any current pair first
    pub fn find_match(&self, id: &ParticipantId) -> Result<(), PairingError> {
        self.find_match_at(id, Instant::now())
    }

    pub(crate) fn find_match_at(&self, id: &ParticipantId, now: Instant) -> Result<(), PairingError> {
        let mut state = self.state.write();
        if !state.registry.is_live(id) {
            return Err(PairingError::UnknownParticipant(*id));
        }
        if let Some(partner) = state.pairs.unpair(id) {
            debug!("{} left pair with {} to find a new match", id, partner);
            state.registry.send(&partner, ServerMessage::UserDisconnected);
        }
        if state.queue.enqueue(*id, now) {
            debug!("{} moved to the back of the queue", id);
        } else {
            debug!("{} is looking for a match (queue: {})", id, state.queue.len());
        }
        let formed = state.try_match(now);
        self.metrics.record_pairs_formed(formed.len());
        Ok(())
    }

    /// Leave the current pair and the queue without disconnecting
    pub fn end_chat(&self, id: &ParticipantId) -> Result<(), PairingError> {
        let mut state = self.state.write();
        if !state.registry.contains(id) {
            return Err(PairingError::UnknownParticipant(*id));
        }
        if let Some(partner) = state.leave(id) {
            info!("{} ended chat with {}", id, partner);
        }
        Ok(())
    }

    /// Run the matcher without any other change
    pub fn run_matcher(&self) -> usize {
        let mut state = self.state.write();
        let formed = state.try_match(Instant::now()).len();
        self.metrics.record_pairs_formed(formed);
        formed
    }

    pub fn partner_of(&self, id: &ParticipantId) -> Option<ParticipantId> {
        self.state.read().pairs.lookup_partner(id)
    }

    pub fn role_of(&self, id: &ParticipantId) -> Option<Role> {
        self.state.read().pairs.get(id).and_then(|pair| pair.role_of(id))
    }

    pub fn is_waiting(&self, id: &ParticipantId) -> bool {
        self.state.read().queue.contains(id)
    }

    pub fn status(&self) -> PairingStatus {
        self.state.read().status(Instant::now())
    }
}
