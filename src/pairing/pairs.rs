//! Active pair table
//!
//! Both members of a pair point at the same record, so the partner relation is
//! symmetric by construction and a pair is inserted or removed as a unit.

use super::{PairId, ParticipantId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Role assigned by the matcher for the lifetime of the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Receiver,
}

/// Two participants in one session
#[derive(Debug)]
pub struct ActivePair {
    pub id: PairId,
    pub initiator: ParticipantId,
    pub receiver: ParticipantId,
    pub formed_at: Instant,
    last_activity: Mutex<Instant>,
}

impl ActivePair {
    pub fn new(initiator: ParticipantId, receiver: ParticipantId, formed_at: Instant) -> Self {
        Self {
            id: PairId::new(),
            initiator,
            receiver,
            formed_at,
            last_activity: Mutex::new(formed_at),
        }
    }

    /// The other member, or None if `id` is not in this pair
    pub fn partner_of(&self, id: &ParticipantId) -> Option<ParticipantId> {
        if *id == self.initiator {
            Some(self.receiver)
        } else if *id == self.receiver {
            Some(self.initiator)
        } else {
            None
        }
    }

    pub fn role_of(&self, id: &ParticipantId) -> Option<Role> {
        if *id == self.initiator {
            Some(Role::Initiator)
        } else if *id == self.receiver {
            Some(Role::Receiver)
        } else {
            None
        }
    }

    pub fn members(&self) -> [ParticipantId; 2] {
        [self.initiator, self.receiver]
    }

    pub fn touch(&self, now: Instant) {
        let mut last = self.last_activity.lock();
        if now > *last {
            *last = now;
        }
    }

    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }
}

#[derive(Debug, Default)]
pub struct ActivePairTable {
    by_member: HashMap<ParticipantId, Arc<ActivePair>>,
}

impl ActivePairTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store both directions of a new pair.
    ///
    /// Callers must unpair either member first; an existing entry is replaced.
    pub fn pair(&mut self, initiator: ParticipantId, receiver: ParticipantId, now: Instant) -> Arc<ActivePair> {
        debug_assert_ne!(initiator, receiver);
        let record = Arc::new(ActivePair::new(initiator, receiver, now));
        self.by_member.insert(initiator, record.clone());
        self.by_member.insert(receiver, record.clone());
        record
    }

    pub fn lookup_partner(&self, id: &ParticipantId) -> Option<ParticipantId> {
        self.by_member.get(id).and_then(|pair| pair.partner_of(id))
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Arc<ActivePair>> {
        self.by_member.get(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.by_member.contains_key(id)
    }

    /// Remove the whole pair containing `id`; returns the partner to notify
    pub fn unpair(&mut self, id: &ParticipantId) -> Option<ParticipantId> {
        let record = self.by_member.remove(id)?;
        let partner = record.partner_of(id)?;
        self.by_member.remove(&partner);
        Some(partner)
    }

    /// Each pair exactly once
    pub fn pairs(&self) -> Vec<Arc<ActivePair>> {
        self.by_member
            .iter()
            .filter(|(id, pair)| **id == pair.initiator)
            .map(|(_, pair)| pair.clone())
            .collect()
    }

    pub fn pair_count(&self) -> usize {
        self.by_member.len() / 2
    }

    pub fn member_count(&self) -> usize {
        self.by_member.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_member.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_is_symmetric() {
        let mut table = ActivePairTable::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        table.pair(a, b, Instant::now());

        assert_eq!(table.lookup_partner(&a), Some(b));
        assert_eq!(table.lookup_partner(&b), Some(a));
        assert_eq!(table.get(&a).unwrap().id, table.get(&b).unwrap().id);
        assert_eq!(table.pair_count(), 1);
    }

    #[test]
    fn test_unpair_from_either_side_removes_both() {
        let mut table = ActivePairTable::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        table.pair(a, b, Instant::now());

        assert_eq!(table.unpair(&b), Some(a));
        assert!(!table.contains(&a));
        assert!(!table.contains(&b));
        assert_eq!(table.unpair(&a), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_roles_and_idle_time() {
        let now = Instant::now();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let pair = ActivePair::new(a, b, now);
        assert_eq!(pair.role_of(&a), Some(Role::Initiator));
        assert_eq!(pair.role_of(&b), Some(Role::Receiver));
        assert_eq!(pair.role_of(&ParticipantId::new()), None);

        pair.touch(now + Duration::from_secs(10));
        assert_eq!(pair.idle_time(now + Duration::from_secs(15)), Duration::from_secs(5));
        // out-of-order touches never move activity backwards
        pair.touch(now + Duration::from_secs(1));
        assert_eq!(pair.idle_time(now + Duration::from_secs(15)), Duration::from_secs(5));
    }

    #[test]
    fn test_pairs_lists_each_once() {
        let mut table = ActivePairTable::new();
        let now = Instant::now();
        for _ in 0..3 {
            table.pair(ParticipantId::new(), ParticipantId::new(), now);
        }
        assert_eq!(table.pairs().len(), 3);
        assert_eq!(table.member_count(), 6);
    }
}
