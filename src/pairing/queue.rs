//! FIFO waiting list of unmatched participants

use super::ParticipantId;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A participant waiting to be matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitingEntry {
    pub id: ParticipantId,
    pub enqueued_at: Instant,
}

impl WaitingEntry {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

/// Waiting queue, oldest entry at the front.
///
/// An id appears at most once.
#[derive(Debug, Default)]
pub struct PairingQueue {
    entries: VecDeque<WaitingEntry>,
}

impl PairingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` at the tail, dropping any earlier occurrence first.
    ///
    /// Returns true if the id was already waiting (it moved to the back).
    pub fn enqueue(&mut self, id: ParticipantId, now: Instant) -> bool {
        let moved = self.remove(&id).is_some();
        self.entries.push_back(WaitingEntry { id, enqueued_at: now });
        moved
    }

    pub fn pop_front(&mut self) -> Option<WaitingEntry> {
        self.entries.pop_front()
    }

    /// Put an entry back at the head, keeping its original timestamp
    pub fn push_front(&mut self, entry: WaitingEntry) {
        self.remove(&entry.id);
        self.entries.push_front(entry);
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<WaitingEntry> {
        let index = self.entries.iter().position(|e| e.id == *id)?;
        self.entries.remove(index)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.entries.iter().any(|e| e.id == *id)
    }

    /// Remove every entry matching `evict`, returning them in queue order
    pub fn drain_where<F>(&mut self, mut evict: F) -> Vec<WaitingEntry>
    where
        F: FnMut(&WaitingEntry) -> bool,
    {
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            if evict(entry) {
                removed.push(*entry);
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn oldest(&self) -> Option<&WaitingEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WaitingEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
