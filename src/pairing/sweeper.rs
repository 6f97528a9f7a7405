//! Periodic cleanup of stale coordinator state
//!
//! Each pass evicts over-age or dead waiting entries, tears down pairs with a
//! dead member or no relayed traffic for too long, forgets handles whose
//! transport closed without a disconnect, then gives the matcher another run.

use super::matcher::PairingState;
use super::Matchmaker;
use crate::webrtc::ServerMessage;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Sent once to a live participant dropped from the queue for waiting too long
pub const WAIT_EXCEEDED_MESSAGE: &str = "match wait time exceeded, please try again";

/// Counts from one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Live entries removed for exceeding the maximum wait
    pub evicted: usize,
    /// Queue entries whose transport had already closed
    pub expired_entries: usize,
    /// Pairs removed because a member is dead or the pair went idle
    pub removed_pairs: usize,
    /// Registry handles dropped without a processed disconnect
    pub dead_handles: usize,
    pub pairs_formed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

impl Matchmaker {
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> SweepReport {
        let max_wait = self.config.max_wait();
        let stale_after = self.config.stale_pair_after();
        let mut report = SweepReport::default();

        let mut guard = self.state.write();
        let PairingState { registry, queue, pairs } = &mut *guard;

        for entry in queue.drain_where(|e| !registry.is_live(&e.id) || e.age(now) > max_wait) {
            if registry.is_live(&entry.id) {
                info!(
                    "Evicting {} after waiting {}s",
                    entry.id,
                    entry.age(now).as_secs()
                );
                registry.send(&entry.id, ServerMessage::error(WAIT_EXCEEDED_MESSAGE));
                report.evicted += 1;
            } else {
                report.expired_entries += 1;
            }
        }

        for pair in pairs.pairs() {
            let [a, b] = pair.members();
            let dead = !registry.is_live(&a) || !registry.is_live(&b);
            let stale = stale_after.map(|limit| pair.idle_time(now) > limit).unwrap_or(false);
            if !dead && !stale {
                continue;
            }
            if stale {
                warn!("Removing pair {} idle for {}s", pair.id, pair.idle_time(now).as_secs());
            } else {
                debug!("Removing pair {} with a departed member", pair.id);
            }
            pairs.unpair(&a);
            for member in [a, b] {
                registry.send(&member, ServerMessage::UserDisconnected);
            }
            report.removed_pairs += 1;
        }

        for id in registry.dead_handles() {
            debug!("Forgetting dead connection {}", id);
            queue.remove(&id);
            registry.unregister(&id);
            report.dead_handles += 1;
        }

        report.pairs_formed = guard.try_match(now).len();
        guard.broadcast_user_count();
        drop(guard);

        self.metrics.record_evictions(report.evicted);
        self.metrics.record_reaped_pairs(report.removed_pairs);
        self.metrics.record_pairs_formed(report.pairs_formed);
        if !report.is_empty() {
            debug!("Sweep: {:?}", report);
        }
        report
    }
}

/// Background task running [`Matchmaker::sweep`] on a fixed period
pub struct Sweeper {
    matchmaker: Arc<Matchmaker>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(matchmaker: Arc<Matchmaker>) -> Self {
        let interval = matchmaker.config().sweep_interval();
        Self { matchmaker, interval }
    }

    pub fn with_interval(matchmaker: Arc<Matchmaker>, interval: Duration) -> Self {
        Self { matchmaker, interval }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!("Sweeper running every {}s", self.interval.as_secs());
        // first pass one period after startup
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.matchmaker.sweep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchingConfig;
    use crate::pairing::PairingMetrics;
    use crate::pairing::matcher::tests::{assert_invariants, drain, join, matchmaker, without_counts};

    #[test]
    fn test_over_age_entry_gets_one_error_and_is_not_matched() {
        let mm = matchmaker();
        let start = Instant::now();
        let (a, mut ra) = join(&mm);
        mm.find_match_at(&a, start).unwrap();
        drain(&mut ra);

        let later = start + mm.config().max_wait() + Duration::from_secs(1);
        let report = mm.sweep_at(later);
        assert_eq!(report.evicted, 1);
        assert!(!mm.is_waiting(&a));
        assert_eq!(
            without_counts(drain(&mut ra)),
            vec![ServerMessage::error(WAIT_EXCEEDED_MESSAGE)]
        );

        // a newcomer is not paired with the evicted participant
        let (b, _rb) = join(&mm);
        mm.find_match_at(&b, later).unwrap();
        assert_eq!(mm.partner_of(&b), None);
        assert_eq!(mm.sweep_at(later).evicted, 0);
        assert!(without_counts(drain(&mut ra)).is_empty());
    }

    #[test]
    fn test_entry_at_exactly_max_wait_survives() {
        let mm = matchmaker();
        let start = Instant::now();
        let (a, mut ra) = join(&mm);
        mm.find_match_at(&a, start).unwrap();
        drain(&mut ra);

        assert!(mm.sweep_at(start + mm.config().max_wait()).is_empty());
        assert!(mm.is_waiting(&a));
        assert!(without_counts(drain(&mut ra)).is_empty());
    }

    #[test]
    fn test_young_entries_survive() {
        let mm = matchmaker();
        let start = Instant::now();
        let (a, _ra) = join(&mm);
        mm.find_match_at(&a, start).unwrap();

        let report = mm.sweep_at(start + Duration::from_secs(10));
        assert!(report.is_empty());
        assert!(mm.is_waiting(&a));
    }

    #[test]
    fn test_dead_handles_and_half_dead_pairs_are_removed() {
        let mm = matchmaker();
        let (a, ra) = join(&mm);
        let (b, mut rb) = join(&mm);
        let (c, rc) = join(&mm);
        mm.find_match(&a).unwrap();
        mm.find_match(&b).unwrap();
        mm.find_match(&c).unwrap();
        drain(&mut rb);
        drop(ra);
        drop(rc);

        let report = mm.sweep();
        assert_eq!(report.removed_pairs, 1);
        assert_eq!(report.expired_entries, 1);
        assert_eq!(report.dead_handles, 2);
        assert_eq!(mm.partner_of(&b), None);
        assert_eq!(
            drain(&mut rb),
            vec![ServerMessage::UserDisconnected, ServerMessage::UserCount { count: 1 }]
        );
        assert_eq!(mm.status().online, 1);
        assert_invariants(&mm);
    }

    #[test]
    fn test_idle_pair_is_reaped() {
        let mm = matchmaker();
        let start = Instant::now();
        let (a, mut ra) = join(&mm);
        let (b, mut rb) = join(&mm);
        mm.find_match_at(&a, start).unwrap();
        mm.find_match_at(&b, start).unwrap();
        drain(&mut ra);
        drain(&mut rb);

        let limit = mm.config().stale_pair_after().unwrap();
        assert_eq!(mm.sweep_at(start + limit / 2).removed_pairs, 0);

        assert_eq!(mm.sweep_at(start + limit).removed_pairs, 0);

        let report = mm.sweep_at(start + limit + Duration::from_secs(1));
        assert_eq!(report.removed_pairs, 1);
        assert_eq!(without_counts(drain(&mut ra)), vec![ServerMessage::UserDisconnected]);
        assert_eq!(without_counts(drain(&mut rb)), vec![ServerMessage::UserDisconnected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_evicts_on_schedule() {
        // paused tokio time does not move std Instant; enqueue in the past instead
        let config = MatchingConfig { max_wait_secs: 1, ..MatchingConfig::default() };
        let mm = Arc::new(Matchmaker::new(config, Arc::new(PairingMetrics::new().unwrap())));
        let (a, mut ra) = join(&mm);
        mm.find_match_at(&a, Instant::now() - Duration::from_secs(5)).unwrap();
        drain(&mut ra);

        let handle = Sweeper::with_interval(mm.clone(), Duration::from_secs(30)).spawn();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!mm.is_waiting(&a));
        assert!(without_counts(drain(&mut ra)).contains(&ServerMessage::error(WAIT_EXCEEDED_MESSAGE)));
        handle.abort();
    }
}
