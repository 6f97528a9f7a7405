//! Prometheus metrics for the pairing coordinator

use super::PairingStatus;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct PairingMetrics {
    registry: Registry,
    online: IntGauge,
    waiting: IntGauge,
    active_pairs: IntGauge,
    oldest_wait_seconds: IntGauge,
    pairs_formed: IntCounter,
    signals_relayed: IntCounterVec,
    signals_dropped: IntCounterVec,
    queue_evictions: IntCounter,
    stale_pairs_reaped: IntCounter,
}

impl PairingMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("strangers".to_string()), None)?;

        let online = IntGauge::new("online_participants", "Participants with an open signaling connection")?;
        let waiting = IntGauge::new("waiting_participants", "Participants in the pairing queue")?;
        let active_pairs = IntGauge::new("active_pairs", "Pairs currently formed")?;
        let oldest_wait_seconds = IntGauge::new("oldest_wait_seconds", "Age of the oldest queue entry")?;
        let pairs_formed = IntCounter::new("pairs_formed_total", "Pairs formed by the matcher")?;
        let signals_relayed = IntCounterVec::new(
            Opts::new("signals_relayed_total", "Handshake messages forwarded to a partner"),
            &["kind"],
        )?;
        let signals_dropped = IntCounterVec::new(
            Opts::new("signals_dropped_total", "Handshake messages dropped for lack of a partner"),
            &["kind"],
        )?;
        let queue_evictions = IntCounter::new("queue_evictions_total", "Waiting entries evicted by the sweeper")?;
        let stale_pairs_reaped = IntCounter::new("stale_pairs_reaped_total", "Pairs removed by the sweeper")?;

        registry.register(Box::new(online.clone()))?;
        registry.register(Box::new(waiting.clone()))?;
        registry.register(Box::new(active_pairs.clone()))?;
        registry.register(Box::new(oldest_wait_seconds.clone()))?;
        registry.register(Box::new(pairs_formed.clone()))?;
        registry.register(Box::new(signals_relayed.clone()))?;
        registry.register(Box::new(signals_dropped.clone()))?;
        registry.register(Box::new(queue_evictions.clone()))?;
        registry.register(Box::new(stale_pairs_reaped.clone()))?;

        Ok(Self {
            registry,
            online,
            waiting,
            active_pairs,
            oldest_wait_seconds,
            pairs_formed,
            signals_relayed,
            signals_dropped,
            queue_evictions,
            stale_pairs_reaped,
        })
    }

    pub fn record_pairs_formed(&self, count: usize) {
        self.pairs_formed.inc_by(count as u64);
    }

    pub fn record_relayed(&self, kind: &str) {
        self.signals_relayed.with_label_values(&[kind]).inc();
    }

    pub fn record_dropped(&self, kind: &str) {
        self.signals_dropped.with_label_values(&[kind]).inc();
    }

    pub fn record_evictions(&self, count: usize) {
        self.queue_evictions.inc_by(count as u64);
    }

    pub fn record_reaped_pairs(&self, count: usize) {
        self.stale_pairs_reaped.inc_by(count as u64);
    }

    pub fn pairs_formed(&self) -> u64 {
        self.pairs_formed.get()
    }

    pub fn relayed(&self, kind: &str) -> u64 {
        self.signals_relayed.with_label_values(&[kind]).get()
    }

    pub fn dropped(&self, kind: &str) -> u64 {
        self.signals_dropped.with_label_values(&[kind]).get()
    }

    /// Gauges are refreshed from a status snapshot at scrape time
    pub fn observe(&self, status: &PairingStatus) {
        self.online.set(status.online as i64);
        self.waiting.set(status.waiting as i64);
        self.active_pairs.set(status.active_pairs as i64);
        self.oldest_wait_seconds
            .set(status.oldest_wait.map(|d| d.as_secs() as i64).unwrap_or(0));
    }

    /// Prometheus text exposition
    pub fn render(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_render_contains_counters_and_gauges() {
        let metrics = PairingMetrics::new().unwrap();
        metrics.record_pairs_formed(2);
        metrics.record_relayed("offer");
        metrics.record_dropped("candidate");
        metrics.observe(&PairingStatus {
            online: 5,
            waiting: 1,
            active_pairs: 2,
            oldest_wait: Some(Duration::from_secs(7)),
        });

        let text = metrics.render().unwrap();
        assert!(text.contains("strangers_pairs_formed_total 2"));
        assert!(text.contains("strangers_online_participants 5"));
        assert!(text.contains("strangers_oldest_wait_seconds 7"));
        assert!(text.contains(r#"strangers_signals_relayed_total{kind="offer"} 1"#));
        assert!(text.contains(r#"strangers_signals_dropped_total{kind="candidate"} 1"#));
    }
}
