//! Link quality sampling and classification

use std::fmt;

/// Cumulative inbound RTP counters for one media kind
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InboundCounters {
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
}

impl InboundCounters {
    /// Percentage of packets lost out of all packets expected
    pub fn loss_pct(&self) -> f64 {
        loss_ratio(self.packets_lost, self.packets_received)
    }
}

/// Raw statistics snapshot pulled from the engine
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSample {
    /// Engine timestamp in milliseconds
    pub timestamp_ms: f64,
    pub video: Option<InboundCounters>,
    pub audio: Option<InboundCounters>,
    /// Round-trip time of the selected candidate pair
    pub rtt_ms: Option<f64>,
}

/// Derived link metrics for one sampling period
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    pub video_bitrate_kbps: f64,
    pub video_loss_pct: f64,
    pub audio_loss_pct: f64,
    pub rtt_ms: f64,
}

/// `lost / (lost + received) * 100`, zero before anything arrived
pub fn loss_ratio(lost: u64, received: u64) -> f64 {
    if received == 0 {
        return 0.0;
    }
    lost as f64 / (lost + received) as f64 * 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityTier {
    None,
    Poor,
    Medium,
    Good,
    Excellent,
}

impl QualityTier {
    /// Highest tier whose thresholds are all met. Loss is the video loss ratio.
    pub fn classify(stats: &TransportStats) -> Self {
        let bitrate = stats.video_bitrate_kbps;
        let loss = stats.video_loss_pct;
        let rtt = stats.rtt_ms;

        if bitrate > 500.0 && loss < 2.0 && rtt < 200.0 {
            QualityTier::Excellent
        } else if bitrate > 300.0 && loss < 5.0 && rtt < 300.0 {
            QualityTier::Good
        } else if bitrate > 100.0 && loss < 10.0 && rtt < 500.0 {
            QualityTier::Medium
        } else if bitrate > 50.0 {
            QualityTier::Poor
        } else {
            QualityTier::None
        }
    }

    /// Number of bars lit in a four-bar indicator
    pub fn bars(&self) -> u8 {
        match self {
            QualityTier::None => 0,
            QualityTier::Poor => 1,
            QualityTier::Medium => 2,
            QualityTier::Good => 3,
            QualityTier::Excellent => 4,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityTier::None => "none",
            QualityTier::Poor => "poor",
            QualityTier::Medium => "medium",
            QualityTier::Good => "good",
            QualityTier::Excellent => "excellent",
        };
        f.write_str(name)
    }
}

/// Turns successive cumulative samples into per-period metrics
#[derive(Debug, Default)]
pub struct QualityMonitor {
    previous: Option<StatsSample>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitrate comes from the byte delta since the previous sample; the first
    /// sample after connecting has no baseline and reports zero.
    pub fn observe(&mut self, sample: StatsSample) -> TransportStats {
        let video = sample.video.unwrap_or_default();
        let audio = sample.audio.unwrap_or_default();

        let video_bitrate_kbps = match self.previous {
            Some(prev) if sample.timestamp_ms > prev.timestamp_ms => {
                let prev_bytes = prev.video.map(|v| v.bytes_received).unwrap_or(0);
                let bits = video.bytes_received.saturating_sub(prev_bytes) as f64 * 8.0;
                // bits per millisecond is kilobits per second
                bits / (sample.timestamp_ms - prev.timestamp_ms)
            }
            _ => 0.0,
        };

        self.previous = Some(sample);
        TransportStats {
            video_bitrate_kbps,
            video_loss_pct: video.loss_pct(),
            audio_loss_pct: audio.loss_pct(),
            rtt_ms: sample.rtt_ms.unwrap_or(0.0),
        }
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}
