//! Shared state for strangers-core
//!
//! Handed to every HTTP handler and signaling connection.

use crate::config::Config;
use crate::pairing::{Matchmaker, PairingStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state for the application
#[derive(Clone)]
pub struct SharedState {
    /// Configuration
    pub config: Arc<Config>,

    /// Pairing coordinator
    pub matchmaker: Arc<Matchmaker>,

    /// Server start time
    pub start_time: Instant,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("config", &self.config)
            .field("online", &self.connection_count())
            .finish()
    }
}

impl SharedState {
    pub fn new(config: Config, matchmaker: Arc<Matchmaker>) -> Self {
        Self {
            config: Arc::new(config),
            matchmaker,
            start_time: Instant::now(),
        }
    }

    /// Get server uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Registered signaling connections
    pub fn connection_count(&self) -> usize {
        self.matchmaker.status().online
    }

    /// Coordinator snapshot, also pushed into the metric gauges
    pub fn observe(&self) -> PairingStatus {
        let status = self.matchmaker.status();
        self.matchmaker.metrics().observe(&status);
        status
    }
}
