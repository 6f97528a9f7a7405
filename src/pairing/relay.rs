//! Signaling relay
//!
//! Forwards offer/answer/candidate payloads from a participant to its current
//! partner and nobody else. The partner is resolved from the pair table on every
//! message; a sender without a pair gets its message dropped silently.

use super::{Matchmaker, ParticipantId};
use crate::webrtc::{ServerMessage, Signal};
use log::debug;
use std::time::Instant;

/// What happened to one relayed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Delivered to the partner's transport
    Forwarded { to: ParticipantId },
    /// Sender is not paired (not yet, or no longer)
    NoPartner,
    /// Partner's transport has already closed
    PartnerGone { partner: ParticipantId },
}

impl RelayOutcome {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, RelayOutcome::Forwarded { .. })
    }
}

impl Matchmaker {
    /// Forward `signal` from `from` to its partner, verbatim
    pub fn relay(&self, from: &ParticipantId, signal: Signal) -> RelayOutcome {
        self.relay_at(from, signal, Instant::now())
    }

    pub(crate) fn relay_at(&self, from: &ParticipantId, signal: Signal, now: Instant) -> RelayOutcome {
        let kind = signal.kind();
        // read guard only: a concurrent unpair either completes first (drop) or after (forward)
        let state = self.state.read();

        let partner = match state.pairs.get(from).and_then(|pair| {
            pair.touch(now);
            pair.partner_of(from)
        }) {
            Some(partner) => partner,
            None => {
                debug!("Dropping {} from unpaired participant {}", kind, from);
                self.metrics.record_dropped(kind);
                return RelayOutcome::NoPartner;
            }
        };

        let size = signal.len();
        if state.registry.send(&partner, ServerMessage::signal(signal)) {
            debug!("Relayed {} ({} bytes) {} -> {}", kind, size, from, partner);
            self.metrics.record_relayed(kind);
            RelayOutcome::Forwarded { to: partner }
        } else {
            debug!("Dropping {} for departed partner {}", kind, partner);
            self.metrics.record_dropped(kind);
            RelayOutcome::PartnerGone { partner }
        }
    }
}
