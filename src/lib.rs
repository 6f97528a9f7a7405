//! strangers-core - random one-to-one video chat
//!
//! A pairing coordinator with a WebSocket signaling relay, and the
//! participant-side session lifecycle that drives a media engine through it.

pub mod args;
pub mod config;
pub mod pairing;
pub mod transport;
pub mod web;
pub mod webrtc;

// Re-exports
pub use config::Config;
pub use pairing::{Matchmaker, PairingMetrics, ParticipantId, Sweeper};
pub use transport::SignalingClient;
pub use webrtc::{Lifecycle, LifecycleEvent, LifecycleHandle, LifecycleNotice, LifecycleState};
