//! Connection Lifecycle
//!
//! One driver task per participant. Every input (user action, coordinator
//! message, engine report, timer) is a discrete event applied to the current
//! state; inputs that no longer fit the state are dropped.
//!
//! States: Idle → AcquiringMedia → Waiting → Negotiating → Connected → Ended,
//! with Failed reachable from Waiting, Negotiating and Connected.
//! - The establishment timer spans Waiting and Negotiating
//! - The ICE gathering timer lives only while negotiating as initiator
//! - Quality sampling, the video upgrade and the restart deadline run only
//!   while Connected
//! - The rematch timer runs only between a lost partner and the next request

use super::engine::{EngineEvent, EngineEvents, LinkState, MediaEngine, PeerSession};
use super::media::{
    acquire_with_fallback, DeviceClass, LocalMedia, MediaConstraints, MediaDevices, MediaError, MediaKind,
    RetryPolicy, VideoConstraints,
};
use super::quality::{QualityMonitor, QualityTier, TransportStats};
use super::signaling::{ClientMessage, ServerMessage};
use super::SessionError;
use crate::config::ClientConfig;
use crate::pairing::Role;
use log::{debug, info, warn};
use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, Sleep};

/// Consecutive abandoned negotiations before requiring an explicit retry
const MAX_NEGOTIATION_FAILURES: u32 = 3;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No media, no pairing
    Idle,
    /// Running the media fallback ladder
    AcquiringMedia,
    /// Match requested, or partner lost and a new request pending
    Waiting,
    /// Paired; exchanging session descriptions
    Negotiating,
    /// Media flowing between the partners
    Connected,
    /// Session lost; see the last notices for why
    Failed,
    /// Ended explicitly by the user
    Ended,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::AcquiringMedia => "acquiring-media",
            LifecycleState::Waiting => "waiting",
            LifecycleState::Negotiating => "negotiating",
            LifecycleState::Connected => "connected",
            LifecycleState::Failed => "failed",
            LifecycleState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Timer durations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimings {
    pub establishment: Duration,
    pub ice_gathering: Duration,
    pub restart: Duration,
    pub quality_interval: Duration,
    pub video_upgrade: Duration,
    pub rematch_delay: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for LifecycleTimings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            establishment: Duration::from_secs(config.establishment_timeout_secs),
            ice_gathering: Duration::from_secs(config.ice_gathering_timeout_secs),
            restart: Duration::from_secs(config.restart_timeout_secs),
            quality_interval: Duration::from_millis(config.quality_interval_ms),
            video_upgrade: Duration::from_millis(config.video_upgrade_delay_ms),
            rematch_delay: Duration::from_millis(config.rematch_delay_ms),
        }
    }
}

/// Inputs from the user and the signaling transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Next,
    End,
    Retry,
    ToggleAudio,
    ToggleVideo,
    /// Page hidden or app backgrounded
    Suspend,
    Resume,
    /// Message from the coordinator
    Server(ServerMessage),
    TransportLost,
    TransportRestored,
}

/// Outputs for the embedding UI
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleNotice {
    State(LifecycleState),
    Status(String),
    Error(String),
    Quality { tier: QualityTier, stats: TransportStats },
    UserCount(usize),
    Controls { audio_muted: bool, video_off: bool },
    RemoteMedia,
}

/// Events produced on the driver's behalf by spawned work and the engine
#[derive(Debug)]
pub(crate) enum Internal {
    Engine { generation: u64, event: EngineEvent },
    MediaAcquired { attempt: u64, result: Result<LocalMedia, MediaError> },
}

/// Sender side of a running lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleHandle {
    pub fn send(&self, event: LifecycleEvent) -> Result<(), SessionError> {
        self.tx
            .send(event)
            .map_err(|_| SessionError::InvalidState("lifecycle driver stopped".to_string()))
    }

    pub fn deliver(&self, message: ServerMessage) -> Result<(), SessionError> {
        self.send(LifecycleEvent::Server(message))
    }
}

/// Negotiation state for the current partner
struct Peer<S> {
    session: S,
    role: Role,
    generation: u64,
    local_offer: Option<String>,
    offer_sent: bool,
    remote_set: bool,
    /// Remote candidates received before the remote description
    pending_candidates: Vec<String>,
    restart_attempted: bool,
    awaiting_restart_answer: bool,
    ice_state: LinkState,
}

impl<S: PeerSession> Peer<S> {
    fn new(session: S, role: Role, generation: u64) -> Self {
        Self {
            session,
            role,
            generation,
            local_offer: None,
            offer_sent: false,
            remote_set: false,
            pending_candidates: Vec::new(),
            restart_attempted: false,
            awaiting_restart_answer: false,
            ice_state: LinkState::New,
        }
    }

    async fn apply_remote_description(&mut self, sdp: &str) -> Result<(), SessionError> {
        self.session.set_remote_description(sdp).await?;
        self.remote_set = true;
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.session.add_remote_candidate(&candidate).await {
                warn!("Buffered candidate rejected: {}", e);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Timers {
    establishment: Option<Pin<Box<Sleep>>>,
    ice_gathering: Option<Pin<Box<Sleep>>>,
    restart: Option<Pin<Box<Sleep>>>,
    video_upgrade: Option<Pin<Box<Sleep>>>,
    rematch: Option<Pin<Box<Sleep>>>,
    quality: Option<Interval>,
}

impl Timers {
    fn clear(&mut self) {
        *self = Timers::default();
    }
}

async fn expire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

fn sleep_for(duration: Duration) -> Option<Pin<Box<Sleep>>> {
    Some(Box::pin(tokio::time::sleep(duration)))
}

/// Participant-side connection lifecycle driver
pub struct Lifecycle<E: MediaEngine> {
    engine: E,
    devices: Arc<dyn MediaDevices>,
    device_class: DeviceClass,
    timings: LifecycleTimings,
    media_policy: RetryPolicy,

    inputs: mpsc::UnboundedReceiver<LifecycleEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    notices: mpsc::UnboundedSender<LifecycleNotice>,

    state: LifecycleState,
    media: Option<LocalMedia>,
    peer: Option<Peer<E::Session>>,
    timers: Timers,
    quality: QualityMonitor,
    generation: u64,
    media_attempt: u64,
    negotiation_failures: u32,

    transport_up: bool,
    resume_on_transport: bool,
    audio_muted: bool,
    video_off: bool,
    suspended: bool,
}

impl<E: MediaEngine> Lifecycle<E> {
    /// Messages for the coordinator go to `outbound`; UI updates go to `notices`.
    pub fn new(
        engine: E,
        devices: Arc<dyn MediaDevices>,
        config: &ClientConfig,
        device_class: DeviceClass,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        notices: mpsc::UnboundedSender<LifecycleNotice>,
    ) -> (Self, LifecycleHandle) {
        let (tx, inputs) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            engine,
            devices,
            device_class,
            timings: LifecycleTimings::from(config),
            media_policy: RetryPolicy::from(config),
            inputs,
            internal_tx,
            internal_rx,
            outbound,
            notices,
            state: LifecycleState::Idle,
            media: None,
            peer: None,
            timers: Timers::default(),
            quality: QualityMonitor::new(),
            generation: 0,
            media_attempt: 0,
            negotiation_failures: 0,
            transport_up: true,
            resume_on_transport: false,
            audio_muted: false,
            video_off: false,
            suspended: false,
        };
        (lifecycle, LifecycleHandle { tx })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Drive the lifecycle until every handle is dropped
    pub async fn run(mut self) {
        debug!("Lifecycle driver started");
        loop {
            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(event) => self.handle_input(event).await,
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                _ = expire(&mut self.timers.establishment) => {
                    self.timers.establishment = None;
                    self.on_establishment_timeout().await;
                }
                _ = expire(&mut self.timers.ice_gathering) => {
                    self.timers.ice_gathering = None;
                    self.on_ice_gathering_timeout();
                }
                _ = expire(&mut self.timers.restart) => {
                    self.timers.restart = None;
                    self.on_restart_timeout().await;
                }
                _ = expire(&mut self.timers.video_upgrade) => {
                    self.timers.video_upgrade = None;
                    self.upgrade_video();
                }
                _ = expire(&mut self.timers.rematch) => {
                    self.timers.rematch = None;
                    self.on_rematch();
                }
                _ = tick(&mut self.timers.quality) => self.sample_quality().await,
            }
        }
        self.teardown_peer().await;
        self.timers.clear();
        if let Some(media) = self.media.take() {
            media.stop();
        }
        debug!("Lifecycle driver stopped");
    }

    async fn handle_input(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Start => self.start(),
            LifecycleEvent::Retry => self.retry(),
            LifecycleEvent::Next => self.next().await,
            LifecycleEvent::End => self.end().await,
            LifecycleEvent::ToggleAudio => {
                self.audio_muted = !self.audio_muted;
                self.apply_track_state();
            }
            LifecycleEvent::ToggleVideo => {
                self.video_off = !self.video_off;
                self.apply_track_state();
            }
            LifecycleEvent::Suspend => {
                self.suspended = true;
                self.apply_track_state();
            }
            LifecycleEvent::Resume => self.resume().await,
            LifecycleEvent::Server(message) => self.handle_server(message).await,
            LifecycleEvent::TransportLost => self.transport_lost().await,
            LifecycleEvent::TransportRestored => self.transport_restored(),
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::MediaAcquired { attempt, result } => self.on_media(attempt, result),
            Internal::Engine { generation, event } => {
                if self.peer.as_ref().map(|p| p.generation) != Some(generation) {
                    debug!("Ignoring {:?} from a closed session", event);
                    return;
                }
                self.handle_engine(event).await;
            }
        }
    }

    fn set_state(&mut self, state: LifecycleState) {
        if self.state != state {
            debug!("Lifecycle state: {} -> {}", self.state, state);
            self.state = state;
            self.notify(LifecycleNotice::State(state));
        }
    }

    fn notify(&self, notice: LifecycleNotice) {
        let _ = self.notices.send(notice);
    }

    fn status(&self, text: &str) {
        self.notify(LifecycleNotice::Status(text.to_string()));
    }

    fn send(&self, message: ClientMessage) -> bool {
        if !self.transport_up {
            debug!("Transport down, not sending {:?}", message);
            return false;
        }
        self.outbound.send(message).is_ok()
    }

    // --- user actions ---

    fn start(&mut self) {
        if !matches!(self.state, LifecycleState::Idle | LifecycleState::Ended) {
            debug!("Start ignored while {}", self.state);
            return;
        }
        if !self.transport_up {
            self.notify(LifecycleNotice::Error(
                "Not connected to server. Please try again.".to_string(),
            ));
            return;
        }
        self.negotiation_failures = 0;
        self.acquire_media();
    }

    fn retry(&mut self) {
        match self.state {
            LifecycleState::Failed if self.timers.rematch.is_none() => {
                self.negotiation_failures = 0;
                if self.media.is_some() {
                    self.request_match("Finding a stranger...");
                } else {
                    self.acquire_media();
                }
            }
            LifecycleState::Idle => self.start(),
            _ => debug!("Retry ignored while {}", self.state),
        }
    }

    async fn next(&mut self) {
        if !matches!(
            self.state,
            LifecycleState::Waiting | LifecycleState::Negotiating | LifecycleState::Connected | LifecycleState::Failed
        ) || self.media.is_none()
        {
            debug!("Next ignored while {}", self.state);
            return;
        }
        // the old session is gone before the new request leaves
        self.teardown_peer().await;
        self.timers.clear();
        self.negotiation_failures = 0;
        self.request_match("Finding next stranger...");
    }

    async fn end(&mut self) {
        if self.state == LifecycleState::Idle {
            return;
        }
        let was_matching = matches!(
            self.state,
            LifecycleState::Waiting | LifecycleState::Negotiating | LifecycleState::Connected | LifecycleState::Failed
        );
        // any acquisition still running is released when it lands
        self.media_attempt += 1;
        self.teardown_peer().await;
        self.timers.clear();
        if was_matching {
            self.send(ClientMessage::EndChat);
        }
        if let Some(media) = self.media.take() {
            media.stop();
        }
        self.suspended = false;
        self.resume_on_transport = false;
        info!("Chat ended");
        self.set_state(LifecycleState::Ended);
        self.status("Chat ended");
        self.set_state(LifecycleState::Idle);
    }

    fn apply_track_state(&self) {
        if let Some(media) = &self.media {
            media.set_enabled(MediaKind::Audio, !self.audio_muted);
            media.set_enabled(MediaKind::Video, !self.video_off && !self.suspended);
        }
        self.notify(LifecycleNotice::Controls {
            audio_muted: self.audio_muted,
            video_off: self.video_off,
        });
    }

    async fn resume(&mut self) {
        if self.suspended {
            self.suspended = false;
            self.apply_track_state();
        }
        let link_down = self
            .peer
            .as_ref()
            .map(|p| p.ice_state == LinkState::Disconnected)
            .unwrap_or(false);
        if self.state == LifecycleState::Connected && link_down {
            info!("Restarting connectivity after resume");
            self.attempt_restart().await;
        }
    }

    // --- media ---

    fn acquire_media(&mut self) {
        self.media_attempt += 1;
        let attempt = self.media_attempt;
        self.set_state(LifecycleState::AcquiringMedia);
        self.status("Getting media access...");

        let devices = self.devices.clone();
        let tx = self.internal_tx.clone();
        let constraints = MediaConstraints::full(self.device_class);
        let policy = self.media_policy;
        tokio::spawn(async move {
            let result = acquire_with_fallback(devices.as_ref(), constraints, policy).await;
            let _ = tx.send(Internal::MediaAcquired { attempt, result });
        });
    }

    fn on_media(&mut self, attempt: u64, result: Result<LocalMedia, MediaError>) {
        if attempt != self.media_attempt || self.state != LifecycleState::AcquiringMedia {
            if let Ok(media) = result {
                debug!("Releasing media from a superseded request");
                media.stop();
            }
            return;
        }
        match result {
            Ok(media) => {
                if let Err(e) = media.apply_video(VideoConstraints::initial(self.device_class)) {
                    debug!("Could not lower the initial video profile: {}", e);
                }
                self.media = Some(media);
                self.apply_track_state();
                self.request_match("Finding a stranger...");
            }
            Err(e) => {
                warn!("Media acquisition failed: {}", e);
                self.set_state(LifecycleState::Idle);
                let message = if e.is_permission_denied() {
                    "Permission denied. Please allow camera and microphone access to use this app."
                } else {
                    "Could not access your camera or microphone. Please check your hardware and permissions."
                };
                self.notify(LifecycleNotice::Error(message.to_string()));
            }
        }
    }

    // --- matching ---

    fn request_match(&mut self, status: &str) {
        self.timers.rematch = None;
        if !self.send(ClientMessage::FindMatch) {
            self.resume_on_transport = true;
            self.set_state(LifecycleState::Failed);
            self.notify(LifecycleNotice::Error("Lost connection to server".to_string()));
            return;
        }
        self.set_state(LifecycleState::Waiting);
        self.status(status);
        self.timers.establishment = sleep_for(self.timings.establishment);
    }

    fn schedule_rematch(&mut self) {
        self.timers.rematch = sleep_for(self.timings.rematch_delay);
    }

    fn on_rematch(&mut self) {
        if matches!(self.state, LifecycleState::Waiting | LifecycleState::Failed) && self.peer.is_none() {
            self.request_match("Finding next stranger...");
        }
    }

    async fn on_establishment_timeout(&mut self) {
        if !matches!(self.state, LifecycleState::Waiting | LifecycleState::Negotiating) {
            return;
        }
        warn!("Connection establishment timed out in {}", self.state);
        self.fail_before_connect(
            "Connection timeout",
            "Connection is taking too long. The other user may have connection issues.",
        )
        .await;
    }

    /// Failure before ever connecting: local media stays, the user retries.
    async fn fail_before_connect(&mut self, status: &str, error: &str) {
        self.teardown_peer().await;
        self.timers.clear();
        self.send(ClientMessage::EndChat);
        self.set_state(LifecycleState::Failed);
        self.status(status);
        self.notify(LifecycleNotice::Error(error.to_string()));
    }

    /// Handshake step failed: drop this partner and look for another one.
    async fn abandon_negotiation(&mut self, error: SessionError) {
        warn!("Abandoning negotiation: {}", error);
        self.negotiation_failures += 1;
        if self.negotiation_failures >= MAX_NEGOTIATION_FAILURES {
            self.fail_before_connect("Connection failed", "Could not establish a connection. Please try again.")
                .await;
            return;
        }
        self.teardown_peer().await;
        self.timers.clear();
        self.set_state(LifecycleState::Waiting);
        self.status("Connection problem, finding another stranger...");
        self.schedule_rematch();
    }

    async fn teardown_peer(&mut self) {
        self.timers.ice_gathering = None;
        self.timers.restart = None;
        self.timers.video_upgrade = None;
        self.timers.quality = None;
        if let Some(peer) = self.peer.take() {
            debug!("Closing peer session {}", peer.generation);
            peer.session.close().await;
        }
        self.quality.reset();
    }

    // --- coordinator messages ---

    async fn handle_server(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::UserCount { count } => self.notify(LifecycleNotice::UserCount(count)),
            ServerMessage::StartCall => self.begin_negotiation(Role::Initiator).await,
            ServerMessage::CallStarted => self.begin_negotiation(Role::Receiver).await,
            ServerMessage::NextUser => {
                if matches!(self.state, LifecycleState::Waiting | LifecycleState::Negotiating) {
                    self.status("Found a new stranger...");
                }
            }
            ServerMessage::Offer { payload } => self.on_remote_offer(payload).await,
            ServerMessage::Answer { payload } => self.on_remote_answer(payload).await,
            ServerMessage::Candidate { payload } => self.on_remote_candidate(payload).await,
            ServerMessage::UserDisconnected => self.on_partner_left().await,
            ServerMessage::Error { message } => {
                warn!("Coordinator error: {}", message);
                self.notify(LifecycleNotice::Error(message));
                // only an eviction reaches a participant that is merely queued
                if self.state == LifecycleState::Waiting && self.peer.is_none() && self.timers.rematch.is_none() {
                    self.timers.clear();
                    self.set_state(LifecycleState::Failed);
                }
            }
        }
    }

    async fn begin_negotiation(&mut self, role: Role) {
        if self.state != LifecycleState::Waiting || self.peer.is_some() {
            debug!("Ignoring {:?} role assignment while {}", role, self.state);
            return;
        }
        let media = match &self.media {
            Some(media) => media.clone(),
            None => {
                warn!("Role assignment without local media");
                return;
            }
        };

        self.generation += 1;
        let events = EngineEvents::new(self.generation, self.internal_tx.clone());
        let session = match self.engine.open(&media, events).await {
            Ok(session) => session,
            Err(e) => {
                self.abandon_negotiation(e.into()).await;
                return;
            }
        };
        info!("Paired as {:?}", role);
        self.peer = Some(Peer::new(session, role, self.generation));
        self.set_state(LifecycleState::Negotiating);

        if role == Role::Initiator {
            self.timers.ice_gathering = sleep_for(self.timings.ice_gathering);
            if let Err(e) = self.send_offer().await {
                self.abandon_negotiation(e).await;
            }
        }
    }

    async fn send_offer(&mut self) -> Result<(), SessionError> {
        let offer = {
            let peer = self
                .peer
                .as_mut()
                .ok_or_else(|| SessionError::Negotiation("no peer session".to_string()))?;
            let offer = peer.session.create_offer(false).await?;
            peer.session.set_local_description(&offer).await?;
            peer.local_offer = Some(offer.clone());
            offer
        };
        // sent before gathering completes; candidates follow one by one
        if self.send(ClientMessage::Offer { payload: offer }) {
            if let Some(peer) = self.peer.as_mut() {
                peer.offer_sent = true;
            }
        }
        Ok(())
    }

    async fn on_remote_offer(&mut self, payload: String) {
        let acceptable = match (&self.peer, self.state) {
            (Some(peer), LifecycleState::Negotiating) => peer.role == Role::Receiver && !peer.remote_set,
            // partner restarted connectivity
            (Some(_), LifecycleState::Connected) => true,
            _ => false,
        };
        if !acceptable {
            debug!("Dropping offer while {}", self.state);
            return;
        }
        if let Err(e) = self.answer_offer(&payload).await {
            self.abandon_negotiation(e).await;
        }
    }

    async fn answer_offer(&mut self, offer: &str) -> Result<(), SessionError> {
        let answer = {
            let peer = self
                .peer
                .as_mut()
                .ok_or_else(|| SessionError::Negotiation("no peer session".to_string()))?;
            peer.apply_remote_description(offer).await?;
            let answer = peer.session.create_answer().await?;
            peer.session.set_local_description(&answer).await?;
            answer
        };
        self.send(ClientMessage::Answer { payload: answer });
        Ok(())
    }

    async fn on_remote_answer(&mut self, payload: String) {
        let acceptable = match (&self.peer, self.state) {
            (Some(peer), LifecycleState::Negotiating) => {
                peer.role == Role::Initiator && peer.offer_sent && !peer.remote_set
            }
            (Some(peer), LifecycleState::Connected) => peer.awaiting_restart_answer,
            _ => false,
        };
        if !acceptable {
            debug!("Dropping answer while {}", self.state);
            return;
        }
        let result = match self.peer.as_mut() {
            Some(peer) => {
                peer.awaiting_restart_answer = false;
                peer.apply_remote_description(&payload).await
            }
            None => return,
        };
        if let Err(e) = result {
            self.abandon_negotiation(e).await;
        }
    }

    async fn on_remote_candidate(&mut self, payload: String) {
        if !matches!(self.state, LifecycleState::Negotiating | LifecycleState::Connected) {
            debug!("Dropping candidate while {}", self.state);
            return;
        }
        let peer = match self.peer.as_mut() {
            Some(peer) => peer,
            None => return,
        };
        if !peer.remote_set {
            peer.pending_candidates.push(payload);
            return;
        }
        if let Err(e) = peer.session.add_remote_candidate(&payload).await {
            warn!("Remote candidate rejected: {}", e);
        }
    }

    async fn on_partner_left(&mut self) {
        if !matches!(self.state, LifecycleState::Negotiating | LifecycleState::Connected) {
            debug!("Partner-left notice ignored while {}", self.state);
            return;
        }
        info!("Partner disconnected");
        self.teardown_peer().await;
        self.timers.clear();
        self.set_state(LifecycleState::Waiting);
        self.status("Stranger disconnected");
        self.schedule_rematch();
    }

    // --- engine reports ---

    async fn handle_engine(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                self.send(ClientMessage::Candidate { payload: candidate });
            }
            EngineEvent::GatheringComplete => {
                debug!("ICE gathering complete");
                self.timers.ice_gathering = None;
                self.send_gated_offer();
            }
            EngineEvent::ConnectionState(link) => self.on_link_state(link).await,
            EngineEvent::IceState(link) => {
                if let Some(peer) = self.peer.as_mut() {
                    peer.ice_state = link;
                }
                if self.state == LifecycleState::Connected {
                    self.on_connected_link(link).await;
                }
            }
            EngineEvent::RemoteTrack => self.notify(LifecycleNotice::RemoteMedia),
        }
    }

    async fn on_link_state(&mut self, link: LinkState) {
        match (self.state, link) {
            (LifecycleState::Negotiating, LinkState::Connected) => self.on_connected(),
            (LifecycleState::Connected, link) => self.on_connected_link(link).await,
            (LifecycleState::Negotiating, link) if link.is_broken() => {
                warn!("Connection {:?} before it was established", link);
                self.fail_before_connect(
                    "Connection failed",
                    "Failed to connect. The other user may have poor internet connection or firewall issues.",
                )
                .await;
            }
            _ => {}
        }
    }

    /// Link report from either channel after connecting. One outage usually
    /// arrives twice (ICE, then connection state); while a restart is running
    /// only `Failed` or the restart deadline end the session.
    async fn on_connected_link(&mut self, link: LinkState) {
        let restart_attempted = match self.peer.as_ref() {
            Some(peer) => peer.restart_attempted,
            None => return,
        };
        match link {
            LinkState::Connected => {
                if restart_attempted {
                    info!("Connectivity restored");
                    self.timers.restart = None;
                    if let Some(peer) = self.peer.as_mut() {
                        peer.restart_attempted = false;
                    }
                    self.status("Connected to stranger");
                }
            }
            LinkState::Disconnected if restart_attempted => {
                debug!("Link still down, restart in progress");
            }
            LinkState::Failed if restart_attempted => {
                warn!("Link failed during connectivity restart");
                self.give_up_connection().await;
            }
            link if link.is_broken() => self.attempt_restart().await,
            _ => {}
        }
    }

    async fn on_restart_timeout(&mut self) {
        let restarting = self.peer.as_ref().map(|p| p.restart_attempted).unwrap_or(false);
        if self.state == LifecycleState::Connected && restarting {
            warn!("Connectivity restart did not recover the link");
            self.give_up_connection().await;
        }
    }

    fn on_connected(&mut self) {
        info!("Connection established");
        self.timers.establishment = None;
        self.timers.ice_gathering = None;
        self.negotiation_failures = 0;
        self.set_state(LifecycleState::Connected);
        self.status("Connected to stranger");

        self.quality.reset();
        let period = self.timings.quality_interval;
        self.timers.quality = Some(tokio::time::interval_at(Instant::now() + period, period));
        self.timers.video_upgrade = sleep_for(self.timings.video_upgrade);
    }

    fn upgrade_video(&self) {
        if self.state != LifecycleState::Connected {
            return;
        }
        if let Some(media) = &self.media {
            match media.apply_video(VideoConstraints::upgraded(self.device_class)) {
                Ok(()) => debug!("Video profile raised"),
                Err(e) => debug!("Could not raise video quality: {}", e),
            }
        }
    }

    async fn attempt_restart(&mut self) {
        let result = match self.peer.as_mut() {
            Some(peer) => {
                peer.restart_attempted = true;
                peer.session.restart_ice().await
            }
            None => return,
        };
        self.timers.restart = sleep_for(self.timings.restart);
        match result {
            Ok(Some(offer)) => {
                info!("Restarting connectivity with a new offer");
                if let Some(peer) = self.peer.as_mut() {
                    peer.awaiting_restart_answer = true;
                }
                self.send(ClientMessage::Offer { payload: offer });
                self.status("Connection unstable, reconnecting...");
            }
            Ok(None) => {
                info!("Restarting connectivity");
                self.status("Connection unstable, reconnecting...");
            }
            Err(e) => {
                warn!("Connectivity restart failed: {}", e);
                self.give_up_connection().await;
            }
        }
    }

    /// The link died after connecting: treat it as the partner leaving.
    async fn give_up_connection(&mut self) {
        info!("Connection to partner lost");
        self.teardown_peer().await;
        self.timers.clear();
        self.set_state(LifecycleState::Failed);
        self.status("Stranger disconnected");
        self.schedule_rematch();
    }

    fn on_ice_gathering_timeout(&mut self) {
        if self.state != LifecycleState::Negotiating {
            return;
        }
        debug!("ICE gathering timeout reached");
        self.send_gated_offer();
    }

    /// Send the local offer if it was produced but never went out.
    ///
    /// The offer normally leaves as soon as it is set locally, so this only
    /// acts when that first send was refused.
    fn send_gated_offer(&mut self) {
        let offer = match self.peer.as_ref() {
            Some(peer) if peer.role == Role::Initiator && !peer.offer_sent => peer.local_offer.clone(),
            _ => None,
        };
        if let Some(offer) = offer {
            if self.send(ClientMessage::Offer { payload: offer }) {
                if let Some(peer) = self.peer.as_mut() {
                    peer.offer_sent = true;
                }
            }
        }
    }

    async fn sample_quality(&mut self) {
        if self.state != LifecycleState::Connected {
            self.timers.quality = None;
            return;
        }
        let sample = match self.peer.as_ref() {
            Some(peer) => peer.session.stats().await,
            None => return,
        };
        match sample {
            Ok(sample) => {
                let stats = self.quality.observe(sample);
                let tier = QualityTier::classify(&stats);
                debug!(
                    "Link quality {}: {:.0} kbps, {:.1}% video loss, {:.1}% audio loss, {:.0} ms rtt",
                    tier, stats.video_bitrate_kbps, stats.video_loss_pct, stats.audio_loss_pct, stats.rtt_ms
                );
                self.notify(LifecycleNotice::Quality { tier, stats });
            }
            Err(e) => debug!("Stats unavailable: {}", e),
        }
    }

    // --- transport ---

    async fn transport_lost(&mut self) {
        self.transport_up = false;
        match self.state {
            LifecycleState::Waiting | LifecycleState::Negotiating | LifecycleState::Connected => {
                warn!("Signaling transport lost while {}", self.state);
                self.teardown_peer().await;
                self.timers.clear();
                self.resume_on_transport = true;
                self.set_state(LifecycleState::Failed);
                self.notify(LifecycleNotice::Error("Lost connection to server".to_string()));
            }
            LifecycleState::Failed if self.timers.rematch.is_some() => {
                self.timers.rematch = None;
                self.resume_on_transport = true;
            }
            _ => {}
        }
    }

    fn transport_restored(&mut self) {
        self.transport_up = true;
        info!("Signaling transport restored");
        if self.resume_on_transport && self.state == LifecycleState::Failed && self.media.is_some() {
            self.resume_on_transport = false;
            self.request_match("Finding a stranger...");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::webrtc::engine::EngineError;
    use crate::webrtc::media::tests::ScriptedDevices;
    use crate::webrtc::media::{MediaErrorKind, MediaStream};
    use crate::webrtc::quality::{InboundCounters, StatsSample};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct EngineLog {
        ops: Mutex<Vec<String>>,
        events: Mutex<Option<EngineEvents>>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeEngine {
        log: Arc<EngineLog>,
    }

    impl FakeEngine {
        pub(crate) fn emit(&self, event: EngineEvent) {
            if let Some(events) = self.log.events.lock().as_ref() {
                events.emit(event);
            }
        }

        pub(crate) fn ops(&self) -> Vec<String> {
            self.log.ops.lock().clone()
        }

        fn count(&self, op: &str) -> usize {
            self.log.ops.lock().iter().filter(|o| *o == op).count()
        }
    }

    pub(crate) struct FakeSession {
        log: Arc<EngineLog>,
    }

    impl FakeSession {
        fn record(&self, op: String) {
            self.log.ops.lock().push(op);
        }
    }

    #[async_trait]
    impl PeerSession for FakeSession {
        async fn create_offer(&self, ice_restart: bool) -> Result<String, EngineError> {
            self.record("create_offer".to_string());
            Ok(if ice_restart { "restart-offer" } else { "offer-sdp" }.to_string())
        }

        async fn create_answer(&self) -> Result<String, EngineError> {
            Ok("answer-sdp".to_string())
        }

        async fn set_local_description(&self, sdp: &str) -> Result<(), EngineError> {
            self.record(format!("local:{}", sdp));
            Ok(())
        }

        async fn set_remote_description(&self, sdp: &str) -> Result<(), EngineError> {
            if sdp == "garbage" {
                return Err(EngineError::Sdp("unparseable".to_string()));
            }
            self.record(format!("remote:{}", sdp));
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: &str) -> Result<(), EngineError> {
            self.record(format!("candidate:{}", candidate));
            Ok(())
        }

        async fn restart_ice(&self) -> Result<Option<String>, EngineError> {
            self.record("restart_ice".to_string());
            Ok(Some("restart-offer".to_string()))
        }

        async fn stats(&self) -> Result<StatsSample, EngineError> {
            Ok(StatsSample {
                timestamp_ms: 0.0,
                video: Some(InboundCounters { bytes_received: 0, packets_received: 10, packets_lost: 0 }),
                audio: None,
                rtt_ms: Some(30.0),
            })
        }

        async fn close(&self) {
            self.record("close".to_string());
        }
    }

    #[async_trait]
    impl MediaEngine for FakeEngine {
        type Session = FakeSession;

        async fn open(&self, _media: &LocalMedia, events: EngineEvents) -> Result<FakeSession, EngineError> {
            *self.log.events.lock() = Some(events);
            self.log.ops.lock().push("open".to_string());
            Ok(FakeSession { log: self.log.clone() })
        }
    }

    struct Harness {
        handle: LifecycleHandle,
        engine: FakeEngine,
        devices: Arc<ScriptedDevices>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        notices: mpsc::UnboundedReceiver<LifecycleNotice>,
    }

    impl Harness {
        fn new(devices: ScriptedDevices) -> Self {
            let engine = FakeEngine::default();
            let devices = Arc::new(devices);
            let (out_tx, outbound) = mpsc::unbounded_channel();
            let (notice_tx, notices) = mpsc::unbounded_channel();
            let (lifecycle, handle) = Lifecycle::new(
                engine.clone(),
                devices.clone(),
                &ClientConfig::default(),
                DeviceClass::Desktop,
                out_tx,
                notice_tx,
            );
            tokio::spawn(lifecycle.run());
            Self { handle, engine, devices, outbound, notices }
        }

        async fn input(&self, event: LifecycleEvent) {
            self.handle.send(event).unwrap();
            settle().await;
        }

        async fn server(&self, message: ServerMessage) {
            self.input(LifecycleEvent::Server(message)).await;
        }

        async fn engine(&self, event: EngineEvent) {
            self.engine.emit(event);
            settle().await;
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.outbound.try_recv() {
                out.push(message);
            }
            out
        }

        fn notices(&mut self) -> Vec<LifecycleNotice> {
            let mut out = Vec::new();
            while let Ok(notice) = self.notices.try_recv() {
                out.push(notice);
            }
            out
        }

        fn states(&mut self) -> Vec<LifecycleState> {
            self.notices()
                .into_iter()
                .filter_map(|n| match n {
                    LifecycleNotice::State(state) => Some(state),
                    _ => None,
                })
                .collect()
        }

        fn media_stopped(&self) -> bool {
            self.devices
                .last_stream
                .lock()
                .as_ref()
                .map(|s| s.stopped.load(Ordering::SeqCst))
                .unwrap_or(false)
        }

        /// Start and get paired as initiator, up to Connected
        async fn connect_as_initiator(&mut self) {
            self.input(LifecycleEvent::Start).await;
            self.server(ServerMessage::StartCall).await;
            self.server(ServerMessage::Answer { payload: "answer-sdp".into() }).await;
            self.engine(EngineEvent::ConnectionState(LinkState::Connected)).await;
            assert_eq!(self.states().last(), Some(&LifecycleState::Connected));
            self.sent();
        }
    }

    /// Let the driver and spawned work run to quiescence
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn harness() -> Harness {
        Harness::new(ScriptedDevices::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_reaches_connected_and_samples_quality() {
        let mut h = harness();

        h.input(LifecycleEvent::Start).await;
        assert_eq!(h.sent(), vec![ClientMessage::FindMatch]);

        h.server(ServerMessage::StartCall).await;
        assert_eq!(h.sent(), vec![ClientMessage::Offer { payload: "offer-sdp".into() }]);

        h.engine(EngineEvent::LocalCandidate("cand-1".into())).await;
        assert_eq!(h.sent(), vec![ClientMessage::Candidate { payload: "cand-1".into() }]);

        h.server(ServerMessage::Answer { payload: "answer-sdp".into() }).await;
        assert!(h.engine.ops().contains(&"remote:answer-sdp".to_string()));

        h.engine(EngineEvent::ConnectionState(LinkState::Connected)).await;
        assert_eq!(
            h.states(),
            vec![
                LifecycleState::AcquiringMedia,
                LifecycleState::Waiting,
                LifecycleState::Negotiating,
                LifecycleState::Connected,
            ]
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h
            .notices()
            .iter()
            .any(|n| matches!(n, LifecycleNotice::Quality { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_buffers_candidates_until_offer() {
        let mut h = harness();
        h.input(LifecycleEvent::Start).await;
        h.server(ServerMessage::CallStarted).await;
        h.sent();

        h.server(ServerMessage::Candidate { payload: "c1".into() }).await;
        h.server(ServerMessage::Candidate { payload: "c2".into() }).await;
        assert!(!h.engine.ops().iter().any(|op| op.starts_with("candidate:")));

        h.server(ServerMessage::Offer { payload: "offer-sdp".into() }).await;
        assert_eq!(
            h.engine.ops(),
            vec!["open", "remote:offer-sdp", "candidate:c1", "candidate:c2", "local:answer-sdp"]
        );
        assert_eq!(h.sent(), vec![ClientMessage::Answer { payload: "answer-sdp".into() }]);

        h.server(ServerMessage::Candidate { payload: "c3".into() }).await;
        assert_eq!(h.engine.ops().last().map(String::as_str), Some("candidate:c3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partner_loss_rematches_exactly_once() {
        let mut h = harness();
        h.connect_as_initiator().await;

        // engine notices first; one restart is attempted
        h.engine(EngineEvent::ConnectionState(LinkState::Disconnected)).await;
        assert!(h.engine.ops().contains(&"restart_ice".to_string()));
        assert_eq!(h.sent(), vec![ClientMessage::Offer { payload: "restart-offer".into() }]);

        h.engine(EngineEvent::ConnectionState(LinkState::Failed)).await;
        assert_eq!(h.states(), vec![LifecycleState::Failed]);

        // coordinator notice arrives too, and stale engine reports keep coming
        h.server(ServerMessage::UserDisconnected).await;
        h.engine(EngineEvent::ConnectionState(LinkState::Failed)).await;
        assert!(h.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(h.sent(), vec![ClientMessage::FindMatch]);
        assert_eq!(h.states(), vec![LifecycleState::Waiting]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnected_while_connected_rematches_after_grace() {
        let mut h = harness();
        h.connect_as_initiator().await;

        h.server(ServerMessage::UserDisconnected).await;
        assert!(h.engine.ops().contains(&"close".to_string()));
        assert_eq!(h.states(), vec![LifecycleState::Waiting]);
        assert!(h.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(h.sent(), vec![ClientMessage::FindMatch]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_before_connect_requires_retry() {
        let mut h = harness();
        h.input(LifecycleEvent::Start).await;
        h.server(ServerMessage::StartCall).await;
        h.sent();

        h.engine(EngineEvent::ConnectionState(LinkState::Failed)).await;
        assert_eq!(h.sent(), vec![ClientMessage::EndChat]);
        assert_eq!(h.states().last(), Some(&LifecycleState::Failed));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.sent().is_empty());

        h.input(LifecycleEvent::Retry).await;
        assert_eq!(h.sent(), vec![ClientMessage::FindMatch]);
        assert!(!h.media_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_establishment_timeout_keeps_media() {
        let mut h = harness();
        h.input(LifecycleEvent::Start).await;
        h.sent();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.sent(), vec![ClientMessage::EndChat]);
        let notices = h.notices();
        assert!(notices.contains(&LifecycleNotice::State(LifecycleState::Failed)));
        assert!(notices.iter().any(|n| matches!(n, LifecycleNotice::Error(_))));
        assert!(!h.media_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_cancels_establishment_timer() {
        let mut h = harness();
        h.connect_as_initiator().await;

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(!h.states().contains(&LifecycleState::Failed));
        assert!(h.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_answer_is_ignored() {
        let mut h = harness();
        h.input(LifecycleEvent::Start).await;
        h.server(ServerMessage::StartCall).await;
        h.engine(EngineEvent::ConnectionState(LinkState::Failed)).await;

        h.server(ServerMessage::Answer { payload: "late-answer".into() }).await;
        assert!(!h.engine.ops().iter().any(|op| op.starts_with("remote:")));
        assert_eq!(h.states().last(), Some(&LifecycleState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_offer_abandons_and_requeues() {
        let mut h = harness();
        h.input(LifecycleEvent::Start).await;
        h.server(ServerMessage::CallStarted).await;
        h.sent();

        h.server(ServerMessage::Offer { payload: "garbage".into() }).await;
        assert_eq!(h.states().last(), Some(&LifecycleState::Waiting));
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(h.sent(), vec![ClientMessage::FindMatch]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_tears_down_before_requeue() {
        let mut h = harness();
        h.connect_as_initiator().await;

        h.input(LifecycleEvent::Next).await;
        assert_eq!(h.engine.ops().last().map(String::as_str), Some("close"));
        assert_eq!(h.sent(), vec![ClientMessage::FindMatch]);
        assert_eq!(h.states(), vec![LifecycleState::Waiting]);
        assert!(!h.media_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_releases_media() {
        let mut h = harness();
        h.input(LifecycleEvent::Start).await;
        h.sent();
        h.states();

        h.input(LifecycleEvent::End).await;
        assert_eq!(h.sent(), vec![ClientMessage::EndChat]);
        assert_eq!(h.states(), vec![LifecycleState::Ended, LifecycleState::Idle]);
        assert!(h.media_stopped());

        // no timer survives the end
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_media_returns_to_idle() {
        let mut h = Harness::new(ScriptedDevices::failing(&[MediaErrorKind::PermissionDenied]));
        h.input(LifecycleEvent::Start).await;

        assert!(h.sent().is_empty());
        let notices = h.notices();
        assert!(notices.contains(&LifecycleNotice::State(LifecycleState::Idle)));
        assert!(notices.iter().any(|n| matches!(n, LifecycleNotice::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_flip_tracks() {
        let mut h = harness();
        h.input(LifecycleEvent::Start).await;
        h.notices();

        h.input(LifecycleEvent::ToggleAudio).await;
        h.input(LifecycleEvent::ToggleVideo).await;
        let stream = h.devices.last_stream.lock().clone().unwrap();
        assert!(!stream.is_enabled(MediaKind::Audio));
        assert!(!stream.is_enabled(MediaKind::Video));
        assert_eq!(
            h.notices().last(),
            Some(&LifecycleNotice::Controls { audio_muted: true, video_off: true })
        );

        h.input(LifecycleEvent::ToggleVideo).await;
        assert!(stream.is_enabled(MediaKind::Video));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_pauses_video_and_resume_restarts_link() {
        let mut h = harness();
        h.connect_as_initiator().await;
        let stream = h.devices.last_stream.lock().clone().unwrap();

        h.input(LifecycleEvent::Suspend).await;
        assert!(!stream.is_enabled(MediaKind::Video));
        assert!(stream.is_enabled(MediaKind::Audio));

        h.engine(EngineEvent::IceState(LinkState::Disconnected)).await;
        let restarts = h.engine.ops().iter().filter(|op| *op == "restart_ice").count();
        assert_eq!(restarts, 1);

        h.input(LifecycleEvent::Resume).await;
        assert!(stream.is_enabled(MediaKind::Video));
        let restarts = h.engine.ops().iter().filter(|op| *op == "restart_ice").count();
        assert_eq!(restarts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_and_restore_requeues() {
        let mut h = harness();
        h.connect_as_initiator().await;

        h.input(LifecycleEvent::TransportLost).await;
        assert_eq!(h.states(), vec![LifecycleState::Failed]);
        assert!(h.sent().is_empty());

        h.input(LifecycleEvent::TransportRestored).await;
        assert_eq!(h.sent(), vec![ClientMessage::FindMatch]);
        assert_eq!(h.states(), vec![LifecycleState::Waiting]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_error_stops_waiting() {
        let mut h = harness();
        h.input(LifecycleEvent::Start).await;
        h.sent();
        h.states();

        h.server(ServerMessage::error("match wait time exceeded, please try again")).await;
        assert_eq!(h.states(), vec![LifecycleState::Failed]);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_reported_on_both_channels_keeps_one_restart() {
        let mut h = harness();
        h.connect_as_initiator().await;

        h.engine(EngineEvent::IceState(LinkState::Disconnected)).await;
        h.engine(EngineEvent::ConnectionState(LinkState::Disconnected)).await;
        assert_eq!(h.engine.count("restart_ice"), 1);
        assert!(h.states().is_empty());
        assert_eq!(h.sent(), vec![ClientMessage::Offer { payload: "restart-offer".into() }]);

        h.server(ServerMessage::Answer { payload: "restart-answer".into() }).await;
        assert!(h.engine.ops().contains(&"remote:restart-answer".to_string()));
        h.engine(EngineEvent::IceState(LinkState::Connected)).await;
        h.engine(EngineEvent::ConnectionState(LinkState::Connected)).await;
        assert!(h
            .notices()
            .contains(&LifecycleNotice::Status("Connected to stranger".to_string())));

        // the restart deadline went with the recovery
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!h.states().contains(&LifecycleState::Failed));
        assert!(h.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_deadline_gives_up_then_rematches() {
        let mut h = harness();
        h.connect_as_initiator().await;

        h.engine(EngineEvent::IceState(LinkState::Disconnected)).await;
        h.engine(EngineEvent::ConnectionState(LinkState::Disconnected)).await;
        h.sent();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!h.states().contains(&LifecycleState::Failed));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.states(), vec![LifecycleState::Failed]);
        assert_eq!(h.engine.ops().last().map(String::as_str), Some("close"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.sent(), vec![ClientMessage::FindMatch]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_starts_light_and_is_raised_once_connected() {
        let mut h = harness();
        h.connect_as_initiator().await;
        let stream = h.devices.last_stream.lock().clone().unwrap();
        assert_eq!(*stream.applied.lock(), vec![VideoConstraints::initial(DeviceClass::Desktop)]);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(stream.applied.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            *stream.applied.lock(),
            vec![
                VideoConstraints::initial(DeviceClass::Desktop),
                VideoConstraints::upgraded(DeviceClass::Desktop),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_upgrade_cancelled_when_partner_leaves() {
        let mut h = harness();
        h.connect_as_initiator().await;
        let stream = h.devices.last_stream.lock().clone().unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        h.server(ServerMessage::UserDisconnected).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.states(), vec![LifecycleState::Waiting]);
        assert_eq!(stream.applied.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_offer_is_not_resent() {
        let mut h = harness();
        h.input(LifecycleEvent::Start).await;
        h.server(ServerMessage::StartCall).await;
        assert_eq!(
            h.sent(),
            vec![ClientMessage::FindMatch, ClientMessage::Offer { payload: "offer-sdp".into() }]
        );

        // gathering timer expires without a duplicate offer
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(h.sent().is_empty());

        h.engine(EngineEvent::GatheringComplete).await;
        assert!(h.sent().is_empty());
        assert_eq!(h.engine.count("create_offer"), 1);
    }

    #[tokio::test]
    async fn test_refused_offer_goes_out_once_when_gathering_ends() {
        let engine = FakeEngine::default();
        let devices = Arc::new(ScriptedDevices::default());
        let (out_tx, mut outbound) = mpsc::unbounded_channel();
        let (notice_tx, _notices) = mpsc::unbounded_channel();
        let (mut lifecycle, _handle) = Lifecycle::new(
            engine.clone(),
            devices.clone(),
            &ClientConfig::default(),
            DeviceClass::Desktop,
            out_tx,
            notice_tx,
        );
        let media = devices.acquire(&MediaConstraints::full(DeviceClass::Desktop)).await.unwrap();
        lifecycle.media = Some(media);
        lifecycle.state = LifecycleState::Waiting;

        // first send refused
        lifecycle.transport_up = false;
        lifecycle.begin_negotiation(Role::Initiator).await;
        assert_eq!(lifecycle.state(), LifecycleState::Negotiating);
        assert!(lifecycle.timers.ice_gathering.is_some());
        assert!(outbound.try_recv().is_err());

        lifecycle.transport_up = true;
        lifecycle.on_ice_gathering_timeout();
        assert_eq!(
            outbound.try_recv().unwrap(),
            ClientMessage::Offer { payload: "offer-sdp".into() }
        );

        lifecycle.handle_engine(EngineEvent::GatheringComplete).await;
        lifecycle.on_ice_gathering_timeout();
        assert!(outbound.try_recv().is_err());
        assert!(lifecycle.timers.ice_gathering.is_none());
        assert_eq!(engine.count("create_offer"), 1);
    }
}
