//! Local media acquisition
//!
//! Camera and microphone access goes through [`MediaDevices`]. Acquisition
//! failures are retried with progressively simpler constraints before giving up:
//! - device busy / aborted: simple audio, same video
//! - constraints not satisfiable: reduced video
//! - anything else: back off, then retry unchanged
//!
//! Once retries run out, audio alone is tried as a last resort. A denied
//! permission is final straight away.

use crate::config::ClientConfig;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Hardware class; selects the full-quality video request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
}

const MOBILE_MARKERS: &[&str] = &[
    "Android", "webOS", "iPhone", "iPad", "iPod", "BlackBerry", "IEMobile", "Opera Mini",
];

impl DeviceClass {
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        if MOBILE_MARKERS.iter().any(|m| ua.contains(&m.to_ascii_lowercase())) {
            DeviceClass::Mobile
        } else {
            DeviceClass::Desktop
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRate {
    Ideal(u32),
    Max(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
}

impl VideoConstraints {
    pub fn full(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Desktop => Self { width: 1280, height: 720, frame_rate: FrameRate::Ideal(30) },
            DeviceClass::Mobile => Self { width: 640, height: 480, frame_rate: FrameRate::Max(24) },
        }
    }

    pub fn reduced() -> Self {
        Self { width: 320, height: 240, frame_rate: FrameRate::Ideal(15) }
    }

    /// Lighter capture applied while the connection is being set up
    pub fn initial(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Desktop => Self { width: 640, height: 480, frame_rate: FrameRate::Ideal(24) },
            DeviceClass::Mobile => Self::reduced(),
        }
    }

    /// Capture raised to once the link has been up for a while
    pub fn upgraded(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Desktop => Self { width: 1280, height: 720, frame_rate: FrameRate::Ideal(30) },
            DeviceClass::Mobile => Self { width: 640, height: 480, frame_rate: FrameRate::Ideal(24) },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioConstraints {
    /// Echo cancellation, noise suppression and automatic gain
    Processed,
    /// Any microphone, no processing requested
    Simple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn full(class: DeviceClass) -> Self {
        Self {
            audio: AudioConstraints::Processed,
            video: Some(VideoConstraints::full(class)),
        }
    }

    pub fn audio_only() -> Self {
        Self { audio: AudioConstraints::Simple, video: None }
    }

    pub fn with_simple_audio(self) -> Self {
        Self { audio: AudioConstraints::Simple, ..self }
    }

    pub fn with_reduced_video(self) -> Self {
        Self { video: Some(VideoConstraints::reduced()), ..self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorKind {
    /// Device in use by another application
    DeviceBusy,
    /// Request aborted by the platform
    Aborted,
    /// No device satisfies the requested constraints
    Overconstrained,
    /// User or policy refused access
    PermissionDenied,
    /// No camera or microphone present
    NotFound,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub message: String,
}

impl MediaError {
    pub fn new(kind: MediaErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn is_permission_denied(&self) -> bool {
        self.kind == MediaErrorKind::PermissionDenied
    }
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for MediaError {}

/// Live capture from the local devices
pub trait MediaStream: Send + Sync {
    fn has_track(&self, kind: MediaKind) -> bool;
    fn set_enabled(&self, kind: MediaKind, enabled: bool);
    fn is_enabled(&self, kind: MediaKind) -> bool;
    /// Change resolution and frame rate of the live video track
    fn apply_constraints(&self, video: &VideoConstraints) -> Result<(), MediaError>;
    /// Release the devices
    fn stop(&self);
}

/// Acquired local media plus the constraints that produced it
#[derive(Clone)]
pub struct LocalMedia {
    stream: Arc<dyn MediaStream>,
    constraints: MediaConstraints,
}

impl LocalMedia {
    pub fn new(stream: Arc<dyn MediaStream>, constraints: MediaConstraints) -> Self {
        Self { stream, constraints }
    }

    pub fn stream(&self) -> &Arc<dyn MediaStream> {
        &self.stream
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    pub fn has_video(&self) -> bool {
        self.stream.has_track(MediaKind::Video)
    }

    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        if self.stream.has_track(kind) {
            self.stream.set_enabled(kind, enabled);
        }
    }

    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.stream.has_track(kind) && self.stream.is_enabled(kind)
    }

    /// Reshape the video track; a no-op for audio-only media
    pub fn apply_video(&self, video: VideoConstraints) -> Result<(), MediaError> {
        if !self.has_video() {
            return Ok(());
        }
        debug!("Applying video constraints {:?}", video);
        self.stream.apply_constraints(&video)
    }

    pub fn stop(&self) {
        self.stream.stop();
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("constraints", &self.constraints)
            .field("audio", &self.stream.has_track(MediaKind::Audio))
            .field("video", &self.stream.has_track(MediaKind::Video))
            .finish()
    }
}

/// Platform access to camera and microphone
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retries: 3, backoff: Duration::from_secs(1) }
    }
}

impl From<&ClientConfig> for RetryPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            retries: config.media_retries,
            backoff: Duration::from_millis(config.media_backoff_ms),
        }
    }
}

/// Run the fallback ladder starting from `constraints`
pub async fn acquire_with_fallback<D>(
    devices: &D,
    constraints: MediaConstraints,
    policy: RetryPolicy,
) -> Result<LocalMedia, MediaError>
where
    D: MediaDevices + ?Sized,
{
    let mut constraints = constraints;
    let mut retries_left = policy.retries;

    loop {
        debug!("Requesting user media with {:?}", constraints);
        let error = match devices.acquire(&constraints).await {
            Ok(media) => {
                info!("Acquired local media ({:?})", constraints);
                return Ok(media);
            }
            Err(e) => e,
        };

        if error.is_permission_denied() {
            warn!("Media access denied: {}", error.message);
            return Err(error);
        }

        if retries_left == 0 {
            warn!("Media retries exhausted ({}), trying audio only", error);
            return match devices.acquire(&MediaConstraints::audio_only()).await {
                Ok(media) => {
                    info!("Acquired audio-only media");
                    Ok(media)
                }
                Err(e) => {
                    warn!("Audio-only fallback failed: {}", e);
                    Err(e)
                }
            };
        }
        retries_left -= 1;

        match error.kind {
            MediaErrorKind::DeviceBusy | MediaErrorKind::Aborted => {
                debug!("{}; retrying with simpler audio ({} left)", error, retries_left);
                constraints = constraints.with_simple_audio();
            }
            MediaErrorKind::Overconstrained => {
                debug!("{}; retrying with reduced video ({} left)", error, retries_left);
                constraints = constraints.with_reduced_video();
            }
            _ => {
                debug!("{}; retrying in {:?} ({} left)", error, policy.backoff, retries_left);
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}
