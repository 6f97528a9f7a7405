//! Configuration management for strangers-core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP / WebSocket listener
    #[serde(default)]
    pub http: HttpConfig,

    /// Signaling transport
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Queue and sweeper policy
    #[serde(default)]
    pub matching: MatchingConfig,

    /// ICE servers handed to participants
    #[serde(default)]
    pub ice: IceConfig,

    /// Participant-side lifecycle and media policy
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory with the browser client, served as fallback
    #[serde(default)]
    pub static_root: Option<PathBuf>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket endpoint path
    #[serde(default = "default_signaling_path")]
    pub path: String,

    /// Server ping period in seconds
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Close connections silent for this many seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            path: default_signaling_path(),
            ping_interval_secs: default_ping_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SignalingConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Longest a participant may sit in the queue
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,

    /// Sweeper period
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Pairs without relayed traffic for this long are removed (0 disables)
    #[serde(default = "default_stale_pair_secs")]
    pub stale_pair_secs: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: default_max_wait_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_pair_secs: default_stale_pair_secs(),
        }
    }
}

impl MatchingConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_pair_after(&self) -> Option<Duration> {
        match self.stale_pair_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// One STUN/TURN entry, serialized the way browsers expect it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_ice_servers")]
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Give up on a pairing that has not connected within this time
    #[serde(default = "default_establishment_timeout_secs")]
    pub establishment_timeout_secs: u64,

    /// Send the offer anyway if candidate gathering has not finished
    #[serde(default = "default_ice_gathering_timeout_secs")]
    pub ice_gathering_timeout_secs: u64,

    /// Give up on an in-place connectivity restart after this long
    #[serde(default = "default_restart_timeout_secs")]
    pub restart_timeout_secs: u64,

    /// Stats sampling period while connected
    #[serde(default = "default_quality_interval_ms")]
    pub quality_interval_ms: u64,

    /// Video starts at a lighter profile and is raised this long after connecting
    #[serde(default = "default_video_upgrade_delay_ms")]
    pub video_upgrade_delay_ms: u64,

    /// Pause before re-entering the queue after the partner leaves
    #[serde(default = "default_rematch_delay_ms")]
    pub rematch_delay_ms: u64,

    /// Media acquisition retries before the audio-only fallback
    #[serde(default = "default_media_retries")]
    pub media_retries: u32,

    /// Pause before retrying an unclassified media failure
    #[serde(default = "default_media_backoff_ms")]
    pub media_backoff_ms: u64,

    /// Signaling reconnect attempts after the connection drops
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Pause before each signaling reconnect attempt
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            establishment_timeout_secs: default_establishment_timeout_secs(),
            ice_gathering_timeout_secs: default_ice_gathering_timeout_secs(),
            restart_timeout_secs: default_restart_timeout_secs(),
            quality_interval_ms: default_quality_interval_ms(),
            video_upgrade_delay_ms: default_video_upgrade_delay_ms(),
            rematch_delay_ms: default_rematch_delay_ms(),
            media_retries: default_media_retries(),
            media_backoff_ms: default_media_backoff_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.http.port == 0 {
            return Err("HTTP port must be non-zero".into());
        }

        if !self.signaling.path.starts_with('/') || self.signaling.path.len() < 2 {
            return Err("Signaling path must start with '/' and name an endpoint".into());
        }

        if self.signaling.ping_interval_secs == 0 {
            return Err("Signaling ping interval must be non-zero".into());
        }
        if self.signaling.timeout_secs <= self.signaling.ping_interval_secs {
            return Err("Signaling timeout must exceed the ping interval".into());
        }

        if self.matching.max_wait_secs == 0 {
            return Err("Matching max_wait_secs must be non-zero".into());
        }
        if self.matching.sweep_interval_secs == 0 {
            return Err("Matching sweep_interval_secs must be non-zero".into());
        }

        for server in &self.ice.servers {
            if server.urls.is_empty() {
                return Err("ICE server entry has no urls".into());
            }
            for url in &server.urls {
                let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
                if !is_turn && !url.starts_with("stun:") && !url.starts_with("stuns:") {
                    return Err(format!("ICE server url must be stun: or turn: ({})", url).into());
                }
                if is_turn && (server.username.is_none() || server.credential.is_none()) {
                    return Err(format!("TURN server {} requires username and credential", url).into());
                }
            }
        }

        if self.client.establishment_timeout_secs == 0 {
            return Err("Client establishment timeout must be non-zero".into());
        }
        if self.client.ice_gathering_timeout_secs == 0 {
            return Err("Client ICE gathering timeout must be non-zero".into());
        }
        if self.client.restart_timeout_secs == 0 {
            return Err("Client restart timeout must be non-zero".into());
        }
        if self.client.quality_interval_ms == 0 {
            return Err("Client quality interval must be non-zero".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.matching.max_wait(), Duration::from_secs(300));
        assert_eq!(cfg.matching.sweep_interval(), Duration::from_secs(30));
        assert_eq!(cfg.signaling.path, "/signaling");
        assert_eq!(cfg.ice.servers.len(), 4);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [http]
            port = 9000

            [matching]
            stale_pair_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.http.port, 9000);
        assert_eq!(cfg.http.host, "0.0.0.0");
        assert_eq!(cfg.matching.stale_pair_after(), None);
        assert_eq!(cfg.matching.max_wait_secs, 300);
        assert_eq!(cfg.client.media_retries, 3);
        assert_eq!(cfg.client.reconnect_attempts, 5);
        assert_eq!(cfg.client.video_upgrade_delay_ms, 5000);
    }

    #[test]
    fn ice_servers_from_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [[ice.servers]]
            urls = ["stun:stun.example.org:3478"]

            [[ice.servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "u"
            credential = "p"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ice.servers.len(), 2);
        assert_eq!(cfg.ice.servers[1], IceServer::turn("turn:turn.example.org:3478", "u", "p"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_timeout_below_ping() {
        let mut cfg = Config::default();
        cfg.signaling.timeout_secs = cfg.signaling.ping_interval_secs;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_turn_without_credentials() {
        let mut cfg = Config::default();
        cfg.ice.servers.push(IceServer::stun("turn:turn.example.org"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_signaling_path() {
        let mut cfg = Config::default();
        cfg.signaling.path = "signaling".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(&PathBuf::from("/nonexistent/strangers-core.toml")).unwrap();
        assert_eq!(cfg.http.port, 3000);
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_signaling_path() -> String {
    "/signaling".to_string()
}

fn default_ping_interval_secs() -> u64 {
    25
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_wait_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_stale_pair_secs() -> u64 {
    4 * 60 * 60
}

fn default_establishment_timeout_secs() -> u64 {
    30
}

fn default_ice_gathering_timeout_secs() -> u64 {
    20
}

fn default_restart_timeout_secs() -> u64 {
    10
}

fn default_quality_interval_ms() -> u64 {
    2000
}

fn default_video_upgrade_delay_ms() -> u64 {
    5000
}

fn default_rematch_delay_ms() -> u64 {
    2000
}

fn default_media_retries() -> u32 {
    3
}

fn default_media_backoff_ms() -> u64 {
    1000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
        IceServer::turn("turn:openrelay.metered.ca:80", "openrelayproject", "openrelayproject"),
        IceServer::turn("turn:openrelay.metered.ca:443", "openrelayproject", "openrelayproject"),
    ]
}
