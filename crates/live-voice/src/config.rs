//! Session configuration.
//!
//! Loaded with layered sources: built-in defaults, then a TOML file
//! (`LIVE_VOICE_CONFIG`, else `config/live-voice.toml` when present), then
//! environment variables with the `LIVE_VOICE` prefix and `__` as the section
//! separator (e.g. `LIVE_VOICE_RECONNECT__MAX_ATTEMPTS=3`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LiveError, LiveResult};

/// Default config file consulted when `LIVE_VOICE_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config/live-voice.toml";

/// Root configuration for one live session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub endpoint: EndpointConfig,
    pub model: ModelConfig,
    pub capture: CaptureConfig,
    pub vad: VadConfig,
    pub playback: PlaybackConfig,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
}

impl SessionConfig {
    /// Load from file + environment on top of defaults.
    pub fn load() -> LiveResult<Self> {
        let config_path =
            std::env::var("LIVE_VOICE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&config_path);

        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("LIVE_VOICE").separator("__"))
            .build()?;

        let cfg: SessionConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that can never produce a working session.
    pub fn validate(&self) -> LiveResult<()> {
        if self.endpoint.host.trim().is_empty() {
            return Err(LiveError::Config("endpoint.host is empty".into()));
        }
        if !matches!(self.endpoint.scheme.as_str(), "ws" | "wss") {
            return Err(LiveError::Config(format!(
                "endpoint.scheme must be ws or wss, got {}",
                self.endpoint.scheme
            )));
        }
        if self.model.model.trim().is_empty() {
            return Err(LiveError::Config("model.model is empty".into()));
        }
        if self.capture.target_sample_rate == 0 || self.capture.chunk_frames == 0 {
            return Err(LiveError::Config(
                "capture.target_sample_rate and capture.chunk_frames must be positive".into(),
            ));
        }
        if self.vad.silence_threshold >= self.vad.speech_threshold {
            return Err(LiveError::Config(format!(
                "vad.silence_threshold ({}) must be below vad.speech_threshold ({})",
                self.vad.silence_threshold, self.vad.speech_threshold
            )));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(LiveError::Config("reconnect.max_attempts must be at least 1".into()));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(LiveError::Config("heartbeat.interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Where the credential goes on the connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPlacement {
    /// `?key=<token>` (API key)
    QueryKey,
    /// `?access_token=<token>` (short-lived OAuth token)
    QueryAccessToken,
    /// `Authorization: Bearer <token>`
    BearerHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub auth: AuthPlacement,
    /// Extra protocol-negotiation query parameters appended to the URL.
    pub extra_query: BTreeMap<String, String>,
    /// Adds the strict privacy marker header to the connect request.
    pub privacy_mode: bool,
    /// Customer-managed encryption key forwarded as a header.
    pub encryption_key: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            scheme: "wss".to_string(),
            host: "generativelanguage.googleapis.com".to_string(),
            path: "/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent"
                .to_string(),
            auth: AuthPlacement::QueryKey,
            extra_query: BTreeMap::new(),
            privacy_mode: true,
            encryption_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model: String,
    pub response_modalities: Vec<String>,
    pub voice_name: Option<String>,
    pub temperature: Option<f32>,
    pub system_instruction: Option<String>,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.0-flash-exp".to_string(),
            response_modalities: vec!["AUDIO".to_string()],
            voice_name: Some("Aoede".to_string()),
            temperature: None,
            system_instruction: None,
            input_transcription: false,
            output_transcription: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate required by the service for uplink audio.
    pub target_sample_rate: u32,
    /// Frames (mono samples) per transmitted chunk.
    pub chunk_frames: usize,
    /// Normalized average amplitude below which captured frames are never sent.
    pub noise_floor: f32,
}

impl CaptureConfig {
    /// Size of one outbound chunk in bytes (s16le mono).
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_frames * 2
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            // 100ms at 16kHz
            chunk_frames: 1_600,
            noise_floor: 0.0015,
        }
    }
}

/// Who decides that the user stopped talking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadMode {
    /// Local amplitude detector sends `audioStreamEnd`.
    Client,
    /// The service detects turn ends; no stream-end is sent.
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub mode: VadMode,
    /// Below this a speaking user is considered silent.
    pub silence_threshold: f32,
    /// Above this a silent user is considered speaking again.
    pub speech_threshold: f32,
    pub silence_duration_ms: u64,
}

impl VadConfig {
    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            mode: VadMode::Client,
            silence_threshold: 0.01,
            speech_threshold: 0.02,
            silence_duration_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Rate assumed for inbound audio whose MIME type carries no `rate=`.
    pub input_sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 24_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Consecutive failures tolerated before giving up. On a fresh connect
    /// that is this many connection attempts. After an established session
    /// drops, the lost link is the first failure, so at most
    /// `max_attempts - 1` reconnection attempts follow.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Adds up to one second of random delay to each backoff.
    pub jitter: bool,
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub resource_timeout_ms: u64,
    /// Number of send-latency samples kept for averaging.
    pub metrics_window: usize,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn resource_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_timeout_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            connect_timeout_ms: 15_000,
            resource_timeout_ms: 300_000,
            metrics_window: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = SessionConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.capture.chunk_bytes(), 3_200);
        assert_eq!(cfg.heartbeat.interval(), Duration::from_secs(15));
        assert_eq!(cfg.reconnect.max_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let mut cfg = SessionConfig::default();
        cfg.vad.silence_threshold = 0.05;
        cfg.vad.speech_threshold = 0.02;
        assert!(matches!(cfg.validate(), Err(LiveError::Config(_))));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: SessionConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[reconnect]\nmax_attempts = 3\n\n[vad]\nmode = \"server\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.reconnect.max_attempts, 3);
        assert_eq!(cfg.reconnect.base_delay_ms, 1_000);
        assert_eq!(cfg.vad.mode, VadMode::Server);
        assert_eq!(cfg.model.voice_name.as_deref(), Some("Aoede"));
    }
}
