//! Amplitude-based voice activity detection with hysteresis
//!
//! A frame is classified by its mean absolute amplitude. Two thresholds keep the
//! detector from flapping around a single level:
//!
//! ```text
//!            amp > speech_threshold
//!   Silent ─────────────────────────▶ Speaking
//!     ▲                                  │
//!     └──────────────────────────────────┘
//!            amp < silence_threshold
//! ```
//!
//! A speech episode opens on the transition to `Speaking` and stays open until
//! its single `StreamEnd`. Only chunks transmitted while an episode is open
//! count toward it, so audio sent between utterances never arms a stream end.
//! Once the silence run reaches `silence_duration` and the episode has audio
//! (sent, or still buffered and about to be flushed), the caller is told the
//! stream end is due.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{VadConfig, VadMode};

/// Current classification of the user's voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    #[default]
    Silent,
    Speaking,
}

/// Snapshot of detector state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VadState {
    pub voice: VoiceState,
    /// Start of the current silence run, if silent.
    pub silence_started: Option<Instant>,
    /// A speech episode started and its stream end has not gone out yet.
    pub episode_open: bool,
    /// Chunks of the open episode transmitted so far.
    pub episode_chunks: u64,
}

/// Events produced by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStarted,
    SpeechEnded,
    /// The user finished an utterance; tell the service to respond.
    StreamEnd,
}

/// Hysteresis detector driven by per-frame amplitude.
pub struct VoiceActivityDetector {
    config: VadConfig,
    state: VadState,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: VadState::default(),
        }
    }

    pub fn state(&self) -> &VadState {
        &self.state
    }

    pub fn mode(&self) -> VadMode {
        self.config.mode
    }

    /// Switch between client-side and server-side turn detection.
    pub fn set_mode(&mut self, mode: VadMode) {
        self.config.mode = mode;
    }

    pub fn is_speaking(&self) -> bool {
        self.state.voice == VoiceState::Speaking
    }

    /// Record that an audio chunk was transmitted.
    pub fn note_chunk_sent(&mut self) {
        if self.state.episode_open {
            self.state.episode_chunks += 1;
        }
    }

    /// Classify one frame's amplitude, captured at `at`.
    ///
    /// Returns the speech transitions only; ask [`Self::poll_stream_end`]
    /// afterwards, once the frame's audio has been handed to the uplink.
    pub fn observe(&mut self, amplitude: f32, at: Instant) -> Vec<VadEvent> {
        let mut events = Vec::new();

        match self.state.voice {
            VoiceState::Silent if amplitude > self.config.speech_threshold => {
                debug!(amplitude, "speech started");
                self.state.voice = VoiceState::Speaking;
                self.state.silence_started = None;
                self.state.episode_open = true;
                self.state.episode_chunks = 0;
                events.push(VadEvent::SpeechStarted);
            }
            VoiceState::Speaking if amplitude < self.config.silence_threshold => {
                debug!(amplitude, "speech ended");
                self.state.voice = VoiceState::Silent;
                self.state.silence_started = Some(at);
                events.push(VadEvent::SpeechEnded);
            }
            VoiceState::Silent if self.state.silence_started.is_none() => {
                self.state.silence_started = Some(at);
            }
            _ => {}
        }

        events
    }

    /// Close the episode if its stream end is due at `at`.
    ///
    /// `pending_audio` reports episode audio still buffered below a full chunk;
    /// the caller must transmit it before the stream end.
    pub fn poll_stream_end(&mut self, at: Instant, pending_audio: bool) -> Option<VadEvent> {
        if self.config.mode != VadMode::Client
            || self.state.voice != VoiceState::Silent
            || !self.has_episode_audio(pending_audio)
        {
            return None;
        }
        let due = self
            .state
            .silence_started
            .map(|start| at.saturating_duration_since(start) >= self.silence_duration())
            .unwrap_or(false);
        if !due {
            return None;
        }

        debug!(
            chunks = self.state.episode_chunks,
            pending_audio, "silence long enough, ending stream"
        );
        self.close_episode();
        Some(VadEvent::StreamEnd)
    }

    /// Whether a stream end is still owed when the stream is being closed
    /// outright. Ignores the silence timer.
    pub fn take_final_stream_end(&mut self, pending_audio: bool) -> bool {
        if self.config.mode == VadMode::Server || !self.has_episode_audio(pending_audio) {
            return false;
        }
        self.close_episode();
        true
    }

    pub fn reset(&mut self) {
        self.state = VadState::default();
    }

    fn has_episode_audio(&self, pending_audio: bool) -> bool {
        self.state.episode_open && (self.state.episode_chunks > 0 || pending_audio)
    }

    fn close_episode(&mut self) {
        self.state.episode_open = false;
        self.state.episode_chunks = 0;
    }

    fn silence_duration(&self) -> Duration {
        self.config.silence_duration()
    }
}
