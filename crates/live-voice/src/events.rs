//! Session events and transcript sink
//!
//! Everything a UI or host application needs to observe comes out of the
//! session as a [`SessionEvent`] on a per-session channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::metrics::MetricsSnapshot;
use crate::state::SessionState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Setup acknowledged; audio is flowing.
    Connected {
        session_id: String,
        resumed: bool,
    },
    Disconnected {
        session_id: String,
        metrics: MetricsSnapshot,
    },
    Error {
        message: String,
        fatal: bool,
    },
    SpeechStarted,
    SpeechEnded,
    StreamEndSent,
    /// User spoke over model audio; playback was cut.
    BargeIn,
    TurnComplete,
    /// The service stopped generating because the user interrupted.
    Interrupted,
    UsageMetadata {
        usage: Value,
    },
    GoAway {
        time_left: Option<String>,
    },
    ResumptionUpdated {
        resumable: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub session_id: String,
    pub speaker: Speaker,
    pub text: String,
    pub metadata: Value,
    pub at: DateTime<Utc>,
}

/// Receives transcript text as it arrives.
pub trait TranscriptSink: Send + Sync {
    fn record(&self, entry: TranscriptEntry);
}

/// Writes transcript lines to the log.
#[derive(Debug, Default)]
pub struct LogTranscriptSink;

impl TranscriptSink for LogTranscriptSink {
    fn record(&self, entry: TranscriptEntry) {
        let who = match entry.speaker {
            Speaker::User => "🗣️ user",
            Speaker::Model => "🤖 model",
        };
        info!(session_id = %entry.session_id, "{}: {}", who, entry.text);
    }
}
