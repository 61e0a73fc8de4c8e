//! # Live Voice - Real-time Bidirectional Audio Sessions
//!
//! This crate streams microphone audio to a remote generative-audio service over
//! a persistent WebSocket and plays the synthesized reply as it arrives. It
//! detects turn boundaries locally, survives network drops and expired
//! credentials, and cuts playback the moment the user talks over the model.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Live Session                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Audio In   │→ │ Chunk + VAD  │→ │  Wire Codec  │──┐        │
//! │  │    (cpal)    │  │ (hysteresis) │  │    (JSON)    │  │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  ▼        │
//! │         │ barge-in                         ┌────────────────┐    │
//! │         ▼                                  │   Connection   │◀──▶ WebSocket
//! │  ┌──────────────┐  ┌──────────────┐        │    Manager     │    │
//! │  │  Audio Out   │← │   Playback   │←───────│ (retry, auth,  │    │
//! │  │   (rodio)    │  │   Pipeline   │        │   heartbeat)   │    │
//! │  └──────────────┘  └──────────────┘        └────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use live_voice::{EnvTokenProvider, LiveSession, SessionConfig, SessionDeps, TerminateMode};
//!
//! # async fn demo() -> live_voice::LiveResult<()> {
//! let deps = SessionDeps::new(Arc::new(EnvTokenProvider::new("GEMINI_API_KEY")));
//! let (session, mut events) = LiveSession::new(SessionConfig::load()?, deps)?;
//! session.connect().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! session.terminate(TerminateMode::Close).await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod auth;
pub mod backoff;
pub mod capture;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod metrics;
pub mod playback;
pub mod redact;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;
pub mod vad;

pub use audio::{AudioChunk, AudioFormat, Direction};
pub use auth::{AuthError, Credential, EnvTokenProvider, StaticTokenProvider, TokenProvider};
pub use backoff::ReconnectPolicy;
pub use capture::{CaptureHandle, CapturePipeline, CapturedFrame, ChunkAccumulator, MicrophoneTap};
pub use codec::{ControlMessage, DecodeError, EncodeError, SetupParams};
pub use config::{SessionConfig, VadMode};
pub use connection::{ConnectionManager, LinkEvent, LiveLink};
pub use error::{FailureKind, LiveError, LiveResult};
pub use events::{SessionEvent, Speaker, TranscriptEntry, TranscriptSink};
pub use metrics::{ConnectionMetrics, MetricsSnapshot};
pub use playback::{AudioSink, NullSink, PlaybackHandle, PlaybackPipeline, RodioSink};
pub use session::{LiveSession, SessionDeps, TerminateMode};
pub use state::SessionState;
pub use store::{MemorySessionStore, SessionRecord, SessionStore, SledSessionStore};
pub use transport::{Connector, Frame, TransportError, WsConnector};
pub use vad::{VadEvent, VadState, VoiceActivityDetector};
