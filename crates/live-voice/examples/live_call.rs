//! Example: Live Voice Call
//!
//! Talks to the live service through the default microphone and speakers.
//! Needs `GEMINI_API_KEY` in the environment (or a `.env` file).
//!
//! ```text
//! cargo run -p live-voice --example live_call
//! cargo run -p live-voice --example live_call -- --resume <session-id>
//! ```

use std::sync::Arc;

use anyhow::Context;
use live_voice::{
    EnvTokenProvider, LiveSession, MicrophoneTap, RodioSink, SessionConfig, SessionDeps,
    SessionEvent, SledSessionStore, TerminateMode,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SessionConfig::load().context("loading session config")?;
    let store = Arc::new(SledSessionStore::open("data/live-voice-sessions")?);
    let deps = SessionDeps::new(Arc::new(EnvTokenProvider::new("GEMINI_API_KEY")))
        .with_audio_sink(Arc::new(RodioSink::new()?))
        .with_store(store);

    let resume_id = std::env::args()
        .skip_while(|arg| arg != "--resume")
        .nth(1);
    let (session, mut events) = match resume_id {
        Some(id) => {
            info!("♻️ Resuming session {}", id);
            LiveSession::resume(config, deps, &id)?
        }
        None => LiveSession::new(config, deps)?,
    };

    info!("🎙️ Live Voice Call");
    info!("==================");
    info!("Session: {}", session.id());
    info!("Press Ctrl+C to hang up.");

    let mic = MicrophoneTap::start(session.capture_handle())?;
    info!("🎤 Listening on {}", mic.device_name());
    session.connect().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Hanging up...");
                break;
            }
            event = events.recv() => match event {
                Some(SessionEvent::Connected { resumed, .. }) => {
                    info!("✅ Connected{}", if resumed { " (resumed)" } else { "" });
                }
                Some(SessionEvent::BargeIn) => info!("⚡ Barge-in"),
                Some(SessionEvent::TurnComplete) => info!("🤖 Turn complete"),
                Some(SessionEvent::Error { message, fatal: true }) => {
                    warn!("❌ Session failed: {}", message);
                    break;
                }
                Some(SessionEvent::Error { message, .. }) => warn!("⚠️ {}", message),
                Some(other) => tracing::debug!(?other, "session event"),
                None => break,
            },
        }
    }

    drop(mic);
    // keep the handle so the call can be resumed with --resume
    session.terminate(TerminateMode::Suspend).await?;
    info!("👋 Goodbye (resume with --resume {})", session.id());
    Ok(())
}
