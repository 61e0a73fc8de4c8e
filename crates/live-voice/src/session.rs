//! Live session: wires capture, connection, codec and playback together.
//!
//! A [`LiveSession`] is constructed explicitly with its dependencies and owns
//! no global state, so several can run side by side. `connect()` spawns a
//! driver task that owns the connection manager and the capture consumer;
//! `terminate()` stops it and hands those parts back for a later reconnect.

use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::AudioFormat;
use crate::auth::TokenProvider;
use crate::capture::{CaptureHandle, CapturePipeline, CapturedFrame, UplinkAction};
use crate::codec::{ControlMessage, SetupParams};
use crate::config::{SessionConfig, VadMode};
use crate::connection::{ConnectionManager, LinkEvent, LiveLink};
use crate::error::{FailureKind, LiveError, LiveResult};
use crate::events::{LogTranscriptSink, SessionEvent, Speaker, TranscriptEntry, TranscriptSink};
use crate::metrics::{MetricsHandle, MetricsSnapshot};
use crate::playback::{AudioSink, NullSink, PlaybackHandle, PlaybackPipeline};
use crate::redact::redact_secrets;
use crate::state::{SessionState, StateMachine};
use crate::store::{SessionRecord, SessionStore};
use crate::transport::{Connector, TransportError, WsConnector};

/// What to keep when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminateMode {
    /// Forget the credential and the resumption handle.
    #[default]
    Close,
    /// Forget the credential but keep the resumption handle for [`LiveSession::resume`].
    Suspend,
}

/// Collaborators injected into a session.
pub struct SessionDeps {
    pub tokens: Arc<dyn TokenProvider>,
    pub connector: Arc<dyn Connector>,
    pub audio_sink: Arc<dyn AudioSink>,
    pub transcripts: Arc<dyn TranscriptSink>,
    pub store: Option<Arc<dyn SessionStore>>,
}

impl SessionDeps {
    /// WebSocket transport, no audio output, transcripts to the log.
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            tokens,
            connector: Arc::new(WsConnector::new()),
            audio_sink: Arc::new(NullSink),
            transcripts: Arc::new(LogTranscriptSink),
            store: None,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_audio_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.audio_sink = sink;
        self
    }

    pub fn with_transcripts(mut self, transcripts: Arc<dyn TranscriptSink>) -> Self {
        self.transcripts = transcripts;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }
}

struct SessionInner {
    id: String,
    created_at: DateTime<Utc>,
    config: SessionConfig,
    state: StateMachine,
    events: mpsc::UnboundedSender<SessionEvent>,
    resumption: StdMutex<Option<String>>,
    capture: CaptureHandle,
    vad_mode: watch::Sender<VadMode>,
    metrics: MetricsHandle,
    store: Option<Arc<dyn SessionStore>>,
    control: Mutex<Control>,
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: SessionState) {
        match self.state.transition(next) {
            Ok(from) => self.emit(SessionEvent::StateChanged { from, to: next }),
            Err(e) => warn!(session_id = %self.id, "ignoring {}", e),
        }
    }

    fn resumption_handle(&self) -> Option<String> {
        self.resumption
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_resumption_handle(&self, handle: Option<String>) {
        *self
            .resumption
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handle;
    }

    fn persist(&self, terminated: bool) {
        let Some(store) = &self.store else {
            return;
        };
        let record = SessionRecord {
            session_id: self.id.clone(),
            model: self.config.model.model.clone(),
            resumption_handle: self.resumption_handle(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            terminated,
        };
        if let Err(e) = store.save(&record) {
            warn!(session_id = %self.id, "failed to persist session: {}", e);
        }
    }
}

/// Parts owned by the driver while it runs.
struct DriverParts {
    manager: ConnectionManager,
    capture_rx: mpsc::UnboundedReceiver<CapturedFrame>,
    pipeline: CapturePipeline,
    audio_sink: Arc<dyn AudioSink>,
    playback: Option<PlaybackPipeline>,
    transcripts: Arc<dyn TranscriptSink>,
}

struct DriverRun {
    shutdown: oneshot::Sender<TerminateMode>,
    task: JoinHandle<DriverParts>,
}

#[derive(Default)]
struct Control {
    parts: Option<DriverParts>,
    driver: Option<DriverRun>,
}

/// One conversational session with the remote service. Cheap to clone.
#[derive(Clone)]
pub struct LiveSession {
    inner: Arc<SessionInner>,
}

impl LiveSession {
    /// Build a new session. Nothing connects until [`connect`](Self::connect).
    pub fn new(
        config: SessionConfig,
        deps: SessionDeps,
    ) -> LiveResult<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        Self::build(config, deps, Uuid::new_v4().to_string(), None, Utc::now())
    }

    /// Rebuild a session from its stored record, reusing its resumption handle.
    pub fn resume(
        config: SessionConfig,
        deps: SessionDeps,
        session_id: &str,
    ) -> LiveResult<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let store = deps
            .store
            .clone()
            .ok_or_else(|| LiveError::Config("resuming requires a session store".into()))?;
        let record = store
            .load(session_id)?
            .ok_or_else(|| LiveError::Store(format!("no stored session {}", session_id)))?;
        if record.terminated || record.resumption_handle.is_none() {
            return Err(LiveError::Store(format!(
                "session {} is not resumable",
                session_id
            )));
        }
        Self::build(
            config,
            deps,
            record.session_id,
            record.resumption_handle,
            record.created_at,
        )
    }

    fn build(
        config: SessionConfig,
        deps: SessionDeps,
        id: String,
        resumption: Option<String>,
        created_at: DateTime<Utc>,
    ) -> LiveResult<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (capture, capture_rx) = CaptureHandle::channel(config.capture.target_sample_rate);
        let (vad_mode, _) = watch::channel(config.vad.mode);
        let metrics = MetricsHandle::new(config.heartbeat.metrics_window);

        let manager = ConnectionManager::new(
            config.endpoint.clone(),
            &config.reconnect,
            config.heartbeat.clone(),
            deps.tokens,
            deps.connector,
            metrics.clone(),
        );
        let parts = DriverParts {
            manager,
            capture_rx,
            pipeline: CapturePipeline::new(&config.capture, config.vad.clone()),
            audio_sink: deps.audio_sink,
            playback: None,
            transcripts: deps.transcripts,
        };

        info!(session_id = %id, model = %config.model.model, "🎙️ session created");

        let inner = SessionInner {
            id,
            created_at,
            config,
            state: StateMachine::new(),
            events: events_tx,
            resumption: StdMutex::new(resumption),
            capture,
            vad_mode,
            metrics,
            store: deps.store,
            control: Mutex::new(Control {
                parts: Some(parts),
                driver: None,
            }),
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        ))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn resumption_handle(&self) -> Option<String> {
        self.inner.resumption_handle()
    }

    /// Producer for captured audio. Frames are dropped until the session is active.
    pub fn capture_handle(&self) -> CaptureHandle {
        self.inner.capture.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Switch turn detection between the local detector and the service.
    pub fn set_vad_mode(&self, mode: VadMode) {
        self.inner.vad_mode.send_replace(mode);
    }

    /// Start connecting. Returns once the driver is running; progress is
    /// reported through events and [`state`](Self::state).
    pub async fn connect(&self) -> LiveResult<()> {
        let mut control = self.inner.control.lock().await;

        if let Some(run) = control.driver.take() {
            if !run.task.is_finished() {
                control.driver = Some(run);
                debug!(session_id = %self.inner.id, "already connecting");
                return Ok(());
            }
            let parts = run
                .task
                .await
                .map_err(|e| LiveError::Driver(e.to_string()))?;
            control.parts = Some(parts);
        }

        let mut parts = control
            .parts
            .take()
            .ok_or_else(|| LiveError::Driver("session parts unavailable".into()))?;
        let from = match self.inner.state.transition(SessionState::Connecting) {
            Ok(from) => from,
            Err(e) => {
                control.parts = Some(parts);
                return Err(e);
            }
        };
        self.inner.emit(SessionEvent::StateChanged {
            from,
            to: SessionState::Connecting,
        });

        parts.manager.reset_attempts();
        if parts.playback.is_none() {
            parts.playback = Some(PlaybackPipeline::spawn(
                parts.audio_sink.clone(),
                AudioFormat::mono(self.inner.config.playback.input_sample_rate),
            ));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = Driver {
            inner: self.inner.clone(),
            parts,
            link: None,
        };
        let task = tokio::spawn(driver.run(shutdown_rx));
        control.driver = Some(DriverRun {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// End the session. Idempotent; concurrent callers wait for the one doing
    /// the work. Afterwards no audio is sent and the transport is closed.
    pub async fn terminate(&self, mode: TerminateMode) -> LiveResult<()> {
        let mut control = self.inner.control.lock().await;

        let Some(run) = control.driver.take() else {
            debug!(session_id = %self.inner.id, "terminate: nothing running");
            return Ok(());
        };
        let _ = run.shutdown.send(mode);
        let parts = run
            .task
            .await
            .map_err(|e| LiveError::Driver(e.to_string()))?;

        if self.state() == SessionState::Disconnected {
            control.parts = Some(parts);
            return Ok(());
        }

        // the driver had already stopped on its own (failed)
        let mut driver = Driver {
            inner: self.inner.clone(),
            parts,
            link: None,
        };
        driver.teardown(mode).await;
        control.parts = Some(driver.parts);
        Ok(())
    }
}

enum Exit {
    Terminate(TerminateMode),
    Failed(LiveError),
}

enum LoopExit {
    Terminate(TerminateMode),
    Lost(TransportError),
    Failed(LiveError),
    GoAway,
}

enum Next {
    Fresh,
    Reconnect(TransportError),
    Immediate,
}

struct Driver {
    inner: Arc<SessionInner>,
    parts: DriverParts,
    link: Option<LiveLink>,
}

impl Driver {
    async fn run(mut self, mut shutdown: oneshot::Receiver<TerminateMode>) -> DriverParts {
        match self.drive(&mut shutdown).await {
            Exit::Terminate(mode) => self.teardown(mode).await,
            Exit::Failed(err) => self.fail(err).await,
        }
        self.parts
    }

    fn playback(&self) -> Option<PlaybackHandle> {
        self.parts.playback.as_ref().map(PlaybackPipeline::handle)
    }

    fn setup_message(&self) -> ControlMessage {
        ControlMessage::Setup(SetupParams::from_config(
            &self.inner.config.model,
            self.inner.resumption_handle(),
        ))
    }

    async fn drive(&mut self, shutdown: &mut oneshot::Receiver<TerminateMode>) -> Exit {
        let mut next = Next::Fresh;
        loop {
            let setup = self.setup_message();
            let reconnecting = !matches!(next, Next::Fresh);

            let link = {
                let DriverParts {
                    manager,
                    capture_rx,
                    ..
                } = &mut self.parts;
                let connecting = async {
                    match &next {
                        Next::Reconnect(cause) => manager.reconnect(cause, &setup).await,
                        Next::Fresh | Next::Immediate => manager.connect(&setup).await,
                    }
                };
                tokio::pin!(connecting);
                loop {
                    tokio::select! {
                        result = &mut connecting => break result,
                        mode = &mut *shutdown => return Exit::Terminate(mode.unwrap_or_default()),
                        // not active: captured audio is discarded
                        Some(_) = capture_rx.recv() => {}
                    }
                }
            };

            let link = match link {
                Ok(link) => link,
                Err(err) => return Exit::Failed(err),
            };
            if reconnecting {
                self.inner.set_state(SessionState::Connecting);
            }
            self.inner.set_state(SessionState::AwaitingSetupAck);
            self.parts.pipeline.reset();
            self.link = Some(link);

            let exit = self.session_loop(shutdown).await;
            next = match exit {
                LoopExit::Terminate(mode) => return Exit::Terminate(mode),
                LoopExit::Failed(err) => return Exit::Failed(err),
                LoopExit::Lost(err) if err.failure() == FailureKind::Fatal => {
                    return Exit::Failed(err.into())
                }
                LoopExit::Lost(err) => {
                    warn!(session_id = %self.inner.id, "connection lost: {}", err);
                    Next::Reconnect(err)
                }
                LoopExit::GoAway if self.inner.state.current() == SessionState::Active => {
                    Next::Immediate
                }
                LoopExit::GoAway => {
                    // never established: counts against the attempt ceiling
                    warn!(session_id = %self.inner.id, "goAway before setup acknowledgement");
                    Next::Reconnect(TransportError::Closed {
                        code: None,
                        reason: "goAway before setup acknowledgement".to_string(),
                    })
                }
            };

            self.close_link().await;
            if let Some(playback) = self.playback() {
                playback.interrupt();
            }
            self.inner.set_state(SessionState::Reconnecting);
        }
    }

    async fn session_loop(&mut self, shutdown: &mut oneshot::Receiver<TerminateMode>) -> LoopExit {
        let deadline = tokio::time::sleep(self.inner.config.heartbeat.connect_timeout());
        tokio::pin!(deadline);

        loop {
            let awaiting_ack = self.inner.state.current() == SessionState::AwaitingSetupAck;
            tokio::select! {
                mode = &mut *shutdown => return LoopExit::Terminate(mode.unwrap_or_default()),
                _ = &mut deadline, if awaiting_ack => {
                    warn!(session_id = %self.inner.id, "no setup acknowledgement in time");
                    return LoopExit::Lost(TransportError::Timeout);
                }
                event = recv_link(&mut self.link) => match event {
                    Some(LinkEvent::Message(message)) => {
                        if let Some(exit) = self.handle_message(message) {
                            return exit;
                        }
                    }
                    Some(LinkEvent::Lost(err)) => return LoopExit::Lost(err),
                    None => {
                        return LoopExit::Lost(TransportError::Closed {
                            code: None,
                            reason: "link ended".to_string(),
                        })
                    }
                },
                Some(frame) = self.parts.capture_rx.recv() => self.handle_frame(frame),
            }
        }
    }

    fn send(&self, message: ControlMessage) {
        if let Some(link) = &self.link {
            if let Err(e) = link.send(&message) {
                debug!("dropping {}: {}", message.name(), e);
            }
        }
    }

    fn handle_frame(&mut self, frame: CapturedFrame) {
        if !self.inner.state.current().accepts_audio() {
            return;
        }
        let mode = *self.inner.vad_mode.borrow();
        if self.parts.pipeline.vad().mode() != mode {
            self.parts.pipeline.set_vad_mode(mode);
        }

        for action in self.parts.pipeline.process(&frame) {
            self.apply(action);
        }
    }

    fn apply(&self, action: UplinkAction) {
        match action {
            UplinkAction::SendChunk(chunk) => self.send(ControlMessage::AudioData(chunk)),
            UplinkAction::StreamEnd => {
                debug!(session_id = %self.inner.id, "end of user speech");
                self.send(ControlMessage::AudioStreamEnd);
                self.inner.emit(SessionEvent::StreamEndSent);
            }
            UplinkAction::SpeechStarted => {
                self.inner.emit(SessionEvent::SpeechStarted);
                if let Some(playback) = self.playback().filter(|p| p.is_playing()) {
                    info!(session_id = %self.inner.id, "🛑 barge-in, stopping playback");
                    playback.interrupt();
                    self.inner.emit(SessionEvent::BargeIn);
                }
            }
            UplinkAction::SpeechEnded => self.inner.emit(SessionEvent::SpeechEnded),
        }
    }

    fn transcript(&self, speaker: Speaker, text: String, source: &str) {
        self.parts.transcripts.record(TranscriptEntry {
            session_id: self.inner.id.clone(),
            speaker,
            text,
            metadata: json!({ "source": source }),
            at: Utc::now(),
        });
    }

    fn handle_message(&mut self, message: ControlMessage) -> Option<LoopExit> {
        match message {
            ControlMessage::SetupComplete => {
                if self.inner.state.current() != SessionState::AwaitingSetupAck {
                    debug!("duplicate setup acknowledgement ignored");
                    return None;
                }
                self.parts.manager.mark_established();
                self.inner.set_state(SessionState::Active);
                let resumed = self.inner.resumption_handle().is_some();
                info!(session_id = %self.inner.id, resumed, "✅ session active");
                self.inner.persist(false);
                self.inner.emit(SessionEvent::Connected {
                    session_id: self.inner.id.clone(),
                    resumed,
                });
            }
            ControlMessage::ServerAudio { mime_type, data } => {
                if let Some(playback) = self.playback() {
                    playback.enqueue(mime_type, data);
                }
            }
            ControlMessage::ServerText(text) => self.transcript(Speaker::Model, text, "text"),
            ControlMessage::InputTranscription(text) => {
                self.transcript(Speaker::User, text, "input_transcription")
            }
            ControlMessage::OutputTranscription(text) => {
                self.transcript(Speaker::Model, text, "output_transcription")
            }
            ControlMessage::TurnComplete => self.inner.emit(SessionEvent::TurnComplete),
            ControlMessage::Interrupted => {
                if let Some(playback) = self.playback() {
                    playback.interrupt();
                }
                self.inner.emit(SessionEvent::Interrupted);
            }
            ControlMessage::SessionResumptionUpdate { handle, resumable } => {
                if let Some(handle) = handle {
                    self.inner.set_resumption_handle(Some(handle));
                    self.inner.persist(false);
                }
                self.inner
                    .emit(SessionEvent::ResumptionUpdated { resumable });
            }
            ControlMessage::UsageMetadata(usage) => {
                self.inner.emit(SessionEvent::UsageMetadata { usage })
            }
            ControlMessage::GoAway { time_left } => {
                info!(session_id = %self.inner.id, ?time_left, "server going away, reconnecting");
                self.inner.emit(SessionEvent::GoAway { time_left });
                return Some(LoopExit::GoAway);
            }
            ControlMessage::Error { code, message } => {
                return self.handle_server_error(code, message);
            }
            ControlMessage::Setup(_)
            | ControlMessage::AudioData(_)
            | ControlMessage::AudioStreamEnd => {
                debug!("ignoring outbound message type from server");
            }
        }
        None
    }

    fn handle_server_error(&self, code: Option<i64>, message: String) -> Option<LoopExit> {
        let message = redact_secrets(&message);
        let status = code.and_then(|c| u16::try_from(c).ok());
        warn!(session_id = %self.inner.id, ?status, "server error: {}", message);

        let awaiting_ack = self.inner.state.current() == SessionState::AwaitingSetupAck;
        let err = TransportError::Rejected {
            status: status.unwrap_or(0),
            body: message.clone(),
        };
        match err.failure() {
            FailureKind::Auth => Some(LoopExit::Lost(err)),
            FailureKind::Fatal => Some(LoopExit::Failed(LiveError::Rejected(message))),
            FailureKind::Transient if status.is_some() => Some(LoopExit::Lost(err)),
            FailureKind::Transient if awaiting_ack => {
                Some(LoopExit::Failed(LiveError::Rejected(message)))
            }
            FailureKind::Transient => {
                self.inner.emit(SessionEvent::Error {
                    message,
                    fatal: false,
                });
                None
            }
        }
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown().await;
        }
    }

    async fn teardown(&mut self, mode: TerminateMode) {
        let was_active = self.inner.state.current() == SessionState::Active;
        self.inner.set_state(SessionState::Terminating);

        if was_active {
            for action in self.parts.pipeline.flush() {
                match action {
                    UplinkAction::SendChunk(_) | UplinkAction::StreamEnd => self.apply(action),
                    _ => {}
                }
            }
        }
        self.close_link().await;
        self.parts.pipeline.reset();
        if let Some(playback) = self.parts.playback.take() {
            playback.shutdown().await;
        }

        self.parts.manager.clear_credential();
        match mode {
            TerminateMode::Close => {
                self.inner.set_resumption_handle(None);
                self.inner.persist(true);
            }
            TerminateMode::Suspend => self.inner.persist(false),
        }

        let metrics = self.inner.metrics.snapshot();
        self.inner.set_state(SessionState::Disconnected);
        info!(session_id = %self.inner.id, ?mode, "👋 session terminated");
        self.inner.emit(SessionEvent::Disconnected {
            session_id: self.inner.id.clone(),
            metrics,
        });
    }

    async fn fail(&mut self, err: LiveError) {
        let message = redact_secrets(&err.to_string());
        error!(session_id = %self.inner.id, "session failed: {}", message);

        self.close_link().await;
        self.parts.pipeline.reset();
        if let Some(playback) = self.playback() {
            playback.interrupt();
        }
        self.inner.set_state(SessionState::Failed);
        self.inner.emit(SessionEvent::Error {
            message,
            fatal: true,
        });
    }
}

async fn recv_link(link: &mut Option<LiveLink>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::store::MemorySessionStore;

    fn deps() -> SessionDeps {
        SessionDeps::new(Arc::new(StaticTokenProvider::new("key")))
    }

    #[tokio::test]
    async fn test_new_session_is_disconnected() {
        let (session, _events) = LiveSession::new(SessionConfig::default(), deps()).unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(Uuid::parse_str(session.id()).is_ok());
        assert!(session.resumption_handle().is_none());
        // nothing to do yet
        session.terminate(TerminateMode::Close).await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SessionConfig::default();
        config.model.model = String::new();
        assert!(matches!(
            LiveSession::new(config, deps()),
            Err(LiveError::Config(_))
        ));
    }

    #[test]
    fn test_resume_requires_resumable_record() {
        let store = Arc::new(MemorySessionStore::new());
        let mut record = SessionRecord::new("abc", "models/x");
        store.save(&record).unwrap();

        let result = LiveSession::resume(
            SessionConfig::default(),
            deps().with_store(store.clone()),
            "abc",
        );
        assert!(matches!(result, Err(LiveError::Store(_))));

        record.resumption_handle = Some("h".into());
        store.save(&record).unwrap();
        let (session, _events) =
            LiveSession::resume(SessionConfig::default(), deps().with_store(store), "abc")
                .unwrap();
        assert_eq!(session.id(), "abc");
        assert_eq!(session.resumption_handle().as_deref(), Some("h"));
    }
}
