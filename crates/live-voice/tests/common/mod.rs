//! In-memory server double for session tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use live_voice::audio::AudioFormat;
use live_voice::auth::{AuthError, Credential, TokenProvider};
use live_voice::transport::{
    CloseInfo, ConnectRequest, Connection, Connector, Frame, FrameSink, FrameStream,
    TransportError,
};
use live_voice::{AudioSink, LiveResult, SessionConfig, SessionEvent};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Defaults with deterministic, short backoff.
pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.reconnect.jitter = false;
    config.reconnect.base_delay_ms = 10;
    config
}

/// Scripted connector. Each entry in the script decides one connect call;
/// once the script runs out every call is accepted.
#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<TransportError>>,
    fail_always: Mutex<Option<TransportError>>,
    requests: Mutex<Vec<ConnectRequest>>,
    accepted: Mutex<Option<mpsc::UnboundedSender<ServerEnd>>>,
    pub closes: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accepted: Mutex::new(Some(tx)),
            ..Self::default()
        };
        (Arc::new(connector), rx)
    }

    pub fn fail_next(&self, err: TransportError) {
        self.script.lock().unwrap().push_back(err);
    }

    pub fn fail_always(&self, err: TransportError) {
        *self.fail_always.lock().unwrap() = Some(err);
    }

    pub fn connects(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> ConnectRequest {
        self.requests.lock().unwrap()[index].clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.fail_always.lock().unwrap().clone() {
            return Err(err);
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let end = ServerEnd {
            request,
            incoming: from_client,
            outgoing: Some(to_client),
        };
        if let Some(accepted) = self.accepted.lock().unwrap().as_ref() {
            let _ = accepted.send(end);
        }

        let sink: Box<dyn FrameSink> = Box::new(MockSink {
            tx: Some(to_server),
            closes: self.closes.clone(),
        });
        let stream: Box<dyn FrameStream> = Box::new(MockStream { rx: from_server });
        Ok((sink, stream))
    }
}

struct MockSink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.tx = None;
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await
    }
}

/// The server side of one accepted connection.
pub struct ServerEnd {
    pub request: ConnectRequest,
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
}

impl ServerEnd {
    /// Next JSON text frame from the client, skipping pings.
    pub async fn next_json(&mut self) -> Value {
        loop {
            let frame = timeout(WAIT, self.incoming.recv())
                .await
                .expect("timed out waiting for client frame")
                .expect("client closed the connection");
            match frame {
                Frame::Text(text) => return serde_json::from_str(&text).expect("client sent JSON"),
                Frame::Ping(_) | Frame::Pong(_) => continue,
                other => panic!("unexpected client frame {other:?}"),
            }
        }
    }

    /// Wait for the client to close its write half.
    pub async fn expect_closed(&mut self) {
        loop {
            let frame = timeout(WAIT, self.incoming.recv())
                .await
                .expect("timed out waiting for close");
            match frame {
                None => return,
                Some(Frame::Ping(_)) => continue,
                Some(other) => panic!("unexpected client frame {other:?}"),
            }
        }
    }

    /// Read the setup message and acknowledge it.
    pub async fn accept_setup(&mut self) -> Value {
        let setup = self.next_json().await;
        assert!(setup.get("setup").is_some(), "first frame was {setup}");
        self.send_json(serde_json::json!({ "setupComplete": {} }));
        setup
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(value.to_string());
    }

    pub fn send_text(&self, text: impl Into<String>) {
        if let Some(tx) = &self.outgoing {
            let _ = tx.send(Ok(Frame::Text(text.into())));
        }
    }

    pub fn close_with(&self, code: u16, reason: &str) {
        if let Some(tx) = &self.outgoing {
            let _ = tx.send(Ok(Frame::Close(Some(CloseInfo {
                code,
                reason: reason.to_string(),
            }))));
        }
    }

    /// Drop the connection without a close frame.
    pub fn hang_up(&mut self) {
        self.outgoing = None;
    }
}

pub async fn next_server(accepted: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    next_server_within(accepted, WAIT).await
}

pub async fn next_server_within(
    accepted: &mut mpsc::UnboundedReceiver<ServerEnd>,
    limit: Duration,
) -> ServerEnd {
    timeout(limit, accepted.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Skip events until one matches.
pub async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if matches(&event) {
            return event;
        }
    }
}

pub fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Hands out "initial" and counts refreshes, which return "fresh".
#[derive(Default)]
pub struct CountingTokens {
    pub refreshes: AtomicUsize,
}

#[async_trait]
impl TokenProvider for CountingTokens {
    async fn get_token(&self) -> Result<Credential, AuthError> {
        Ok(Credential::new("initial"))
    }

    async fn refresh_token(&self) -> Result<Credential, AuthError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::new("fresh"))
    }
}

/// Records scheduled audio instead of playing it.
#[derive(Default)]
pub struct RecordingSink {
    pub scheduled: Mutex<Vec<Vec<f32>>>,
    pub stops: AtomicU64,
    pub playing: AtomicBool,
}

impl RecordingSink {
    pub fn scheduled_samples(&self) -> usize {
        self.scheduled.lock().unwrap().iter().map(Vec::len).sum()
    }
}

impl AudioSink for RecordingSink {
    fn output_format(&self) -> AudioFormat {
        AudioFormat::DOWNLINK
    }

    fn schedule(&self, samples: Vec<f32>) -> LiveResult<()> {
        self.scheduled.lock().unwrap().push(samples);
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

/// `frames` samples of a loud square-ish tone.
pub fn loud(frames: usize) -> Vec<i16> {
    (0..frames)
        .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
        .collect()
}

pub fn silent(frames: usize) -> Vec<i16> {
    vec![0; frames]
}
