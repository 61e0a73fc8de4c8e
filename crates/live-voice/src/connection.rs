//! Connection manager
//!
//! Owns everything about getting and keeping a transport: URL and header
//! construction, credential caching and refresh, the reconnection policy, and
//! the three tasks that run for the lifetime of a link.
//!
//! ```text
//!               ┌──────────── LiveLink ────────────┐
//!  send() ──▶ queue ──▶ writer ──▶ FrameSink        │
//!               │                                   │
//!  recv() ◀── events ◀── receive loop ◀── FrameStream
//!               │          ▲                        │
//!               │     heartbeat (ping when idle)    │
//!               └───────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{AuthError, Credential, TokenProvider};
use crate::backoff::ReconnectPolicy;
use crate::codec::{decode_binary, decode_frame, ControlMessage, DecodeError};
use crate::config::{AuthPlacement, EndpointConfig, HeartbeatConfig, ReconnectConfig};
use crate::error::{FailureKind, LiveError, LiveResult};
use crate::metrics::MetricsHandle;
use crate::redact::redact_secrets;
use crate::transport::{ConnectRequest, Connector, Frame, FrameSink, FrameStream, TransportError};

/// How long a closing writer may spend draining queued frames.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Delivered from a link to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(ControlMessage),
    /// The link is gone. Sent at most once per link by each detector.
    Lost(TransportError),
}

enum Outbound {
    Frame { frame: Frame, audio: bool },
    Ping,
    Close,
}

/// A live transport with its writer, receive loop and heartbeat.
pub struct LiveLink {
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    writer: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    closing: bool,
}

impl LiveLink {
    fn start(
        sink: Box<dyn FrameSink>,
        stream: Box<dyn FrameStream>,
        metrics: MetricsHandle,
        heartbeat: &HeartbeatConfig,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(
            sink,
            outbound_rx,
            metrics.clone(),
            events_tx.clone(),
        ));
        let reader = tokio::spawn(run_receive_loop(stream, metrics.clone(), events_tx.clone()));
        let heartbeat = tokio::spawn(run_heartbeat(
            outbound_tx.clone(),
            metrics,
            events_tx,
            heartbeat.interval(),
            heartbeat.resource_timeout(),
        ));

        Self {
            outbound: outbound_tx,
            events: events_rx,
            writer: Some(writer),
            reader,
            heartbeat,
            closing: false,
        }
    }

    /// Queue an outbound message. Order is preserved across calls.
    pub fn send(&self, message: &ControlMessage) -> LiveResult<()> {
        if self.closing {
            return Err(TransportError::NotConnected.into());
        }
        let text = message.encode()?;
        let audio = matches!(message, ControlMessage::AudioData(_));
        self.outbound
            .send(Outbound::Frame {
                frame: Frame::Text(text),
                audio,
            })
            .map_err(|_| TransportError::NotConnected)?;
        Ok(())
    }

    /// Next event from the receive loop or heartbeat.
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Close the transport once, after queued frames are written, and stop
    /// the receive loop and heartbeat. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        if !self.closing {
            self.closing = true;
            let _ = self.outbound.send(Outbound::Close);
        }
        self.heartbeat.abort();
        if let Some(mut writer) = self.writer.take() {
            if timeout(CLOSE_DRAIN_TIMEOUT, &mut writer).await.is_err() {
                warn!("writer did not drain in time, aborting");
                writer.abort();
            }
        }
        self.reader.abort();
        self.events.close();
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn run_writer(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    metrics: MetricsHandle,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame { frame, audio } => {
                let bytes = match &frame {
                    Frame::Text(text) => text.len(),
                    Frame::Binary(bytes) => bytes.len(),
                    _ => 0,
                };
                let started = Instant::now();
                match sink.send(frame).await {
                    Ok(()) => metrics.record_send(bytes, audio, started.elapsed()),
                    Err(e) => {
                        metrics.update(|m| m.send_errors += 1);
                        warn!("send failed: {}", e);
                        let _ = events.send(LinkEvent::Lost(e));
                        break;
                    }
                }
            }
            Outbound::Ping => {
                let started = Instant::now();
                match sink.send(Frame::Ping(Vec::new())).await {
                    Ok(()) => metrics.record_send(0, false, started.elapsed()),
                    Err(e) => {
                        metrics.update(|m| m.ping_failures += 1);
                        debug!("heartbeat ping failed: {}", e);
                    }
                }
            }
            Outbound::Close => break,
        }
    }

    if let Err(e) = sink.close().await {
        debug!("close failed: {}", e);
    }
}

async fn run_receive_loop(
    mut stream: Box<dyn FrameStream>,
    metrics: MetricsHandle,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                let _ = events.send(LinkEvent::Lost(e));
                return;
            }
            None => {
                let _ = events.send(LinkEvent::Lost(TransportError::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                }));
                return;
            }
        };
        metrics.record_received();

        let decoded = match frame {
            Frame::Text(text) => decode_frame(&text),
            Frame::Binary(bytes) => decode_binary(&bytes),
            Frame::Ping(_) | Frame::Pong(_) => continue,
            Frame::Close(info) => {
                let (code, reason) = info
                    .map(|i| (Some(i.code), i.reason))
                    .unwrap_or((None, String::new()));
                info!(?code, reason = %redact_secrets(&reason), "server closed the connection");
                let _ = events.send(LinkEvent::Lost(TransportError::Closed { code, reason }));
                return;
            }
        };

        match decoded {
            Ok(messages) => {
                for message in messages {
                    if events.send(LinkEvent::Message(message)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => report_decode_error(&metrics, e),
        }
    }
}

fn report_decode_error(metrics: &MetricsHandle, err: DecodeError) {
    metrics.update(|m| m.decode_errors += 1);
    warn!("dropping undecodable frame: {}", err);
}

async fn run_heartbeat(
    outbound: mpsc::UnboundedSender<Outbound>,
    metrics: MetricsHandle,
    events: mpsc::UnboundedSender<LinkEvent>,
    interval: Duration,
    resource_timeout: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        if metrics.silent_for() >= resource_timeout {
            warn!(?resource_timeout, "nothing received from server, giving up on link");
            let _ = events.send(LinkEvent::Lost(TransportError::Timeout));
            return;
        }
        if metrics.idle_for() >= interval && outbound.send(Outbound::Ping).is_err() {
            metrics.update(|m| m.ping_failures += 1);
        }
    }
}

/// Establishes links, retrying per policy.
pub struct ConnectionManager {
    endpoint: EndpointConfig,
    heartbeat: HeartbeatConfig,
    policy: ReconnectPolicy,
    tokens: Arc<dyn TokenProvider>,
    connector: Arc<dyn Connector>,
    credential: Option<Credential>,
    metrics: MetricsHandle,
    /// A refresh already happened since the last established session.
    auth_refreshed: bool,
}

impl ConnectionManager {
    pub fn new(
        endpoint: EndpointConfig,
        reconnect: &ReconnectConfig,
        heartbeat: HeartbeatConfig,
        tokens: Arc<dyn TokenProvider>,
        connector: Arc<dyn Connector>,
        metrics: MetricsHandle,
    ) -> Self {
        Self {
            endpoint,
            heartbeat,
            policy: ReconnectPolicy::new(reconnect),
            tokens,
            connector,
            credential: None,
            metrics,
            auth_refreshed: false,
        }
    }

    /// Replace the reconnection policy (deterministic jitter in tests).
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &MetricsHandle {
        &self.metrics
    }

    pub fn build_url(&self, credential: &Credential) -> LiveResult<Url> {
        let ep = &self.endpoint;
        if ep.host.trim().is_empty() {
            return Err(LiveError::Config("endpoint host is empty".into()));
        }
        let base = format!("{}://{}{}", ep.scheme, ep.host, ep.path);
        let mut url = Url::parse(&base)
            .map_err(|e| LiveError::Config(format!("invalid endpoint URL {}: {}", base, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(LiveError::Config(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        let mut pairs: Vec<(&str, &str)> = ep
            .extra_query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        match ep.auth {
            AuthPlacement::QueryKey => pairs.push(("key", &credential.token)),
            AuthPlacement::QueryAccessToken => pairs.push(("access_token", &credential.token)),
            AuthPlacement::BearerHeader => {}
        }
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        Ok(url)
    }

    pub fn build_request(&self, credential: &Credential) -> LiveResult<ConnectRequest> {
        let url = self.build_url(credential)?;
        let mut headers = vec![("Cache-Control".to_string(), "no-store".to_string())];
        if self.endpoint.privacy_mode {
            headers.push(("X-Privacy-Mode".to_string(), "strict".to_string()));
        }
        if let Some(key) = &self.endpoint.encryption_key {
            headers.push(("X-Goog-Encryption-Key".to_string(), key.clone()));
        }
        if self.endpoint.auth == AuthPlacement::BearerHeader {
            headers.push((
                "Authorization".to_string(),
                format!("Bearer {}", credential.token),
            ));
        }
        Ok(ConnectRequest { url, headers })
    }

    /// Connect and send `setup`, retrying transient and auth failures.
    pub async fn connect(&mut self, setup: &ControlMessage) -> LiveResult<LiveLink> {
        loop {
            let attempt = self.policy.failures() + 1;
            let err = match self.attempt(setup, attempt).await {
                Ok(link) => return Ok(link),
                Err(err) => err,
            };

            match err.failure() {
                FailureKind::Fatal => {
                    warn!(attempt, "connection failed permanently: {}", err);
                    return Err(err);
                }
                FailureKind::Auth => {
                    warn!(attempt, "credential rejected: {}", err);
                    if !self.policy.record_immediate_retry() {
                        return Err(self.exhausted(&err));
                    }
                    self.refresh_once(&err).await?;
                }
                FailureKind::Transient => match self.policy.record_failure() {
                    Some(delay) => {
                        warn!(attempt, ?delay, "connection attempt failed: {}", err);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(self.exhausted(&err)),
                },
            }
        }
    }

    /// Re-establish after an established link was lost with `cause`.
    pub async fn reconnect(
        &mut self,
        cause: &TransportError,
        setup: &ControlMessage,
    ) -> LiveResult<LiveLink> {
        match cause.failure() {
            FailureKind::Fatal => return Err(cause.clone().into()),
            FailureKind::Auth => {
                let err = LiveError::from(cause.clone());
                if !self.policy.record_immediate_retry() {
                    return Err(self.exhausted(&err));
                }
                self.refresh_once(&err).await?;
            }
            FailureKind::Transient => match self.policy.record_failure() {
                Some(delay) => {
                    info!(?delay, "reconnecting after: {}", cause);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(self.exhausted(&LiveError::from(cause.clone()))),
            },
        }
        self.connect(setup).await
    }

    /// Session setup was acknowledged: the connection counts as successful.
    pub fn mark_established(&mut self) {
        self.policy.reset();
        self.auth_refreshed = false;
    }

    /// Start over after the caller intervenes on a failed session.
    pub fn reset_attempts(&mut self) {
        self.policy.reset();
        self.auth_refreshed = false;
    }

    pub fn clear_credential(&mut self) {
        self.credential = None;
    }

    async fn attempt(&mut self, setup: &ControlMessage, attempt: u32) -> LiveResult<LiveLink> {
        let credential = self.current_credential().await?;
        let request = self.build_request(&credential)?;
        self.metrics.reset();

        info!(
            attempt,
            url = %redact_secrets(request.url.as_str()),
            "🔌 connecting"
        );
        let (sink, stream) = timeout(
            self.heartbeat.connect_timeout(),
            self.connector.connect(request),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let link = LiveLink::start(sink, stream, self.metrics.clone(), &self.heartbeat);
        link.send(setup)?;
        debug!(attempt, "setup sent");
        Ok(link)
    }

    async fn current_credential(&mut self) -> LiveResult<Credential> {
        match &self.credential {
            Some(credential) if !credential.is_expired() => Ok(credential.clone()),
            _ => {
                let credential = self.tokens.get_token().await?;
                self.credential = Some(credential.clone());
                Ok(credential)
            }
        }
    }

    /// One refresh per established session; a second rejection is final.
    async fn refresh_once(&mut self, cause: &LiveError) -> LiveResult<()> {
        if self.auth_refreshed {
            return Err(AuthError::Rejected(redact_secrets(&cause.to_string())).into());
        }
        self.auth_refreshed = true;
        self.credential = None;
        let credential = self.tokens.refresh_token().await.map_err(|e| match e {
            AuthError::RefreshFailed(_) => e,
            other => AuthError::RefreshFailed(other.to_string()),
        })?;
        info!("🔑 credential refreshed");
        self.credential = Some(credential);
        Ok(())
    }

    fn exhausted(&self, last: &LiveError) -> LiveError {
        LiveError::ConnectionExhausted {
            attempts: self.policy.failures(),
            last_error: redact_secrets(&last.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SetupParams;
    use crate::config::{ModelConfig, SessionConfig};
    use crate::transport::Connection;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FailingConnector {
        calls: AtomicUsize,
        error: TransportError,
    }

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(&self, _request: ConnectRequest) -> Result<Connection, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    struct CountingTokens {
        refreshes: AtomicUsize,
        refresh_ok: bool,
    }

    #[async_trait]
    impl TokenProvider for CountingTokens {
        async fn get_token(&self) -> Result<Credential, AuthError> {
            Ok(Credential::new("initial"))
        }

        async fn refresh_token(&self) -> Result<Credential, AuthError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.refresh_ok {
                Ok(Credential::new("fresh"))
            } else {
                Err(AuthError::RefreshFailed("revoked".into()))
            }
        }
    }

    fn manager(
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> ConnectionManager {
        let cfg = SessionConfig::default();
        ConnectionManager::new(
            cfg.endpoint,
            &cfg.reconnect,
            cfg.heartbeat,
            tokens,
            connector,
            MetricsHandle::new(10),
        )
    }

    fn setup() -> ControlMessage {
        ControlMessage::Setup(SetupParams::from_config(&ModelConfig::default(), None))
    }

    #[test]
    fn test_build_url_and_headers() {
        let tokens = Arc::new(CountingTokens {
            refreshes: AtomicUsize::new(0),
            refresh_ok: true,
        });
        let connector = Arc::new(FailingConnector {
            calls: AtomicUsize::new(0),
            error: TransportError::Timeout,
        });
        let mut mgr = manager(connector, tokens);
        let cred = Credential::new("k 1");

        let url = mgr.build_url(&cred).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("generativelanguage.googleapis.com"));
        assert!(url.path().ends_with("BidiGenerateContent"));
        assert_eq!(url.query(), Some("key=k+1"));

        mgr.endpoint.auth = AuthPlacement::BearerHeader;
        mgr.endpoint.extra_query.insert("alt".into(), "json".into());
        mgr.endpoint.encryption_key = Some("cmek".into());
        let request = mgr.build_request(&cred).unwrap();
        assert_eq!(request.url.query(), Some("alt=json"));
        assert_eq!(request.header("authorization"), Some("Bearer k 1"));
        assert_eq!(request.header("cache-control"), Some("no-store"));
        assert_eq!(request.header("x-privacy-mode"), Some("strict"));
        assert_eq!(request.header("x-goog-encryption-key"), Some("cmek"));

        mgr.endpoint.host = String::new();
        assert!(matches!(mgr.build_url(&cred), Err(LiveError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_ceiling_stops_retrying() {
        let connector = Arc::new(FailingConnector {
            calls: AtomicUsize::new(0),
            error: TransportError::Io("connection reset".into()),
        });
        let tokens = Arc::new(CountingTokens {
            refreshes: AtomicUsize::new(0),
            refresh_ok: true,
        });
        let mut mgr = manager(connector.clone(), tokens);

        let started = Instant::now();
        let result = mgr.connect(&setup()).await;

        assert!(matches!(
            result,
            Err(LiveError::ConnectionExhausted { attempts: 5, .. })
        ));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 5);
        // 1 + 2 + 4 + 8 seconds of backoff, each with under a second of jitter
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(15));
        assert!(waited < Duration::from_secs(19));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_refreshes_once_then_fails() {
        let connector = Arc::new(FailingConnector {
            calls: AtomicUsize::new(0),
            error: TransportError::Rejected {
                status: 401,
                body: "API key not valid".into(),
            },
        });
        let tokens = Arc::new(CountingTokens {
            refreshes: AtomicUsize::new(0),
            refresh_ok: true,
        });
        let mut mgr = manager(connector.clone(), tokens.clone());

        let result = mgr.connect(&setup()).await;
        assert!(matches!(result, Err(LiveError::Auth(AuthError::Rejected(_)))));
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_is_fatal() {
        let connector = Arc::new(FailingConnector {
            calls: AtomicUsize::new(0),
            error: TransportError::Rejected {
                status: 403,
                body: String::new(),
            },
        });
        let tokens = Arc::new(CountingTokens {
            refreshes: AtomicUsize::new(0),
            refresh_ok: false,
        });
        let mut mgr = manager(connector.clone(), tokens.clone());

        let result = mgr.connect(&setup()).await;
        assert!(matches!(
            result,
            Err(LiveError::Auth(AuthError::RefreshFailed(_)))
        ));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fatal_rejection_not_retried() {
        let connector = Arc::new(FailingConnector {
            calls: AtomicUsize::new(0),
            error: TransportError::Rejected {
                status: 404,
                body: "model not found".into(),
            },
        });
        let tokens = Arc::new(CountingTokens {
            refreshes: AtomicUsize::new(0),
            refresh_ok: true,
        });
        let mut mgr = manager(connector.clone(), tokens);

        assert!(mgr.connect(&setup()).await.is_err());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    struct RecordingSink {
        frames: Arc<Mutex<Vec<Frame>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ChannelStream {
        rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    }

    #[async_trait]
    impl FrameStream for ChannelStream {
        async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
            self.rx.recv().await
        }
    }

    #[tokio::test]
    async fn test_link_decodes_and_survives_bad_frames() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let metrics = MetricsHandle::new(10);

        let mut link = LiveLink::start(
            Box::new(RecordingSink {
                frames: frames.clone(),
                closes: closes.clone(),
            }),
            Box::new(ChannelStream { rx: server_rx }),
            metrics.clone(),
            &HeartbeatConfig::default(),
        );

        server_tx.send(Ok(Frame::Text("{oops".into()))).unwrap();
        server_tx
            .send(Ok(Frame::Text(
                r#"{"serverContent":{"turnComplete":true},"usageMetadata":{"n":1}}"#.into(),
            )))
            .unwrap();

        assert_eq!(
            link.recv().await,
            Some(LinkEvent::Message(ControlMessage::TurnComplete))
        );
        assert!(matches!(
            link.recv().await,
            Some(LinkEvent::Message(ControlMessage::UsageMetadata(_)))
        ));
        assert_eq!(metrics.snapshot().decode_errors, 1);

        link.send(&ControlMessage::AudioStreamEnd).unwrap();
        link.shutdown().await;
        link.shutdown().await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(frames.lock().unwrap().len(), 1);
        assert!(link.send(&ControlMessage::AudioStreamEnd).is_err());
    }

    #[tokio::test]
    async fn test_server_close_reported_as_lost() {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let mut link = LiveLink::start(
            Box::new(RecordingSink {
                frames: Arc::new(Mutex::new(Vec::new())),
                closes: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(ChannelStream { rx: server_rx }),
            MetricsHandle::new(10),
            &HeartbeatConfig::default(),
        );

        server_tx
            .send(Ok(Frame::Close(Some(crate::transport::CloseInfo {
                code: 1008,
                reason: "401 Unauthorized".into(),
            }))))
            .unwrap();

        match link.recv().await {
            Some(LinkEvent::Lost(err)) => assert_eq!(err.failure(), FailureKind::Auth),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_when_idle() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let mut link = LiveLink::start(
            Box::new(RecordingSink {
                frames: frames.clone(),
                closes: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(ChannelStream { rx: server_rx }),
            MetricsHandle::new(10),
            &HeartbeatConfig::default(),
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        let pings = frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| matches!(f, Frame::Ping(_)))
            .count();
        assert!(pings >= 1);

        // nothing received for the resource timeout: link reported lost
        let event = link.recv().await;
        assert_eq!(event, Some(LinkEvent::Lost(TransportError::Timeout)));
        drop(server_tx);
    }
}
