//! Transport seam: a bidirectional frame channel.
//!
//! The connection manager talks to [`Connector`], [`FrameSink`] and
//! [`FrameStream`] so tests can swap the network for an in-memory double.
//! [`WsConnector`] is the production WebSocket implementation.

use std::fmt;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::auth::is_auth_failure;
use crate::error::FailureKind;
use crate::redact::redact_secrets;

/// Close code and reason received from (or sent to) the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// One transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseInfo>),
}

/// Everything needed to open a connection.
#[derive(Clone)]
pub struct ConnectRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl ConnectRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), redact_secrets(v)))
            .collect();
        f.debug_struct("ConnectRequest")
            .field("url", &redact_secrets(self.url.as_str()))
            .field("headers", &headers)
            .finish()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("operation timed out")]
    Timeout,

    #[error("handshake rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("network error: {0}")]
    Io(String),

    #[error("invalid connect request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Classify for the reconnection policy.
    pub fn failure(&self) -> FailureKind {
        match self {
            TransportError::Rejected { status, body } => match status {
                401 | 403 => FailureKind::Auth,
                _ if is_auth_failure(body) => FailureKind::Auth,
                429 | 500..=599 => FailureKind::Transient,
                400..=499 => FailureKind::Fatal,
                _ => FailureKind::Transient,
            },
            TransportError::Closed { code, reason } => {
                if is_auth_failure(reason) {
                    FailureKind::Auth
                } else if matches!(code, Some(1007) | Some(1008)) {
                    // invalid payload / policy violation: the setup was refused
                    FailureKind::Fatal
                } else {
                    FailureKind::Transient
                }
            }
            TransportError::InvalidRequest(_) => FailureKind::Fatal,
            TransportError::NotConnected
            | TransportError::Timeout
            | TransportError::SendFailed(_)
            | TransportError::Io(_) => FailureKind::Transient,
        }
    }
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Send a close frame and shut the write half.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection. `None` means the peer went away.
#[async_trait]
pub trait FrameStream: Send {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>>;
}

pub type Connection = (Box<dyn FrameSink>, Box<dyn FrameStream>);

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector over tokio-tungstenite (rustls, native roots).
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(map_ws_error)?;

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            ws_request.headers_mut().insert(name, value);
        }

        debug!(url = %redact_secrets(request.url.as_str()), "opening websocket");
        let (stream, response) = connect_async(ws_request).await.map_err(map_ws_error)?;
        debug!(status = %response.status(), "websocket handshake complete");

        let (sink, stream) = stream.split();
        let sink: Box<dyn FrameSink> = Box::new(WsSink { inner: sink });
        let source: Box<dyn FrameStream> = Box::new(WsSource { inner: stream });
        Ok((sink, source))
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Ping(bytes) => Message::Ping(bytes),
            Frame::Pong(bytes) => Message::Pong(bytes),
            Frame::Close(info) => Message::Close(info.map(|info| CloseFrame {
                code: CloseCode::from(info.code),
                reason: info.reason.into(),
            })),
        };
        self.inner.send(message).await.map_err(|e| match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::NotConnected,
            other => TransportError::SendFailed(other.to_string()),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(map_ws_error(e)),
        }
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsSource {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(map_ws_error(e))),
            };
            let frame = match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(bytes) => Frame::Binary(bytes),
                Message::Ping(bytes) => Frame::Ping(bytes),
                Message::Pong(bytes) => Frame::Pong(bytes),
                Message::Close(close) => Frame::Close(close.map(|c| CloseInfo {
                    code: u16::from(c.code),
                    reason: c.reason.into_owned(),
                })),
                // raw frames are never surfaced when reading
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}

fn map_ws_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            TransportError::Rejected {
                status,
                body: redact_secrets(&body),
            }
        }
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed {
            code: None,
            reason: "connection closed".to_string(),
        },
        WsError::Url(e) => TransportError::InvalidRequest(e.to_string()),
        WsError::Io(e) => TransportError::Io(e.to_string()),
        other => TransportError::Io(redact_secrets(&other.to_string())),
    }
}
