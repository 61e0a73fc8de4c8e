//! Error types for the live voice session core

use thiserror::Error;

use crate::auth::AuthError;
use crate::codec::{DecodeError, EncodeError};
use crate::state::SessionState;
use crate::transport::TransportError;

/// Result type alias for session operations
pub type LiveResult<T> = Result<T, LiveError>;

/// How a failure should be handled by the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network blips, timeouts, server-side hiccups. Retried with backoff.
    Transient,
    /// Credential rejected. Refresh once, then retry immediately.
    Auth,
    /// Never retried.
    Fatal,
}

/// Errors that can occur in a live session
#[derive(Error, Debug)]
pub enum LiveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection attempts exhausted after {attempts} tries: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    #[error("Server rejected the session: {0}")]
    Rejected(String),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Session driver stopped unexpectedly: {0}")]
    Driver(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LiveError {
    /// Classify this error for retry decisions.
    pub fn failure(&self) -> FailureKind {
        match self {
            LiveError::Transport(err) => err.failure(),
            LiveError::Io(_) => FailureKind::Transient,
            _ => FailureKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.failure() == FailureKind::Fatal
    }
}

impl From<config::ConfigError> for LiveError {
    fn from(err: config::ConfigError) -> Self {
        LiveError::Config(err.to_string())
    }
}

impl From<sled::Error> for LiveError {
    fn from(err: sled::Error) -> Self {
        LiveError::Store(err.to_string())
    }
}

impl From<cpal::DevicesError> for LiveError {
    fn from(err: cpal::DevicesError) -> Self {
        LiveError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for LiveError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        LiveError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for LiveError {
    fn from(err: cpal::BuildStreamError) -> Self {
        LiveError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for LiveError {
    fn from(err: cpal::PlayStreamError) -> Self {
        LiveError::AudioStream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            LiveError::Config("bad".into()).failure(),
            FailureKind::Fatal
        );
        assert_eq!(
            LiveError::Transport(TransportError::Timeout).failure(),
            FailureKind::Transient
        );
        assert!(LiveError::ConnectionExhausted {
            attempts: 5,
            last_error: "timeout".into()
        }
        .is_fatal());
    }
}
