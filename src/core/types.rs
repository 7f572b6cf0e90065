use std::fmt;

use thiserror::Error;

/// Convenience result alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Canonical error surface of the hub connection engine.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The hub rejected the credential. Never retried.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Timeout: {context}")]
    Timeout { context: String },

    /// Application-level failure reported on a `result` frame.
    #[error("Server error: code={code}, message={message}")]
    ServerError { code: String, message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Protocol invariant violation (duplicate identifier, unexpected handshake frame).
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backpressure: {max} requests already pending")]
    TooManyPending { max: usize },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Connection has been disposed")]
    Disposed,

    #[error("Actor error: {0}")]
    ActorError(String),
}

impl HubError {
    pub(crate) fn transport(context: &'static str, err: impl ToString) -> Self {
        HubError::TransportError {
            context,
            error: err.to_string(),
        }
    }

    pub(crate) fn cancelled(reason: impl Into<String>) -> Self {
        HubError::Cancelled(reason.into())
    }

    /// Whether a connect attempt failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HubError::ConnectionFailed(_)
                | HubError::TransportError { .. }
                | HubError::Timeout { .. }
                | HubError::ActorError(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HubError::Cancelled(_))
    }
}

/// Lifecycle of one connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    /// Previously registered subscriptions are being re-issued on a fresh session.
    Restoring,
    Connected,
}

impl ConnectionState {
    /// A session exists and internal requests may flow.
    #[inline]
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Restoring | ConnectionState::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Restoring => "restoring",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-independent buffer sizing parameters used for websocket configuration.
#[derive(Clone, Copy, Debug)]
pub struct WebSocketBufferConfig {
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 128 << 10,
            max_write_buffer_bytes: 256 << 10,
            // Hub state dumps (`get_states`) on large installs run to several megabytes.
            max_message_bytes: 16 * 1024 * 1024,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// TLS configuration for websocket connections.
///
/// Certificate validation is enabled unless explicitly disabled for local installs with
/// self-signed certificates.
#[derive(Clone, Copy, Debug)]
pub struct WsTlsConfig {
    pub validate_certs: bool,
}

impl Default for WsTlsConfig {
    fn default() -> Self {
        Self {
            validate_certs: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_phase_failures_are_retryable() {
        assert!(HubError::ConnectionFailed("refused".into()).is_retryable());
        assert!(HubError::transport("read", "reset").is_retryable());
        assert!(
            HubError::Timeout {
                context: "auth".into()
            }
            .is_retryable()
        );
        assert!(
            !HubError::AuthenticationFailed {
                message: "bad token".into()
            }
            .is_retryable()
        );
        assert!(!HubError::cancelled("close").is_retryable());
        assert!(!HubError::InvalidOperation("id reuse".into()).is_retryable());
    }

    #[test]
    fn only_restoring_and_connected_are_live() {
        assert!(ConnectionState::Connected.is_live());
        assert!(ConnectionState::Restoring.is_live());
        assert!(!ConnectionState::Authenticating.is_live());
        assert!(!ConnectionState::Disconnected.is_live());
        assert_eq!(ConnectionState::default().to_string(), "disconnected");
    }
}
