//! Unified error types for Courier channels.
//!
//! Each failure class of the gateway has its own enum so that callers can tell
//! recoverable transport trouble apart from configuration mistakes:
//!
//! | Error | Raised by | Effect |
//! |-------|-----------|--------|
//! | [`ConfigValidationError`] | `initialize` | fatal, nothing is started |
//! | [`AuthError`] | token exchange, gateway identify | token cache cleared |
//! | [`ConnectionError`] | socket layer | reconnect with backoff |
//! | [`ProtocolError`] | frame decoding | frame dropped |
//! | [`ApiError`] | outbound HTTP calls | failed `SendResult` |
//! | [`HandlerError`] | message subscribers | logged, isolated |

use thiserror::Error;

// =============================================================================
// Configuration Errors
// =============================================================================

/// A channel configuration failed validation.
///
/// Carries every problem found, not only the first one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid configuration for channel '{channel}': {}", issues.join("; "))]
pub struct ConfigValidationError {
    /// Channel the configuration belongs to.
    pub channel: String,
    /// Human-readable description of each failing field.
    pub issues: Vec<String>,
}

impl ConfigValidationError {
    /// Creates a validation error from a list of issues.
    pub fn new(channel: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            channel: channel.into(),
            issues,
        }
    }
}

// =============================================================================
// Authentication Errors
// =============================================================================

/// Errors raised while obtaining or presenting platform credentials.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The platform refused the credentials.
    #[error("credentials rejected ({code}): {message}")]
    Rejected {
        /// Platform error code or close code.
        code: i64,
        /// Message returned by the platform.
        message: String,
    },

    /// The token endpoint could not be reached or answered garbage.
    #[error("token exchange failed: {0}")]
    Exchange(String),
}

impl AuthError {
    /// Creates a rejection error.
    pub fn rejected(code: i64, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }
}

// =============================================================================
// Connection Errors
// =============================================================================

/// Socket-level failures. Never fatal while a channel is running.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Opening the socket failed.
    #[error("connection failed: {url} - {reason}")]
    ConnectFailed {
        /// Endpoint that failed.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// The peer closed the connection.
    #[error("connection closed ({code}): {reason}")]
    Closed {
        /// Close code, `0` when none was sent.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// Writing to the socket failed.
    #[error("failed to send frame: {0}")]
    SendFailed(String),

    /// The server stopped acknowledging heartbeats or never finished the handshake.
    #[error("connection timed out: {0}")]
    Timeout(String),
}

// =============================================================================
// Protocol Errors
// =============================================================================

/// A frame could not be understood.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// The frame is not valid for the protocol.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame arrived in a state where it makes no sense.
    #[error("unexpected frame: {0}")]
    Unexpected(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

// =============================================================================
// API Errors
// =============================================================================

/// Failures of outbound platform HTTP calls.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The platform answered with an error code.
    #[error("API error on {path} ({code}): {message}")]
    Platform {
        /// Request path.
        path: String,
        /// Platform-defined error code.
        code: i64,
        /// Message returned by the platform.
        message: String,
    },

    /// Non-success HTTP status without a platform error body.
    #[error("HTTP {status} on {path}: {body}")]
    Status {
        /// Request path.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },

    /// The request never produced a response.
    #[error("request to {path} failed: {reason}")]
    Request {
        /// Request path.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// The response body could not be decoded.
    #[error("failed to decode response from {path}: {reason}")]
    Decode {
        /// Request path.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// The target string could not be resolved to a platform address.
    #[error("invalid target '{0}'")]
    InvalidTarget(String),

    /// The platform cannot deliver this kind of content to this target.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Credentials could not be obtained.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ApiError {
    /// Returns true if the failure means the access token is no longer valid.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Status { status: 401, .. })
    }
}

// =============================================================================
// Handler Errors
// =============================================================================

/// Error returned by a message subscriber.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Channel Errors
// =============================================================================

/// Errors surfaced by channel lifecycle operations.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// `start` was called before `initialize`.
    #[error("channel '{0}' has not been initialized")]
    NotInitialized(String),

    /// The channel configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigValidationError),

    /// Credentials were rejected.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Transport failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Platform API failure.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Anything else a driver wants to report.
    #[error("{0}")]
    Other(String),
}

impl ChannelError {
    /// Creates a free-form channel error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for channel lifecycle operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Result type for platform API calls.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_issue() {
        let err = ConfigValidationError::new(
            "qqbot",
            vec!["app_id is required".into(), "client_secret is required".into()],
        );
        assert_eq!(
            err.to_string(),
            "invalid configuration for channel 'qqbot': app_id is required; client_secret is required"
        );
    }

    #[test]
    fn test_auth_failure_detection() {
        let status = ApiError::Status {
            path: "/gateway".into(),
            status: 401,
            body: String::new(),
        };
        assert!(status.is_auth_failure());
        assert!(ApiError::from(AuthError::Exchange("down".into())).is_auth_failure());
        assert!(!ApiError::InvalidTarget("x".into()).is_auth_failure());
    }
}
