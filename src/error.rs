//! Error types for the tunnel broker.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

/// Errors produced while registering sockets or forwarding requests.
///
/// `Clone` so that one failure can be delivered to a pending caller through
/// its completion channel and also returned to whoever detected it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Registering one more socket would exceed the expected socket count.
    #[error("too many sockets: {expected} tunnel sockets allowed")]
    Capacity {
        /// The configured number of tunnel sockets.
        expected: usize,
    },

    /// A socket with the same id is already registered.
    #[error("tunnel socket {0} is already registered")]
    DuplicateSocket(String),

    /// A message did not match the wire protocol, or arrived on a socket
    /// that has no request assigned to it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The socket carrying the request went away before a reply arrived.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// No reply (or no free socket) within the forward deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The broker is shutting down and no longer hands out sockets.
    #[error("tunnel broker is shutting down")]
    Shutdown,

    /// The inbound request body exceeded the configured limit.
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

impl TunnelError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Capacity { .. } => "capacity_exceeded",
            Self::DuplicateSocket(_) => "duplicate_socket",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::PeerUnavailable(_) => "peer_unavailable",
            Self::Timeout(_) => "tunnel_timeout",
            Self::Shutdown => "shutting_down",
            Self::BodyTooLarge(_) => "body_too_large",
        }
    }

    /// HTTP status returned to the forwarding caller for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ProtocolViolation(_) | Self::PeerUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Capacity { .. } | Self::DuplicateSocket(_) | Self::Shutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Whether the caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PeerUnavailable(_) | Self::Timeout(_) | Self::Shutdown
        )
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;

    use super::TunnelError;

    #[test]
    fn tunnel_failures_map_to_gateway_statuses() {
        assert_eq!(
            TunnelError::PeerUnavailable("closed".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TunnelError::ProtocolViolation("bad json".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TunnelError::Timeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            TunnelError::Shutdown.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn capacity_message_names_expected_count() {
        let err = TunnelError::Capacity { expected: 3 };
        assert_eq!(err.to_string(), "too many sockets: 3 tunnel sockets allowed");
        assert_eq!(err.code(), "capacity_exceeded");
        assert!(!err.is_retryable());
    }
}
