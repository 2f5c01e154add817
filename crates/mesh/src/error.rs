//! Error types for SecureMesh link operations.
//!
//! Transport and state errors are returned synchronously from
//! [`MeshNode`](crate::MeshNode) calls. I/O errors raised inside the
//! per-connection tasks have no caller; they are converted into a transition
//! to `Disconnected` and reported through [`NodeEvent`](crate::NodeEvent).

use std::time::Duration;
use thiserror::Error;

use crate::state::NodeState;

/// Classified failure of a dial or TLS handshake.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dial plus handshake did not finish inside the dial timeout
    #[error("Dial to {endpoint} timed out after {timeout:?}")]
    Timeout {
        /// Endpoint that was dialed
        endpoint: String,
        /// Configured dial timeout
        timeout: Duration,
    },

    /// Peer refused the connection or could not be reached
    #[error("Connection to {endpoint} refused: {source}")]
    Refused {
        /// Endpoint that was dialed
        endpoint: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// TLS negotiation failed (version floor, key exchange, alerts)
    #[error("TLS handshake with {endpoint} failed: {reason}")]
    HandshakeFailed {
        /// Endpoint that was dialed
        endpoint: String,
        /// Failure detail
        reason: String,
    },

    /// Peer certificate did not verify against the trust anchors
    #[error("Certificate presented by {endpoint} is invalid: {reason}")]
    CertInvalid {
        /// Endpoint that was dialed
        endpoint: String,
        /// Verification failure detail
        reason: String,
    },
}

/// Operation not legal in the node's current lifecycle state.
#[derive(Debug, Error)]
pub enum StateError {
    /// A Connect is already in flight or the link is up
    #[error("Node {node_id} is already connecting or connected (state: {state})")]
    AlreadyConnecting {
        /// Node identifier
        node_id: String,
        /// State observed when the call was rejected
        state: NodeState,
    },

    /// Broadcast requires an established link
    #[error("Node {node_id} is not connected (state: {state})")]
    NotConnected {
        /// Node identifier
        node_id: String,
        /// State observed when the call was rejected
        state: NodeState,
    },

    /// Close() ran while this Connect was still handshaking
    #[error("Node {node_id} was closed while the handshake was in flight")]
    AlreadyClosed {
        /// Node identifier
        node_id: String,
    },

    /// External sync trigger fired in a state that does not allow it
    #[error("Node {node_id} cannot {operation} from state {state}")]
    InvalidTransition {
        /// Node identifier
        node_id: String,
        /// State observed when the call was rejected
        state: NodeState,
        /// Requested operation
        operation: &'static str,
    },
}

/// Fatal I/O on an established channel.
#[derive(Debug, Error)]
pub enum IoError {
    /// Inbound read failed
    #[error("Read from {node_id} failed: {source}")]
    Read {
        /// Node identifier
        node_id: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Outbound write failed
    #[error("Write to {node_id} failed: {source}")]
    Write {
        /// Node identifier
        node_id: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur in mesh link operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Dial or handshake failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Lifecycle violation
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Channel I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Shutdown signal fired before the handshake completed
    #[error("Connect for {node_id} cancelled by shutdown signal")]
    Cancelled {
        /// Node identifier
        node_id: String,
    },

    /// Invalid configuration or security policy
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    /// True for the typed "not connected" rejection from Broadcast.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, MeshError::State(StateError::NotConnected { .. }))
    }

    /// True when a concurrent Connect was rejected.
    pub fn is_already_connecting(&self) -> bool {
        matches!(self, MeshError::State(StateError::AlreadyConnecting { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = MeshError::from(StateError::NotConnected {
            node_id: "node-1".to_string(),
            state: NodeState::Handshaking,
        });
        assert_eq!(
            err.to_string(),
            "State error: Node node-1 is not connected (state: Handshaking)"
        );
        assert!(err.is_not_connected());
        assert!(!err.is_already_connecting());
    }

    #[test]
    fn test_refused_keeps_source() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = TransportError::Refused {
            endpoint: "127.0.0.1:1".to_string(),
            source: io,
        };
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().to_lowercase().contains("refused"));
    }
}
