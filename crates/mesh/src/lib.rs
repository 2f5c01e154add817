//! SecureMesh Mesh - Secure Peer Links for the Mesh Layer
//!
//! Establishes and maintains a TLS 1.3 link to a single mesh peer and carries
//! opaque payloads in both directions.
//!
//! # Core Components
//!
//! - **Security Policy**: TLS version floor, key-exchange preference and trust anchors
//! - **Transport**: Timed TCP dial with keep-alive and the TLS handshake
//! - **State Machine**: Disconnected, Handshaking, Connected and Syncing with transition events
//! - **Inbound Processor**: Deadline-polled reads with liveness tracking
//! - **Outbound Dispatcher**: Single writer draining a bounded queue
//!
//! # Design Principles
//!
//! 1. **Fail-Visible**: Every lost link surfaces as a state transition with a reason
//! 2. **Single Teardown**: The first closer owns shutdown; later closers observe it
//! 3. **Disconnected by Default**: Nothing is retried behind the caller's back
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use securemesh_mesh::{MeshNode, NodeState};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let node = MeshNode::new("node-alpha", "peer.mesh.local:7443")?;
//! node.connect(&CancellationToken::new()).await?;
//! assert_eq!(node.state(), NodeState::Connected);
//! node.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod inbound;
pub mod node;
mod outbound;
pub mod security;
pub mod state;
pub mod transport;

/// Protocol version advertised by this implementation.
pub const PROTOCOL_VERSION: &str = "v2.4.1";

// Re-export main types
pub use config::{NodeConfig, DEFAULT_INBOUND_CAPACITY};
pub use error::{IoError, MeshError, MeshResult, StateError, TransportError};
pub use inbound::{DeadlineRead, InboundChunk, ReadOutcome, DEFAULT_READ_BUFFER, DEFAULT_READ_DEADLINE};
pub use node::{MeshNode, MeshNodeBuilder};
pub use outbound::DEFAULT_OUTBOUND_CAPACITY;
pub use security::{KxGroup, SecurityPolicy, SecurityPolicyBuilder, TlsVersion, DEFAULT_KX_PREFERENCE};
pub use state::{NodeEvent, NodeState, StateMachine, Transition};
pub use transport::{
    establish, ChannelReader, ChannelWriter, DialOptions, Establish, NegotiatedParams,
    SecureChannel, TlsEstablisher, DEFAULT_DIAL_TIMEOUT, DEFAULT_KEEP_ALIVE,
};
