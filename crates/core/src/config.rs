//! Configuration management for SecureMesh.
//!
//! The file format is TOML. Every section except `[node]` may be omitted, in
//! which case the defaults below apply.
//!
//! ```toml
//! [node]
//! id = "node-alpha"
//! address = "10.0.0.7:7443"
//!
//! [transport]
//! dial_timeout_secs = 30
//!
//! [security]
//! min_tls_version = "1.3"
//! kx_groups = ["secp256r1", "x25519"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::CoreResult;

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Identity and peer endpoint
    pub node: NodeSection,
    /// Transport timing and buffering
    #[serde(default)]
    pub transport: TransportSection,
    /// Transport security policy
    #[serde(default)]
    pub security: SecuritySection,
}

/// `[node]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSection {
    /// Stable node identifier
    pub id: String,
    /// Peer endpoint (`host:port`)
    pub address: String,
    /// Permit Broadcast while the node is in the Syncing sub-state
    #[serde(default)]
    pub broadcast_while_syncing: bool,
}

/// `[transport]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Hard limit on TCP dial plus TLS handshake
    pub dial_timeout_secs: u64,
    /// TCP keep-alive probe interval
    pub keep_alive_secs: u64,
    /// Per-read deadline used to poll for cancellation
    pub read_deadline_secs: u64,
    /// Capacity of the outbound payload queue
    pub outbound_queue_capacity: usize,
    /// Capacity of the inbound chunk queue handed to the decoder
    pub inbound_queue_capacity: usize,
    /// Size of the inbound read buffer in bytes
    pub read_buffer_size: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 30,
            keep_alive_secs: 15,
            read_deadline_secs: 5,
            outbound_queue_capacity: 1024,
            inbound_queue_capacity: 256,
            read_buffer_size: 4096,
        }
    }
}

/// `[security]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Minimum TLS version, `"1.2"` or `"1.3"`
    pub min_tls_version: String,
    /// Key-exchange groups in preference order
    pub kx_groups: Vec<String>,
    /// PEM bundle of trusted CA certificates; Mozilla roots when unset
    pub ca_file: Option<PathBuf>,
    /// TLS server name override; the endpoint host when unset
    pub server_name: Option<String>,
    /// ALPN protocols offered during the handshake
    pub alpn: Vec<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            min_tls_version: "1.3".to_string(),
            kx_groups: vec!["secp256r1".to_string(), "x25519".to_string()],
            ca_file: None,
            server_name: None,
            alpn: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> CoreResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Configuration with all defaults and a placeholder peer.
    pub fn default_config() -> Self {
        Self {
            node: NodeSection {
                id: "node-001".to_string(),
                address: "127.0.0.1:7443".to_string(),
                broadcast_while_syncing: false,
            },
            transport: TransportSection::default(),
            security: SecuritySection::default(),
        }
    }
}
