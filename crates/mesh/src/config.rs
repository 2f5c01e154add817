//! Runtime configuration for a mesh node.

use std::time::Duration;

use securemesh_core::Config;

use crate::error::{MeshError, MeshResult};
use crate::inbound::{DEFAULT_READ_BUFFER, DEFAULT_READ_DEADLINE};
use crate::outbound::DEFAULT_OUTBOUND_CAPACITY;
use crate::security::SecurityPolicy;
use crate::transport::DialOptions;

/// Default capacity of the inbound chunk queue.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Validated settings for one [`MeshNode`](crate::MeshNode).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Dial timeout and keep-alive
    pub dial: DialOptions,
    /// Per-read deadline for cancellation polling
    pub read_deadline: Duration,
    /// Inbound read buffer size
    pub read_buffer_size: usize,
    /// Outbound queue capacity
    pub outbound_capacity: usize,
    /// Inbound chunk queue capacity
    pub inbound_capacity: usize,
    /// Allow Broadcast while Syncing
    pub broadcast_while_syncing: bool,
    /// Transport security policy
    pub security: SecurityPolicy,
}

impl NodeConfig {
    /// Defaults around the given policy.
    pub fn new(security: SecurityPolicy) -> Self {
        Self {
            dial: DialOptions::default(),
            read_deadline: DEFAULT_READ_DEADLINE,
            read_buffer_size: DEFAULT_READ_BUFFER,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            broadcast_while_syncing: false,
            security,
        }
    }

    /// Convert a loaded configuration file.
    pub fn from_config(config: &Config) -> MeshResult<Self> {
        let transport = &config.transport;
        let node_config = Self {
            dial: DialOptions {
                dial_timeout: Duration::from_secs(transport.dial_timeout_secs),
                keep_alive: Duration::from_secs(transport.keep_alive_secs),
            },
            read_deadline: Duration::from_secs(transport.read_deadline_secs),
            read_buffer_size: transport.read_buffer_size,
            outbound_capacity: transport.outbound_queue_capacity,
            inbound_capacity: transport.inbound_queue_capacity,
            broadcast_while_syncing: config.node.broadcast_while_syncing,
            security: SecurityPolicy::from_section(&config.security)?,
        };
        node_config.validate()?;
        Ok(node_config)
    }

    /// Reject zero timeouts and zero-sized buffers or queues.
    pub fn validate(&self) -> MeshResult<()> {
        let checks = [
            (self.dial.dial_timeout.is_zero(), "dial timeout"),
            (self.dial.keep_alive.is_zero(), "keep-alive interval"),
            (self.read_deadline.is_zero(), "read deadline"),
            (self.read_buffer_size == 0, "read buffer size"),
            (self.outbound_capacity == 0, "outbound queue capacity"),
            (self.inbound_capacity == 0, "inbound queue capacity"),
        ];

        match checks.iter().find(|(is_zero, _)| *is_zero) {
            Some((_, name)) => Err(MeshError::Config(format!("{} must be non-zero", name))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::TlsVersion;

    #[test]
    fn test_from_default_config() {
        let config = NodeConfig::from_config(&Config::default_config()).unwrap();
        assert_eq!(config.dial, DialOptions::default());
        assert_eq!(config.read_deadline, Duration::from_secs(5));
        assert_eq!(config.outbound_capacity, 1024);
        assert_eq!(config.security.min_version(), TlsVersion::Tls13);
        assert!(!config.broadcast_while_syncing);
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut file = Config::default_config();
        file.transport.read_deadline_secs = 0;
        let err = NodeConfig::from_config(&file).unwrap_err();
        assert!(err.to_string().contains("read deadline"));

        let mut file = Config::default_config();
        file.transport.outbound_queue_capacity = 0;
        assert!(NodeConfig::from_config(&file).is_err());
    }

    #[test]
    fn test_bad_security_section_rejected() {
        let mut file = Config::default_config();
        file.security.min_tls_version = "1.0".to_string();
        assert!(matches!(
            NodeConfig::from_config(&file),
            Err(MeshError::Config(_))
        ));
    }
}
