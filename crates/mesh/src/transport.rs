//! Secure transport establishment.
//!
//! [`establish`] dials a TCP endpoint, arms keep-alive probing, and runs the
//! TLS handshake described by a [`SecurityPolicy`], all under one hard dial
//! timeout. The result is either a [`SecureChannel`] or a classified
//! [`TransportError`]; a failed attempt leaves nothing behind and is never
//! retried here.

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::TransportError;
use crate::security::SecurityPolicy;

/// Default limit on dial plus handshake.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TCP keep-alive probe interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Read half of an established channel.
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an established channel.
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport-layer timing for one dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialOptions {
    /// Hard limit covering TCP connect and TLS handshake
    pub dial_timeout: Duration,
    /// TCP keep-alive idle time before probing
    pub keep_alive: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

/// Parameters agreed during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedParams {
    /// Endpoint the channel was dialed to
    pub endpoint: String,
    /// Negotiated protocol version, e.g. `TLSv1_3`
    pub protocol_version: String,
    /// Negotiated cipher suite
    pub cipher_suite: String,
    /// ALPN protocol selected by the peer, if any
    pub alpn: Option<String>,
}

/// An established encrypted duplex stream.
///
/// Owned by exactly one node; [`into_split`](Self::into_split) hands the read
/// half to the inbound processor and the write half to the dispatcher.
pub struct SecureChannel {
    reader: ChannelReader,
    writer: ChannelWriter,
    params: NegotiatedParams,
}

impl SecureChannel {
    /// Wrap a completed client TLS session.
    pub fn from_tls(stream: TlsStream<TcpStream>, endpoint: &str) -> Self {
        let (_, session) = stream.get_ref();
        let params = NegotiatedParams {
            endpoint: endpoint.to_string(),
            protocol_version: session
                .protocol_version()
                .map(|v| format!("{:?}", v))
                .unwrap_or_default(),
            cipher_suite: session
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite()))
                .unwrap_or_default(),
            alpn: session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        };

        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(Box::new(reader), Box::new(writer), params)
    }

    /// Assemble a channel from already-secured halves.
    pub fn from_parts(reader: ChannelReader, writer: ChannelWriter, params: NegotiatedParams) -> Self {
        Self {
            reader,
            writer,
            params,
        }
    }

    /// Negotiated parameters
    pub fn params(&self) -> &NegotiatedParams {
        &self.params
    }

    /// Split into read half, write half and parameters.
    pub fn into_split(self) -> (ChannelReader, ChannelWriter, NegotiatedParams) {
        (self.reader, self.writer, self.params)
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Produces secure channels for a node.
#[async_trait]
pub trait Establish: Send + Sync {
    /// Dial `endpoint` and complete the handshake under `policy`.
    async fn establish(
        &self,
        endpoint: &str,
        policy: &SecurityPolicy,
        options: DialOptions,
    ) -> Result<SecureChannel, TransportError>;
}

/// TCP + TLS establisher backed by `tokio-rustls`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsEstablisher;

#[async_trait]
impl Establish for TlsEstablisher {
    async fn establish(
        &self,
        endpoint: &str,
        policy: &SecurityPolicy,
        options: DialOptions,
    ) -> Result<SecureChannel, TransportError> {
        establish(endpoint, policy, options).await
    }
}

/// Dial `endpoint` and run the TLS handshake under `policy`.
pub async fn establish(
    endpoint: &str,
    policy: &SecurityPolicy,
    options: DialOptions,
) -> Result<SecureChannel, TransportError> {
    let server_name = policy.server_name_for(endpoint)?;
    let connector = TlsConnector::from(policy.client_config());

    let attempt = async {
        let tcp = TcpStream::connect(endpoint)
            .await
            .map_err(|e| classify_dial(endpoint, options.dial_timeout, e))?;
        arm_keep_alive(&tcp, options.keep_alive).map_err(|e| socket_setup_error(endpoint, e))?;
        debug!(endpoint, "TCP connected, starting TLS handshake");

        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| classify_handshake(endpoint, options.dial_timeout, e))
    };

    let stream = tokio::time::timeout(options.dial_timeout, attempt)
        .await
        .map_err(|_| TransportError::Timeout {
            endpoint: endpoint.to_string(),
            timeout: options.dial_timeout,
        })??;

    if let Some(version) = stream.get_ref().1.protocol_version() {
        if !policy.min_version().admits(version) {
            return Err(TransportError::HandshakeFailed {
                endpoint: endpoint.to_string(),
                reason: format!(
                    "negotiated {:?} below floor {}",
                    version,
                    policy.min_version()
                ),
            });
        }
    }

    Ok(SecureChannel::from_tls(stream, endpoint))
}

/// Idle time and probe interval are both set to `interval`.
fn arm_keep_alive(stream: &TcpStream, interval: Duration) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_tcp_keepalive(&keep_alive_params(interval))
}

fn keep_alive_params(interval: Duration) -> TcpKeepalive {
    let keep_alive = TcpKeepalive::new().with_time(interval);
    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "fuchsia",
        target_os = "illumos",
        target_os = "ios",
        target_os = "linux",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "tvos",
        target_os = "watchos",
        target_os = "windows",
    ))]
    let keep_alive = keep_alive.with_interval(interval);
    keep_alive
}

fn socket_setup_error(endpoint: &str, err: io::Error) -> TransportError {
    TransportError::HandshakeFailed {
        endpoint: endpoint.to_string(),
        reason: format!("socket setup failed: {}", err),
    }
}

fn classify_dial(endpoint: &str, timeout: Duration, err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::TimedOut => TransportError::Timeout {
            endpoint: endpoint.to_string(),
            timeout,
        },
        _ => TransportError::Refused {
            endpoint: endpoint.to_string(),
            source: err,
        },
    }
}

fn classify_handshake(endpoint: &str, timeout: Duration, err: io::Error) -> TransportError {
    let endpoint = endpoint.to_string();

    if let Some(tls) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return match tls {
            rustls::Error::InvalidCertificate(reason) => TransportError::CertInvalid {
                endpoint,
                reason: format!("{:?}", reason),
            },
            other => TransportError::HandshakeFailed {
                endpoint,
                reason: other.to_string(),
            },
        };
    }

    match err.kind() {
        io::ErrorKind::TimedOut => TransportError::Timeout { endpoint, timeout },
        _ => TransportError::HandshakeFailed {
            endpoint,
            reason: err.to_string(),
        },
    }
}
