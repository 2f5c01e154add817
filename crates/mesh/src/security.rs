//! Transport security policy for mesh links.
//!
//! A [`SecurityPolicy`] pins the minimum TLS version and an ordered
//! key-exchange preference list, selects the trust anchors used to verify
//! peers, and compiles all of it into a `rustls` client configuration once,
//! at construction. Peers that cannot meet the floor fail the handshake;
//! there is no fallback to weaker parameters.

use rustls::crypto::{ring, CryptoProvider, SupportedKxGroup};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, ProtocolVersion, RootCertStore, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use securemesh_core::SecuritySection;

use crate::error::{MeshError, MeshResult, TransportError};

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];
static TLS13_AND_TLS12: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];

/// Lowest TLS version a link may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2 (1.3 still preferred)
    Tls12,
    /// TLS 1.3 only
    Tls13,
}

impl TlsVersion {
    fn enabled_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12 => TLS13_AND_TLS12,
            TlsVersion::Tls13 => TLS13_ONLY,
        }
    }

    /// Whether a negotiated protocol version satisfies this floor.
    pub fn admits(self, negotiated: ProtocolVersion) -> bool {
        match negotiated {
            ProtocolVersion::TLSv1_3 => true,
            ProtocolVersion::TLSv1_2 => self == TlsVersion::Tls12,
            _ => false,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1.2" | "tls1.2" | "tlsv1.2" => Ok(TlsVersion::Tls12),
            "1.3" | "tls1.3" | "tlsv1.3" => Ok(TlsVersion::Tls13),
            other => Err(MeshError::Config(format!(
                "unsupported TLS version floor '{}' (expected 1.2 or 1.3)",
                other
            ))),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => f.write_str("TLS1.2"),
            TlsVersion::Tls13 => f.write_str("TLS1.3"),
        }
    }
}

/// Key-exchange group accepted during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KxGroup {
    /// NIST P-256
    Secp256r1,
    /// NIST P-384
    Secp384r1,
    /// Curve25519
    X25519,
}

impl KxGroup {
    fn as_rustls(self) -> &'static dyn SupportedKxGroup {
        match self {
            KxGroup::Secp256r1 => ring::kx_group::SECP256R1,
            KxGroup::Secp384r1 => ring::kx_group::SECP384R1,
            KxGroup::X25519 => ring::kx_group::X25519,
        }
    }
}

impl FromStr for KxGroup {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "secp256r1" | "p256" | "p-256" => Ok(KxGroup::Secp256r1),
            "secp384r1" | "p384" | "p-384" => Ok(KxGroup::Secp384r1),
            "x25519" => Ok(KxGroup::X25519),
            other => Err(MeshError::Config(format!(
                "unsupported key-exchange group '{}'",
                other
            ))),
        }
    }
}

/// Default preference: P-256 before X25519.
pub const DEFAULT_KX_PREFERENCE: [KxGroup; 2] = [KxGroup::Secp256r1, KxGroup::X25519];

#[derive(Debug, Clone)]
enum TrustAnchors {
    WebPki,
    Certificates(Vec<CertificateDer<'static>>),
    PemFile(PathBuf),
}

/// Compiled transport security policy.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    min_version: TlsVersion,
    kx_groups: Vec<KxGroup>,
    server_name: Option<String>,
    tls: Arc<ClientConfig>,
}

impl SecurityPolicy {
    /// Start from the strict defaults: TLS 1.3, P-256 then X25519, Mozilla roots.
    pub fn builder() -> SecurityPolicyBuilder {
        SecurityPolicyBuilder::default()
    }

    /// Build a policy from the `[security]` configuration section.
    pub fn from_section(section: &SecuritySection) -> MeshResult<Self> {
        let kx_groups = section
            .kx_groups
            .iter()
            .map(|name| name.parse())
            .collect::<MeshResult<Vec<KxGroup>>>()?;

        let mut builder = Self::builder()
            .min_version(section.min_tls_version.parse()?)
            .kx_groups(kx_groups)
            .alpn(section.alpn.iter().cloned());
        if let Some(path) = &section.ca_file {
            builder = builder.trust_pem_file(path.clone());
        }
        if let Some(name) = &section.server_name {
            builder = builder.server_name(name.clone());
        }
        builder.build()
    }

    /// Minimum negotiated TLS version
    pub fn min_version(&self) -> TlsVersion {
        self.min_version
    }

    /// Key-exchange groups in preference order
    pub fn kx_groups(&self) -> &[KxGroup] {
        &self.kx_groups
    }

    /// Compiled client configuration
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls)
    }

    /// TLS server name for `endpoint`: the override if set, otherwise the
    /// endpoint host with any port and IPv6 brackets removed.
    pub fn server_name_for(&self, endpoint: &str) -> Result<ServerName<'static>, TransportError> {
        let host = match &self.server_name {
            Some(name) => name.as_str(),
            None => endpoint_host(endpoint),
        };

        ServerName::try_from(host.to_string()).map_err(|e| TransportError::HandshakeFailed {
            endpoint: endpoint.to_string(),
            reason: format!("invalid TLS server name '{}': {}", host, e),
        })
    }
}

fn endpoint_host(endpoint: &str) -> &str {
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    match endpoint.rsplit_once(':') {
        // A second colon means a bare IPv6 address without a port.
        Some((host, _)) if !host.contains(':') => host,
        _ => endpoint,
    }
}

/// Builder for [`SecurityPolicy`].
#[derive(Debug, Clone)]
pub struct SecurityPolicyBuilder {
    min_version: TlsVersion,
    kx_groups: Vec<KxGroup>,
    anchors: TrustAnchors,
    server_name: Option<String>,
    alpn: Vec<Vec<u8>>,
}

impl Default for SecurityPolicyBuilder {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::Tls13,
            kx_groups: DEFAULT_KX_PREFERENCE.to_vec(),
            anchors: TrustAnchors::WebPki,
            server_name: None,
            alpn: Vec::new(),
        }
    }
}

impl SecurityPolicyBuilder {
    /// Lowest acceptable TLS version.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Key-exchange groups, most preferred first.
    pub fn kx_groups(mut self, groups: impl IntoIterator<Item = KxGroup>) -> Self {
        self.kx_groups = groups.into_iter().collect();
        self
    }

    /// Trust exactly these DER certificates instead of the Mozilla roots.
    pub fn trust_certificates(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.anchors = TrustAnchors::Certificates(certs);
        self
    }

    /// Trust the certificates in a PEM bundle instead of the Mozilla roots.
    pub fn trust_pem_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.anchors = TrustAnchors::PemFile(path.into());
        self
    }

    /// Verify peers against this name rather than the endpoint host.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// ALPN protocols to offer.
    pub fn alpn<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn = protocols
            .into_iter()
            .map(|p| p.into().into_bytes())
            .collect();
        self
    }

    /// Validate and compile the policy.
    pub fn build(self) -> MeshResult<SecurityPolicy> {
        let mut kx_groups: Vec<KxGroup> = Vec::with_capacity(self.kx_groups.len());
        for group in self.kx_groups {
            if !kx_groups.contains(&group) {
                kx_groups.push(group);
            }
        }
        if kx_groups.is_empty() {
            return Err(MeshError::Config(
                "security policy needs at least one key-exchange group".to_string(),
            ));
        }

        let roots = load_roots(&self.anchors)?;

        let mut provider: CryptoProvider = ring::default_provider();
        provider.kx_groups = kx_groups.iter().map(|g| g.as_rustls()).collect();

        let mut tls = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(self.min_version.enabled_versions())
            .map_err(|e| MeshError::Config(format!("TLS configuration rejected: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls.alpn_protocols = self.alpn;

        Ok(SecurityPolicy {
            min_version: self.min_version,
            kx_groups,
            server_name: self.server_name,
            tls: Arc::new(tls),
        })
    }
}

fn load_roots(anchors: &TrustAnchors) -> MeshResult<RootCertStore> {
    let mut roots = RootCertStore::empty();

    match anchors {
        TrustAnchors::WebPki => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        TrustAnchors::Certificates(certs) => {
            for cert in certs {
                roots
                    .add(cert.clone())
                    .map_err(|e| MeshError::Config(format!("invalid trust anchor: {}", e)))?;
            }
        }
        TrustAnchors::PemFile(path) => {
            let file = File::open(path).map_err(|e| {
                MeshError::Config(format!("cannot open CA file {}: {}", path.display(), e))
            })?;
            for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
                let cert = cert.map_err(|e| {
                    MeshError::Config(format!("malformed CA file {}: {}", path.display(), e))
                })?;
                roots
                    .add(cert)
                    .map_err(|e| MeshError::Config(format!("invalid trust anchor: {}", e)))?;
            }
        }
    }

    if roots.is_empty() {
        return Err(MeshError::Config("no trust anchors configured".to_string()));
    }
    Ok(roots)
}
