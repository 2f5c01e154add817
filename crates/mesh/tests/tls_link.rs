//! End-to-end tests against a local TLS peer.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, SupportedProtocolVersion};
use securemesh_core::Config;
use securemesh_mesh::{
    MeshError, MeshNode, NodeConfig, NodeEvent, NodeState, SecurityPolicy, TransportError,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Identity {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    pem: String,
}

fn identity() -> Identity {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    Identity {
        cert: cert.der().clone(),
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        pem: cert.pem(),
    }
}

fn acceptor(identity: &Identity, versions: &[&'static SupportedProtocolVersion]) -> TlsAcceptor {
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(versions)
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![identity.cert.clone()], identity.key.clone_key())
    .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Accept one connection and complete the server side of the handshake.
async fn spawn_peer(
    acceptor: TlsAcceptor,
) -> (String, JoinHandle<std::io::Result<TlsStream<TcpStream>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let peer = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await?;
        acceptor.accept(tcp).await
    });
    (addr, peer)
}

fn policy_trusting(identity: &Identity) -> SecurityPolicy {
    SecurityPolicy::builder()
        .trust_certificates(vec![identity.cert.clone()])
        .server_name("localhost")
        .build()
        .unwrap()
}

fn config_with(policy: SecurityPolicy) -> NodeConfig {
    let mut config = NodeConfig::new(policy);
    config.dial.dial_timeout = Duration::from_secs(2);
    config.read_deadline = Duration::from_millis(100);
    config
}

#[tokio::test]
async fn test_hello_reaches_peer_unmodified() {
    let identity = identity();
    let (addr, peer) = spawn_peer(acceptor(&identity, &[&rustls::version::TLS13])).await;

    let node = MeshNode::builder("node-alpha", addr)
        .config(config_with(policy_trusting(&identity)))
        .build()
        .unwrap();
    node.connect(&CancellationToken::new()).await.unwrap();
    assert_eq!(node.state(), NodeState::Connected);

    let params = node.negotiated().unwrap();
    assert_eq!(params.protocol_version, "TLSv1_3");

    node.broadcast(&b"hello"[..]).await.unwrap();

    let mut server = peer.await.unwrap().unwrap();
    let mut received = [0u8; 5];
    tokio::time::timeout(WAIT, server.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received, b"hello");

    node.close().await.unwrap();
    assert_eq!(node.state(), NodeState::Disconnected);
}

#[tokio::test]
async fn test_inbound_bytes_are_delivered() {
    let identity = identity();
    let (addr, peer) = spawn_peer(acceptor(&identity, &[&rustls::version::TLS13])).await;

    let (node, mut inbound) = MeshNode::builder("node-alpha", addr)
        .config(config_with(policy_trusting(&identity)))
        .build_with_inbound()
        .unwrap();
    node.connect(&CancellationToken::new()).await.unwrap();
    let connected_at = node.last_seen().unwrap();

    let mut server = peer.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    server.write_all(b"telemetry").await.unwrap();
    server.flush().await.unwrap();

    let mut collected = Vec::new();
    while collected.len() < 9 {
        let chunk = tokio::time::timeout(WAIT, inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.node_id, "node-alpha");
        collected.extend_from_slice(&chunk.payload);
    }
    assert_eq!(collected, b"telemetry");
    assert!(node.last_seen().unwrap() > connected_at);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_tls12_only_peer_is_rejected() {
    let identity = identity();
    let (addr, _peer) = spawn_peer(acceptor(&identity, &[&rustls::version::TLS12])).await;

    let node = MeshNode::builder("node-alpha", addr)
        .config(config_with(policy_trusting(&identity)))
        .build()
        .unwrap();
    let err = node.connect(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        err,
        MeshError::Transport(TransportError::HandshakeFailed { .. })
    ));
    assert_eq!(node.state(), NodeState::Disconnected);
}

#[tokio::test]
async fn test_untrusted_certificate_is_rejected() {
    let presented = identity();
    let trusted = identity();
    let (addr, _peer) = spawn_peer(acceptor(&presented, &[&rustls::version::TLS13])).await;

    let node = MeshNode::builder("node-alpha", addr)
        .config(config_with(policy_trusting(&trusted)))
        .build()
        .unwrap();
    let err = node.connect(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        err,
        MeshError::Transport(TransportError::CertInvalid { .. })
    ));
    assert_eq!(node.state(), NodeState::Disconnected);
}

#[tokio::test]
async fn test_refused_dial() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let identity = identity();
    let node = MeshNode::builder("node-alpha", addr)
        .config(config_with(policy_trusting(&identity)))
        .build()
        .unwrap();
    let err = node.connect(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        err,
        MeshError::Transport(TransportError::Refused { .. })
    ));
    assert_eq!(node.state(), NodeState::Disconnected);
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    // Accept the TCP connection but never answer the ClientHello.
    let _silent = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(tcp);
        std::io::Result::Ok(())
    });

    let identity = identity();
    let mut config = config_with(policy_trusting(&identity));
    config.dial.dial_timeout = Duration::from_millis(200);
    let node = MeshNode::builder("node-alpha", addr)
        .config(config)
        .build()
        .unwrap();

    let err = node.connect(&CancellationToken::new()).await.unwrap_err();
    match err {
        MeshError::Transport(TransportError::Timeout { timeout, .. }) => {
            assert_eq!(timeout, Duration::from_millis(200))
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(node.state(), NodeState::Disconnected);
}

#[tokio::test]
async fn test_peer_close_disconnects_node() {
    let identity = identity();
    let (addr, peer) = spawn_peer(acceptor(&identity, &[&rustls::version::TLS13])).await;

    let node = MeshNode::builder("node-alpha", addr)
        .config(config_with(policy_trusting(&identity)))
        .build()
        .unwrap();
    let mut events = node.subscribe();
    node.connect(&CancellationToken::new()).await.unwrap();

    let mut server = peer.await.unwrap().unwrap();
    server.shutdown().await.unwrap();
    drop(server);

    let mut changes = node.state_changes();
    tokio::time::timeout(WAIT, changes.wait_for(|s| *s == NodeState::Disconnected))
        .await
        .unwrap()
        .unwrap();

    let mut disconnects = 0;
    while let Ok(NodeEvent::StateChanged { to, .. }) = events.try_recv() {
        if to == NodeState::Disconnected {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);
    assert!(node.broadcast(&b"late"[..]).await.unwrap_err().is_not_connected());

    // Closing an already dropped link is a no-op.
    node.close().await.unwrap();
}

#[tokio::test]
async fn test_node_from_config_file() {
    let identity = identity();
    let (addr, peer) = spawn_peer(acceptor(&identity, &[&rustls::version::TLS13])).await;

    let mut ca = tempfile::NamedTempFile::new().unwrap();
    ca.write_all(identity.pem.as_bytes()).unwrap();

    let toml = format!(
        r#"
        [node]
        id = "node-bravo"
        address = "{addr}"

        [transport]
        dial_timeout_secs = 2
        read_deadline_secs = 1

        [security]
        ca_file = "{ca}"
        server_name = "localhost"
        "#,
        addr = addr,
        ca = ca.path().display(),
    );
    let file = Config::from_toml(&toml).unwrap();
    let config = NodeConfig::from_config(&file).unwrap();

    let node = MeshNode::builder(file.node.id.clone(), file.node.address.clone())
        .config(config)
        .build()
        .unwrap();
    node.connect(&CancellationToken::new()).await.unwrap();
    assert_eq!(node.id(), "node-bravo");

    let _server = peer.await.unwrap().unwrap();
    node.close().await.unwrap();
}
