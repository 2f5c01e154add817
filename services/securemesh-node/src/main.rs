//! SecureMesh node (`securemesh-node`)
//!
//! Connects to one mesh peer, logs what arrives and forwards each line read
//! from stdin as a payload. Ctrl+C closes the link.

use anyhow::Context;
use clap::Parser;
use securemesh_core::{logging, Config};
use securemesh_mesh::{MeshNode, NodeConfig, NodeEvent, NodeState, PROTOCOL_VERSION};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "securemesh-node", version, about = "SecureMesh peer node")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, required_unless_present = "version_json")]
    config: Option<PathBuf>,

    /// Print version information as JSON and exit
    #[arg(long)]
    version_json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Disable forwarding stdin lines to the peer
    #[arg(long)]
    no_stdin: bool,
}

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    protocol_version: &'static str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.version_json {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    if args.json_logs {
        logging::init_json(logging::DEFAULT_FILTER);
    } else {
        logging::init(logging::DEFAULT_FILTER);
    }

    let config_path = args
        .config
        .context("missing required --config <path> argument")?;
    let file = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let node_config = NodeConfig::from_config(&file)?;

    let (node, mut inbound) = MeshNode::builder(file.node.id.clone(), file.node.address.clone())
        .config(node_config)
        .build_with_inbound()?;

    info!(
        node_id = %node.id(),
        peer = %node.address(),
        version = env!("CARGO_PKG_VERSION"),
        "securemesh-node starting"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let mut events = node.subscribe();
    tokio::spawn(async move {
        while let Ok(NodeEvent::StateChanged { from, to, reason, .. }) = events.recv().await {
            if to == NodeState::Disconnected && from.has_channel() {
                warn!(%from, reason = reason.as_deref().unwrap_or(""), "Peer link lost");
            }
        }
    });

    tokio::spawn(async move {
        while let Some(chunk) = inbound.recv().await {
            info!(
                node_id = %chunk.node_id,
                bytes = chunk.payload.len(),
                payload = %String::from_utf8_lossy(&chunk.payload),
                "Inbound chunk"
            );
        }
    });

    if let Err(e) = node.connect(&shutdown).await {
        error!(error = %e, "Failed to connect");
        return Err(e.into());
    }

    run(&node, &shutdown, !args.no_stdin).await;

    node.close().await?;
    info!("Node stopped");
    Ok(())
}

/// Forward stdin until shutdown, stdin EOF or loss of the link.
async fn run(node: &MeshNode, shutdown: &CancellationToken, forward_stdin: bool) {
    let mut changes = node.state_changes();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = forward_stdin;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = changes.wait_for(|s| !s.has_channel()) => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let mut payload = line.into_bytes();
                    payload.push(b'\n');
                    if let Err(e) = node.broadcast(payload).await {
                        warn!(error = %e, "Broadcast rejected");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
