//! Mesh node façade.
//!
//! One [`MeshNode`] per peer link. It owns the lifecycle state machine, the
//! secure channel for the current connection epoch, and the two tasks bound
//! to that channel (inbound processor and outbound dispatcher).
//!
//! # Shutdown discipline
//!
//! Every way a connection can end (Close, fatal read or write error, peer
//! EOF, shutdown token) converges on [`NodeCore::teardown`]. Whoever removes
//! the active link from the guard owns teardown; every later caller finds
//! nothing to remove and returns. Teardown cancels the connection token,
//! joins the tasks it does not run on, and only then flips the state to
//! `Disconnected`.

use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::error::{IoError, MeshError, MeshResult, StateError};
use crate::inbound::{InboundChunk, InboundProcessor};
use crate::outbound::{Dispatcher, OutboundQueue};
use crate::security::SecurityPolicy;
use crate::state::{NodeEvent, NodeState, StateMachine, Transition};
use crate::transport::{Establish, NegotiatedParams, TlsEstablisher};
use crate::PROTOCOL_VERSION;

/// Per-connection task that may initiate teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskRole {
    Inbound,
    Dispatcher,
}

/// Why an established link went away.
#[derive(Debug)]
pub(crate) enum LinkLoss {
    Cancelled,
    PeerClosed,
    Io(IoError),
}

impl fmt::Display for LinkLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkLoss::Cancelled => f.write_str("connection cancelled"),
            LinkLoss::PeerClosed => f.write_str("peer closed the channel"),
            LinkLoss::Io(err) => write!(f, "{}", err),
        }
    }
}

struct ActiveLink {
    token: CancellationToken,
    outbound: OutboundQueue,
    params: NegotiatedParams,
    inbound: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

struct Guarded {
    machine: StateMachine,
    /// Bumped by every Connect and by Close during a handshake; tasks and
    /// in-flight handshakes from an older epoch can no longer mutate the node.
    epoch: u64,
    pending: Option<CancellationToken>,
    active: Option<ActiveLink>,
}

/// State shared between the façade and the per-connection tasks.
pub(crate) struct NodeCore {
    id: String,
    address: String,
    config: NodeConfig,
    establisher: Arc<dyn Establish>,
    sink: Option<mpsc::Sender<InboundChunk>>,
    guarded: RwLock<Guarded>,
    state_rx: watch::Receiver<NodeState>,
}

impl NodeCore {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn read(&self) -> RwLockReadGuard<'_, Guarded> {
        self.guarded.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Guarded> {
        self.guarded.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp liveness for the connection identified by `epoch`.
    pub(crate) fn record_activity(&self, epoch: u64, at: Instant) {
        let mut guarded = self.write();
        if guarded.epoch == epoch && guarded.active.is_some() {
            guarded.machine.record_activity(at);
        }
    }

    /// Fatal-path entry for the per-connection tasks.
    pub(crate) async fn terminate(&self, epoch: u64, role: TaskRole, loss: LinkLoss) {
        let link = {
            let mut guarded = self.write();
            if guarded.epoch != epoch {
                return;
            }
            match guarded.active.take() {
                Some(link) => link,
                None => return,
            }
        };

        self.teardown(epoch, link, Some(role), Transition::ChannelLost, loss.to_string())
            .await;
    }

    async fn teardown(
        &self,
        epoch: u64,
        link: ActiveLink,
        caller: Option<TaskRole>,
        transition: Transition,
        reason: String,
    ) {
        let ActiveLink {
            token,
            outbound,
            inbound,
            dispatcher,
            ..
        } = link;

        token.cancel();
        drop(outbound);

        if caller != Some(TaskRole::Inbound) {
            if let Err(e) = inbound.await {
                warn!(node_id = %self.id, error = %e, "inbound task ended abnormally");
            }
        }
        if caller != Some(TaskRole::Dispatcher) {
            if let Err(e) = dispatcher.await {
                warn!(node_id = %self.id, error = %e, "dispatcher task ended abnormally");
            }
        }

        let mut guarded = self.write();
        if guarded.epoch == epoch {
            let _ = guarded.machine.apply(transition, Some(reason));
        }
    }
}

/// A secure link to one mesh peer.
///
/// ```rust,no_run
/// use securemesh_mesh::MeshNode;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let shutdown = CancellationToken::new();
/// let (node, mut inbound) = MeshNode::builder("node-alpha", "peer.mesh.local:7443")
///     .build_with_inbound()?;
///
/// node.connect(&shutdown).await?;
/// node.broadcast(&b"hello"[..]).await?;
/// if let Some(chunk) = inbound.recv().await {
///     println!("{} bytes from {}", chunk.payload.len(), chunk.node_id);
/// }
/// node.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct MeshNode {
    core: Arc<NodeCore>,
}

impl MeshNode {
    /// Start building a node with default configuration.
    pub fn builder(id: impl Into<String>, address: impl Into<String>) -> MeshNodeBuilder {
        MeshNodeBuilder {
            id: id.into(),
            address: address.into(),
            config: None,
            establisher: None,
            sink: None,
        }
    }

    /// Node with strict defaults, the TLS establisher and no decoder.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> MeshResult<Self> {
        Self::builder(id, address).build()
    }

    /// Stable node identifier
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Peer endpoint
    pub fn address(&self) -> &str {
        &self.core.address
    }

    /// Active configuration
    pub fn config(&self) -> &NodeConfig {
        &self.core.config
    }

    /// Current lifecycle state. Never waits on the node lock.
    pub fn state(&self) -> NodeState {
        *self.core.state_rx.borrow()
    }

    /// Receiver that tracks the lifecycle state.
    pub fn state_changes(&self) -> watch::Receiver<NodeState> {
        self.core.state_rx.clone()
    }

    /// Subscribe to lifecycle transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.core.read().machine.subscribe()
    }

    /// Last observed inbound activity.
    pub fn last_seen(&self) -> Option<Instant> {
        self.core.read().machine.last_seen()
    }

    /// Handshake parameters of the live channel.
    pub fn negotiated(&self) -> Option<NegotiatedParams> {
        self.core
            .read()
            .active
            .as_ref()
            .map(|link| link.params.clone())
    }

    /// Dial the peer and bring the link up.
    ///
    /// The connection's cancellation token is a child of `shutdown`;
    /// cancelling `shutdown` aborts a handshake in flight or tears down the
    /// established link.
    pub async fn connect(&self, shutdown: &CancellationToken) -> MeshResult<()> {
        let core = &self.core;

        let (epoch, attempt) = {
            let mut guarded = core.write();
            let state = guarded.machine.state();
            if state != NodeState::Disconnected {
                return Err(StateError::AlreadyConnecting {
                    node_id: core.id.clone(),
                    state,
                }
                .into());
            }

            guarded.epoch += 1;
            let attempt = shutdown.child_token();
            guarded.pending = Some(attempt.clone());
            let _ = guarded.machine.apply(Transition::Connect, None);
            (guarded.epoch, attempt)
        };

        info!(
            node_id = %core.id,
            address = %core.address,
            protocol = PROTOCOL_VERSION,
            "Initiating secure handshake"
        );

        let outcome = tokio::select! {
            biased;
            _ = attempt.cancelled() => None,
            result = core.establisher.establish(&core.address, &core.config.security, core.config.dial) => Some(result),
        };

        let mut guarded = core.write();
        if guarded.epoch != epoch || guarded.machine.state() != NodeState::Handshaking {
            return Err(StateError::AlreadyClosed {
                node_id: core.id.clone(),
            }
            .into());
        }
        guarded.pending = None;

        let channel = match outcome {
            Some(Ok(channel)) if !attempt.is_cancelled() => channel,
            Some(Err(err)) => {
                let _ = guarded
                    .machine
                    .apply(Transition::HandshakeFailed, Some(err.to_string()));
                return Err(err.into());
            }
            _ => {
                let _ = guarded
                    .machine
                    .apply(Transition::HandshakeFailed, Some("shutdown requested".to_string()));
                return Err(MeshError::Cancelled {
                    node_id: core.id.clone(),
                });
            }
        };

        let (reader, writer, params) = channel.into_split();
        let (outbound, queue) = OutboundQueue::bounded(core.config.outbound_capacity);

        let inbound = tokio::spawn(
            InboundProcessor {
                core: Arc::clone(core),
                epoch,
                reader,
                token: attempt.clone(),
                read_deadline: core.config.read_deadline,
                buffer_size: core.config.read_buffer_size,
                sink: core.sink.clone(),
            }
            .run(),
        );
        let dispatcher = tokio::spawn(
            Dispatcher {
                core: Arc::clone(core),
                epoch,
                writer,
                queue,
                token: attempt.clone(),
            }
            .run(),
        );

        info!(
            node_id = %core.id,
            version = %params.protocol_version,
            cipher = %params.cipher_suite,
            "Secure channel established"
        );

        guarded.active = Some(ActiveLink {
            token: attempt,
            outbound,
            params,
            inbound,
            dispatcher,
        });
        let _ = guarded.machine.apply(Transition::Established, None);

        Ok(())
    }

    /// Queue `payload` for the peer. Fails with `NotConnected` unless the
    /// link is up; nothing is queued or written in that case.
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> MeshResult<()> {
        let outbound = {
            let guarded = self.core.read();
            let state = guarded.machine.state();
            let permitted = match state {
                NodeState::Connected => true,
                NodeState::Syncing => self.core.config.broadcast_while_syncing,
                _ => false,
            };

            match (&guarded.active, permitted) {
                (Some(link), true) => link.outbound.clone(),
                _ => return Err(self.not_connected(state)),
            }
        };

        outbound
            .enqueue(payload.into())
            .await
            .map_err(|_| self.not_connected(self.state()))
    }

    /// Tear the link down. Idempotent; returns once the node is
    /// `Disconnected` and the connection's tasks have exited.
    pub async fn close(&self) -> MeshResult<()> {
        let (epoch, link) = {
            let mut guarded = self.core.write();
            match guarded.machine.state() {
                NodeState::Disconnected => return Ok(()),
                NodeState::Handshaking => {
                    if let Some(pending) = guarded.pending.take() {
                        pending.cancel();
                    }
                    guarded.epoch += 1;
                    let _ = guarded
                        .machine
                        .apply(Transition::Close, Some("closed during handshake".to_string()));
                    return Ok(());
                }
                NodeState::Connected | NodeState::Syncing => (guarded.epoch, guarded.active.take()),
            }
        };

        match link {
            Some(link) => {
                self.core
                    .teardown(epoch, link, None, Transition::Close, "closed by caller".to_string())
                    .await;
            }
            None => {
                // Another path owns teardown; wait for it to finish.
                let mut changes = self.state_changes();
                let _ = changes.wait_for(|state| !state.has_channel()).await;
            }
        }
        Ok(())
    }

    /// Enter the Syncing sub-state (external trigger). Only legal from
    /// Connected; the node stays in Syncing until the link is lost or closed.
    pub fn begin_sync(&self) -> MeshResult<()> {
        let mut guarded = self.core.write();
        let state = guarded.machine.state();
        if guarded.active.is_none() {
            return Err(self.invalid_transition(state, "begin sync"));
        }
        guarded
            .machine
            .apply(Transition::BeginSync, None)
            .map(|_| ())
            .map_err(|state| self.invalid_transition(state, "begin sync"))
    }

    fn not_connected(&self, state: NodeState) -> MeshError {
        StateError::NotConnected {
            node_id: self.core.id.clone(),
            state,
        }
        .into()
    }

    fn invalid_transition(&self, state: NodeState, operation: &'static str) -> MeshError {
        StateError::InvalidTransition {
            node_id: self.core.id.clone(),
            state,
            operation,
        }
        .into()
    }
}

impl fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshNode")
            .field("id", &self.core.id)
            .field("address", &self.core.address)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        let guarded = self.core.read();
        if let Some(pending) = &guarded.pending {
            pending.cancel();
        }
        if let Some(link) = &guarded.active {
            link.token.cancel();
        }
    }
}

/// Builder for [`MeshNode`].
pub struct MeshNodeBuilder {
    id: String,
    address: String,
    config: Option<NodeConfig>,
    establisher: Option<Arc<dyn Establish>>,
    sink: Option<mpsc::Sender<InboundChunk>>,
}

impl MeshNodeBuilder {
    /// Use this configuration instead of the defaults.
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom transport establisher.
    pub fn establisher(mut self, establisher: Arc<dyn Establish>) -> Self {
        self.establisher = Some(establisher);
        self
    }

    /// Deliver inbound chunks to this channel.
    pub fn inbound_sink(mut self, sink: mpsc::Sender<InboundChunk>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the node.
    pub fn build(self) -> MeshResult<MeshNode> {
        let config = match self.config {
            Some(config) => config,
            None => NodeConfig::new(SecurityPolicy::builder().build()?),
        };
        config.validate()?;

        let machine = StateMachine::new(self.id.clone());
        let state_rx = machine.watch();

        Ok(MeshNode {
            core: Arc::new(NodeCore {
                id: self.id,
                address: self.address,
                config,
                establisher: self
                    .establisher
                    .unwrap_or_else(|| Arc::new(TlsEstablisher)),
                sink: self.sink,
                guarded: RwLock::new(Guarded {
                    machine,
                    epoch: 0,
                    pending: None,
                    active: None,
                }),
                state_rx,
            }),
        })
    }

    /// Build the node together with a bounded inbound channel sized by the
    /// configuration.
    pub fn build_with_inbound(mut self) -> MeshResult<(MeshNode, mpsc::Receiver<InboundChunk>)> {
        let capacity = match &self.config {
            Some(config) => config.inbound_capacity,
            None => crate::config::DEFAULT_INBOUND_CAPACITY,
        };
        if capacity == 0 {
            return Err(MeshError::Config(
                "inbound queue capacity must be non-zero".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(capacity);
        self.sink = Some(tx);
        Ok((self.build()?, rx))
    }
}
