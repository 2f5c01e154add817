//! Node lifecycle state machine.
//!
//! ```text
//!                Connect                 Established
//! Disconnected ───────────> Handshaking ─────────────> Connected
//!      ^                        │                     BeginSync │
//!      │      HandshakeFailed   │                               v
//!      ├────────────────────────┘                            Syncing
//!      │                                                        │
//!      └──────────── ChannelLost (from Connected / Syncing) ────┘
//!
//! Close is legal from every state and always lands in Disconnected.
//! ```
//!
//! The machine itself performs no I/O and takes no locks; the owning node
//! serializes every call under its exclusive guard. Each applied transition
//! is published on a `watch` channel (current snapshot) and a `broadcast`
//! channel (event stream for observers).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Capacity of the per-node transition event stream.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of a mesh node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// No channel; the only state from which Connect is legal
    Disconnected,
    /// Dial and TLS handshake in flight
    Handshaking,
    /// Channel established, inbound and outbound tasks running
    Connected,
    /// Externally driven sub-state of Connected
    Syncing,
}

impl NodeState {
    /// True while a live channel is owned (Connected or Syncing).
    pub fn has_channel(self) -> bool {
        matches!(self, NodeState::Connected | NodeState::Syncing)
    }

    /// State reached by applying `transition`, or `None` if it is illegal here.
    pub fn next(self, transition: Transition) -> Option<NodeState> {
        use NodeState::*;
        use Transition::*;

        match (self, transition) {
            (_, Close) => Some(Disconnected),
            (Disconnected, Connect) => Some(Handshaking),
            (Handshaking, Established) => Some(Connected),
            (Handshaking, HandshakeFailed) => Some(Disconnected),
            (Connected, BeginSync) => Some(Syncing),
            (Connected | Syncing, ChannelLost) => Some(Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Disconnected => "Disconnected",
            NodeState::Handshaking => "Handshaking",
            NodeState::Connected => "Connected",
            NodeState::Syncing => "Syncing",
        };
        f.write_str(name)
    }
}

/// Events that drive the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Connect() invoked
    Connect,
    /// Transport established
    Established,
    /// Dial or handshake failed, or was cancelled
    HandshakeFailed,
    /// Application signalled ready-to-sync
    BeginSync,
    /// Channel closed or fatal I/O error
    ChannelLost,
    /// Explicit Close()
    Close,
}

/// Observable lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node moved between two states
    StateChanged {
        /// Node identifier
        node_id: String,
        /// Previous state
        from: NodeState,
        /// New state
        to: NodeState,
        /// Why the transition happened, when not self-evident
        reason: Option<String>,
    },
}

/// Lifecycle state plus liveness timestamp for one node.
#[derive(Debug)]
pub struct StateMachine {
    node_id: String,
    state: NodeState,
    last_seen: Option<Instant>,
    snapshot: watch::Sender<NodeState>,
    events: broadcast::Sender<NodeEvent>,
}

impl StateMachine {
    /// Create a machine in `Disconnected`.
    pub fn new(node_id: impl Into<String>) -> Self {
        let (snapshot, _) = watch::channel(NodeState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            node_id: node_id.into(),
            state: NodeState::Disconnected,
            last_seen: None,
            snapshot,
            events,
        }
    }

    /// Current state
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Last inbound activity (or the Connected transition), if any.
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// Receiver that always holds the latest state.
    pub fn watch(&self) -> watch::Receiver<NodeState> {
        self.snapshot.subscribe()
    }

    /// Subscribe to transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Apply `transition`; returns the new state or, if illegal, the
    /// unchanged current state as the error.
    pub fn apply(
        &mut self,
        transition: Transition,
        reason: Option<String>,
    ) -> Result<NodeState, NodeState> {
        let from = self.state;
        let to = from.next(transition).ok_or(from)?;
        if to == from {
            return Ok(to);
        }

        self.state = to;
        if transition == Transition::Established {
            self.record_activity(Instant::now());
        }

        info!(
            node_id = %self.node_id,
            %from,
            %to,
            reason = reason.as_deref().unwrap_or(""),
            "Node state transition"
        );

        self.snapshot.send_replace(to);
        // No subscribers is fine.
        let _ = self.events.send(NodeEvent::StateChanged {
            node_id: self.node_id.clone(),
            from,
            to,
            reason,
        });

        Ok(to)
    }

    /// Record inbound activity at `at`. Ignored unless a channel is owned;
    /// never moves the timestamp backwards.
    pub fn record_activity(&mut self, at: Instant) -> bool {
        if !self.state.has_channel() {
            return false;
        }
        match self.last_seen {
            Some(prev) if prev >= at => false,
            _ => {
                self.last_seen = Some(at);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transition_table() {
        use NodeState::*;
        use Transition::*;

        assert_eq!(Disconnected.next(Connect), Some(Handshaking));
        assert_eq!(Handshaking.next(Established), Some(Connected));
        assert_eq!(Handshaking.next(HandshakeFailed), Some(Disconnected));
        assert_eq!(Connected.next(BeginSync), Some(Syncing));
        assert_eq!(Connected.next(ChannelLost), Some(Disconnected));
        assert_eq!(Syncing.next(ChannelLost), Some(Disconnected));

        for state in [Disconnected, Handshaking, Connected, Syncing] {
            assert_eq!(state.next(Close), Some(Disconnected));
        }

        assert_eq!(Handshaking.next(Connect), None);
        assert_eq!(Connected.next(Connect), None);
        assert_eq!(Disconnected.next(Established), None);
        assert_eq!(Disconnected.next(ChannelLost), None);
        assert_eq!(Handshaking.next(BeginSync), None);
        assert_eq!(Syncing.next(BeginSync), None);
    }

    #[test]
    fn test_apply_publishes_events() {
        let mut machine = StateMachine::new("node-1");
        let mut events = machine.subscribe();
        let watch = machine.watch();

        machine.apply(Transition::Connect, None).unwrap();
        machine
            .apply(Transition::HandshakeFailed, Some("refused".into()))
            .unwrap();

        assert_eq!(*watch.borrow(), NodeState::Disconnected);
        assert_eq!(
            events.try_recv().unwrap(),
            NodeEvent::StateChanged {
                node_id: "node-1".into(),
                from: NodeState::Disconnected,
                to: NodeState::Handshaking,
                reason: None,
            }
        );
        match events.try_recv().unwrap() {
            NodeEvent::StateChanged { to, reason, .. } => {
                assert_eq!(to, NodeState::Disconnected);
                assert_eq!(reason.as_deref(), Some("refused"));
            }
        }
    }

    #[test]
    fn test_illegal_transition_leaves_state() {
        let mut machine = StateMachine::new("node-1");
        let mut events = machine.subscribe();

        assert_eq!(
            machine.apply(Transition::Established, None),
            Err(NodeState::Disconnected)
        );
        assert_eq!(machine.state(), NodeState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_close_from_disconnected_is_silent() {
        let mut machine = StateMachine::new("node-1");
        let mut events = machine.subscribe();

        assert_eq!(
            machine.apply(Transition::Close, None),
            Ok(NodeState::Disconnected)
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_established_sets_last_seen() {
        let mut machine = StateMachine::new("node-1");
        let before = Instant::now();

        machine.apply(Transition::Connect, None).unwrap();
        assert!(machine.last_seen().is_none());
        machine.apply(Transition::Established, None).unwrap();

        assert!(machine.last_seen().unwrap() >= before);
    }

    #[test]
    fn test_last_seen_is_monotonic() {
        let mut machine = StateMachine::new("node-1");
        machine.apply(Transition::Connect, None).unwrap();
        machine.apply(Transition::Established, None).unwrap();

        let later = Instant::now() + Duration::from_secs(10);
        assert!(machine.record_activity(later));
        assert!(!machine.record_activity(later - Duration::from_secs(5)));
        assert_eq!(machine.last_seen(), Some(later));
    }

    #[test]
    fn test_activity_ignored_without_channel() {
        let mut machine = StateMachine::new("node-1");
        assert!(!machine.record_activity(Instant::now()));
        assert!(machine.last_seen().is_none());
    }
}
