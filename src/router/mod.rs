// Process-local message router
//
// A process-wide table from message kind to a registered inbox. Wired
// messages arrive from peer channels; local events never leave the process.
// Routing is fire-and-forget: an unknown kind is logged and dropped, and a
// dead inbox is logged and dropped. Dispatch happens on the caller's task.
//
// Registration is constructor-wired: every component registers its inboxes
// before the node starts, and `validate` reports anything missing.

use crate::common::{ClusterView, NodeId};
use crate::wire::{MessageKind, WireMessage};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Events that never leave the process.
#[derive(Debug, Clone)]
pub enum LocalEvent {
    /// Topology asks the network to dial a member.
    ConnectNode { node_id: NodeId },

    /// Topology asks the network to drop a member's link.
    DisconnectNode { node_id: NodeId },

    /// A peer link completed its Hello handshake.
    ConnectionEstablished { node_id: NodeId },

    /// Dial or handshake failure.
    ConnectionFailed { node_id: NodeId, reason: String },

    /// An established link went away.
    ConnectionClosed { node_id: NodeId },

    /// Quorum edge events; strict alternation is guaranteed by the
    /// network's hysteresis flag.
    QuorumEstablished,
    QuorumDisappeared,

    /// The sorted connected view changed.
    ViewChanged { view: ClusterView },

    /// Topology polls the network for the connected set.
    ListConnectedNodes,

    /// The network's reply to ListConnectedNodes.
    ConnectedNodes { nodes: Vec<NodeId> },

    /// Ask the network to send a wire message to one peer. Lets lower
    /// layers (topology) transmit without holding a network reference.
    SendWire {
        to: NodeId,
        message: Box<WireMessage>,
    },
}

impl LocalEvent {
    pub fn kind(&self) -> LocalKind {
        match self {
            LocalEvent::ConnectNode { .. } => LocalKind::ConnectNode,
            LocalEvent::DisconnectNode { .. } => LocalKind::DisconnectNode,
            LocalEvent::ConnectionEstablished { .. } => LocalKind::ConnectionEstablished,
            LocalEvent::ConnectionFailed { .. } => LocalKind::ConnectionFailed,
            LocalEvent::ConnectionClosed { .. } => LocalKind::ConnectionClosed,
            LocalEvent::QuorumEstablished => LocalKind::QuorumEstablished,
            LocalEvent::QuorumDisappeared => LocalKind::QuorumDisappeared,
            LocalEvent::ViewChanged { .. } => LocalKind::ViewChanged,
            LocalEvent::ListConnectedNodes => LocalKind::ListConnectedNodes,
            LocalEvent::ConnectedNodes { .. } => LocalKind::ConnectedNodes,
            LocalEvent::SendWire { .. } => LocalKind::SendWire,
        }
    }
}

/// Routing discriminant for local events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKind {
    ConnectNode,
    DisconnectNode,
    ConnectionEstablished,
    ConnectionFailed,
    ConnectionClosed,
    QuorumEstablished,
    QuorumDisappeared,
    ViewChanged,
    ListConnectedNodes,
    ConnectedNodes,
    SendWire,
}

/// The full routing key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Wire(MessageKind),
    Local(LocalKind),
}

/// A routed unit: either a wired message (possibly just off a channel) or a
/// local event.
#[derive(Debug, Clone)]
pub enum Envelope {
    Wired(WireMessage),
    Local(LocalEvent),
}

impl Envelope {
    pub fn key(&self) -> RouteKey {
        match self {
            Envelope::Wired(m) => RouteKey::Wire(m.kind()),
            Envelope::Local(e) => RouteKey::Local(e.kind()),
        }
    }
}

/// Kind-keyed dispatch table.
pub struct Router {
    handlers: DashMap<RouteKey, mpsc::UnboundedSender<Envelope>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register one inbox for each key. Double registration is a
    /// configuration error surfaced immediately.
    pub fn register(
        &self,
        keys: &[RouteKey],
        tx: mpsc::UnboundedSender<Envelope>,
    ) -> crate::error::Result<()> {
        for key in keys {
            if self.handlers.contains_key(key) {
                return Err(crate::error::ClusterError::Configuration(format!(
                    "handler already registered for {:?}",
                    key
                )));
            }
        }
        for key in keys {
            self.handlers.insert(*key, tx.clone());
        }
        Ok(())
    }

    /// Create an inbox, register it for `keys`, and hand back the receiver.
    pub fn subscribe(
        &self,
        keys: &[RouteKey],
    ) -> crate::error::Result<mpsc::UnboundedReceiver<Envelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(keys, tx)?;
        Ok(rx)
    }

    /// Report every required key that has no handler. Run before start.
    pub fn validate(&self, required: &[RouteKey]) -> crate::error::Result<()> {
        let missing: Vec<String> = required
            .iter()
            .filter(|k| !self.handlers.contains_key(*k))
            .map(|k| format!("{:?}", k))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(crate::error::ClusterError::Configuration(format!(
                "missing handlers for: {}",
                missing.join(", ")
            )))
        }
    }

    /// Dispatch an envelope to its registered inbox. Never fails; faults
    /// are logged at the router and the message is dropped.
    pub fn route(&self, envelope: Envelope) {
        let key = envelope.key();
        match self.handlers.get(&key) {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    tracing::warn!(?key, "dropping message for closed inbox");
                }
            }
            None => {
                tracing::warn!(?key, "dropping message with no registered handler");
            }
        }
    }

    pub fn route_wire(&self, message: WireMessage) {
        self.route(Envelope::Wired(message));
    }

    pub fn route_local(&self, event: LocalEvent) {
        self.route(Envelope::Local(event));
    }
}
