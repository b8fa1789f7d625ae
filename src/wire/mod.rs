// Wire protocol messages
//
// Every cross-node message is one variant of a single tagged sum, so there
// is exactly one exhaustive dispatch point. Variant order is part of the
// wire contract; new kinds are appended, never inserted.
//
// The serializer is pluggable behind `WireSerializer`; the default is
// bincode with the standard configuration.

use crate::common::{NodeId, NodeInfo};
use crate::consensus::types::{Batch, Phase, Phase2Value, Round, VoteValue};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Protocol version carried in Hello. Peers with a different version are
/// rejected during the handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// The tagged sum of every message that crosses the wire.
///
/// Vote and decide messages reserve an optional signature field for a future
/// threshold-signature extension; it is always `None` today and never
/// verified.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum WireMessage {
    /// First message on any new channel, identifying the sender.
    Hello {
        sender: NodeId,
        protocol_version: u16,
    },

    /// Liveness probe; carries no payload beyond sender identity.
    Ping { sender: NodeId },

    /// Liveness reply.
    Pong { sender: NodeId },

    /// Ask a peer for its known member list.
    DiscoverNodes { sender: NodeId },

    /// Reply to DiscoverNodes. Receipt union-merges; discovery never
    /// shrinks the member set.
    DiscoveredNodes { nodes: Vec<NodeInfo> },

    /// Membership additions and removals.
    AddNode { node: NodeInfo },
    RemoveNode { node_id: NodeId },

    /// Initial value from a proposer, at most once per (sender, phase).
    Propose {
        sender: NodeId,
        phase: Phase,
        batch: Batch,
    },

    /// First-round vote of the binary agreement.
    State1 {
        sender: NodeId,
        phase: Phase,
        round: Round,
        value: VoteValue,
        signature: Option<Vec<u8>>,
    },

    /// Second-round vote; Question when round one saw no agreeing quorum.
    State2 {
        sender: NodeId,
        phase: Phase,
        round: Round,
        value: Phase2Value,
        signature: Option<Vec<u8>>,
    },

    /// Decision dissemination for laggards.
    Decide {
        sender: NodeId,
        phase: Phase,
        value: VoteValue,
        batch: Batch,
        signature: Option<Vec<u8>>,
    },

    /// Recovery: ask a peer for everything from `from_phase` on.
    StateRequest { sender: NodeId, from_phase: Phase },

    /// Recovery reply. A non-empty snapshot replaces the requester's
    /// application state as of `first_phase`; `entries` are the committed
    /// batches from `first_phase` on.
    StateResponse {
        sender: NodeId,
        first_phase: Phase,
        snapshot: Vec<u8>,
        entries: Vec<Batch>,
    },
}

impl WireMessage {
    /// Routing discriminant.
    pub fn kind(&self) -> MessageKind {
        match self {
            WireMessage::Hello { .. } => MessageKind::Hello,
            WireMessage::Ping { .. } => MessageKind::Ping,
            WireMessage::Pong { .. } => MessageKind::Pong,
            WireMessage::DiscoverNodes { .. } => MessageKind::DiscoverNodes,
            WireMessage::DiscoveredNodes { .. } => MessageKind::DiscoveredNodes,
            WireMessage::AddNode { .. } => MessageKind::AddNode,
            WireMessage::RemoveNode { .. } => MessageKind::RemoveNode,
            WireMessage::Propose { .. } => MessageKind::Propose,
            WireMessage::State1 { .. } => MessageKind::State1,
            WireMessage::State2 { .. } => MessageKind::State2,
            WireMessage::Decide { .. } => MessageKind::Decide,
            WireMessage::StateRequest { .. } => MessageKind::StateRequest,
            WireMessage::StateResponse { .. } => MessageKind::StateResponse,
        }
    }

    /// Sender identity, where the variant carries one.
    pub fn sender(&self) -> Option<&NodeId> {
        match self {
            WireMessage::Hello { sender, .. }
            | WireMessage::Ping { sender }
            | WireMessage::Pong { sender }
            | WireMessage::DiscoverNodes { sender }
            | WireMessage::Propose { sender, .. }
            | WireMessage::State1 { sender, .. }
            | WireMessage::State2 { sender, .. }
            | WireMessage::Decide { sender, .. }
            | WireMessage::StateRequest { sender, .. }
            | WireMessage::StateResponse { sender, .. } => Some(sender),
            WireMessage::DiscoveredNodes { .. }
            | WireMessage::AddNode { .. }
            | WireMessage::RemoveNode { .. } => None,
        }
    }
}

/// Stable routing discriminant for wire messages; the router is keyed on
/// this plus the local event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Ping,
    Pong,
    DiscoverNodes,
    DiscoveredNodes,
    AddNode,
    RemoveNode,
    Propose,
    State1,
    State2,
    Decide,
    StateRequest,
    StateResponse,
}

/// Pluggable binary serializer/deserializer pair for wire messages.
///
/// The protocol treats the payload as opaque; any implementation that
/// round-trips every `WireMessage` variant is acceptable, as long as every
/// cluster member agrees on the same one.
pub trait WireSerializer: Send + Sync + 'static {
    fn serialize(&self, message: &WireMessage) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<WireMessage>;
}

/// Default serializer: bincode with the standard configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl WireSerializer for BincodeSerializer {
    fn serialize(&self, message: &WireMessage) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(message, bincode::config::standard())?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<WireMessage> {
        let (message, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(message)
    }
}
