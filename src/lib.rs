// rusty-cluster - Cluster consensus runtime
// Core library module
//
// Layered leaves first: runtime primitives, the message router, topology,
// the framed TCP cluster network, and the Rabia consensus engine on top.
// The DNS resolver client is independent and feeds addresses into topology
// through higher-level callers.

pub mod common;
pub mod config;
pub mod consensus;
pub mod dns;
pub mod error;
pub mod net;
pub mod node;
pub mod router;
pub mod runtime;
pub mod topology;
pub mod wire;

pub use common::{ClusterEvent, ClusterView, NodeAddress, NodeId, NodeInfo};
pub use config::{ClusterConfig, TlsProfile};
pub use consensus::{
    Batch, Command, EngineStatsSnapshot, KvCommand, KvStore, Phase, StateMachine,
};
pub use dns::DnsResolver;
pub use error::{ClusterError, Result};
pub use net::{ClusterNetwork, NetworkStatsSnapshot};
pub use node::ClusterNode;
pub use router::Router;
pub use runtime::{Promise, Scheduler};
pub use topology::TopologyManager;
pub use wire::{BincodeSerializer, WireMessage, WireSerializer};
