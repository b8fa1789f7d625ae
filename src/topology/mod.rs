// Topology management
//
// Owns the node registry: an atomic id to info map with an address reverse
// map kept in lockstep. The network layer never mutates these maps
// directly; it routes AddNode/RemoveNode messages and this component
// applies them. Reconciliation periodically compares the connected set
// against known members and asks the network to dial whatever is missing.

use crate::common::{NodeAddress, NodeId, NodeInfo};
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::router::{Envelope, LocalEvent, LocalKind, RouteKey, Router};
use crate::runtime::Scheduler;
use crate::wire::{MessageKind, WireMessage};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Routing keys owned by the topology inbox.
pub const TOPOLOGY_ROUTES: [RouteKey; 5] = [
    RouteKey::Wire(MessageKind::AddNode),
    RouteKey::Wire(MessageKind::RemoveNode),
    RouteKey::Wire(MessageKind::DiscoverNodes),
    RouteKey::Wire(MessageKind::DiscoveredNodes),
    RouteKey::Local(LocalKind::ConnectedNodes),
];

pub struct TopologyManager {
    self_id: NodeId,
    nodes: DashMap<NodeId, NodeInfo>,
    addresses: DashMap<NodeAddress, NodeId>,
    router: Arc<Router>,
    ping_interval: Duration,
    reconciliation_interval: Duration,
}

impl TopologyManager {
    /// Build the manager, seed it with the configured membership, and wire
    /// its inbox into the router.
    pub fn new(config: &ClusterConfig, router: Arc<Router>) -> Result<Arc<Self>> {
        let manager = Arc::new(Self {
            self_id: config.self_id.clone(),
            nodes: DashMap::new(),
            addresses: DashMap::new(),
            router: Arc::clone(&router),
            ping_interval: config.ping_interval,
            reconciliation_interval: config.reconciliation_interval,
        });

        for node in &config.core_nodes {
            manager.nodes.insert(node.id.clone(), node.clone());
            manager
                .addresses
                .insert(node.address.clone(), node.id.clone());
        }

        let inbox = router.subscribe(&TOPOLOGY_ROUTES)?;
        tokio::spawn(Self::run_inbox(Arc::clone(&manager), inbox));

        Ok(manager)
    }

    /// Begin periodic reconciliation.
    pub fn start(&self, scheduler: &Scheduler) {
        let router = Arc::clone(&self.router);
        scheduler.schedule_repeating(self.reconciliation_interval, 0.0, move || {
            let router = Arc::clone(&router);
            async move {
                router.route_local(LocalEvent::ListConnectedNodes);
            }
        });
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn self_info(&self) -> Option<NodeInfo> {
        self.get(&self.self_id)
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.get(id).map(|n| n.clone())
    }

    pub fn reverse_lookup(&self, address: &NodeAddress) -> Option<NodeId> {
        self.addresses.get(address).map(|id| id.clone())
    }

    pub fn cluster_size(&self) -> usize {
        self.nodes.len()
    }

    /// Majority size: ⌊n/2⌋ + 1.
    pub fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// n − quorum + 1, the smallest set guaranteed to intersect every
    /// quorum in one honest member.
    pub fn f_plus_one(&self) -> usize {
        self.cluster_size() - self.quorum_size() + 1
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn reconciliation_interval(&self) -> Duration {
        self.reconciliation_interval
    }

    pub fn members(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(|n| n.clone()).collect()
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.key().clone()).collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Add a member. Only the first transition registers the node and emits
    /// ConnectNode; repeats are no-ops. A second id claiming a registered
    /// address is logged and dropped.
    pub fn add_node(&self, info: NodeInfo) -> bool {
        if let Some(existing) = self.addresses.get(&info.address) {
            if *existing != info.id {
                tracing::warn!(
                    address = %info.address,
                    claimed_by = %info.id,
                    held_by = %*existing,
                    "dropping AddNode with duplicate address"
                );
                return false;
            }
        }

        let inserted = match self.nodes.entry(info.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(info.clone());
                true
            }
        };

        if inserted {
            self.addresses
                .insert(info.address.clone(), info.id.clone());
            tracing::info!(node = %info.id, address = %info.address, "node added to topology");
            if info.id != self.self_id {
                self.router.route_local(LocalEvent::ConnectNode {
                    node_id: info.id,
                });
            }
        }
        inserted
    }

    /// Remove a member. Only the first transition emits DisconnectNode.
    pub fn remove_node(&self, id: &NodeId) -> bool {
        match self.nodes.remove(id) {
            Some((_, info)) => {
                // Keep the reverse map in lockstep; remove only if the
                // address still points at this id.
                self.addresses
                    .remove_if(&info.address, |_, held| held == id);
                tracing::info!(node = %id, "node removed from topology");
                self.router.route_local(LocalEvent::DisconnectNode {
                    node_id: id.clone(),
                });
                true
            }
            None => false,
        }
    }

    async fn run_inbox(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbox.recv().await {
            match envelope {
                Envelope::Wired(WireMessage::AddNode { node }) => {
                    self.add_node(node);
                }
                Envelope::Wired(WireMessage::RemoveNode { node_id }) => {
                    self.remove_node(&node_id);
                }
                Envelope::Wired(WireMessage::DiscoverNodes { sender }) => {
                    self.router.route_local(LocalEvent::SendWire {
                        to: sender,
                        message: Box::new(WireMessage::DiscoveredNodes {
                            nodes: self.members(),
                        }),
                    });
                }
                Envelope::Wired(WireMessage::DiscoveredNodes { nodes }) => {
                    // Union-merge: discovery only ever grows the set.
                    for node in nodes {
                        self.add_node(node);
                    }
                }
                Envelope::Local(LocalEvent::ConnectedNodes { nodes }) => {
                    self.reconcile(&nodes);
                }
                other => {
                    tracing::warn!(key = ?other.key(), "topology inbox got unexpected message");
                }
            }
        }
    }

    /// Diff the reported connected set against known members and ask the
    /// network to dial each missing peer.
    fn reconcile(&self, connected: &[NodeId]) {
        for entry in self.nodes.iter() {
            let id = entry.key();
            if *id == self.self_id || connected.contains(id) {
                continue;
            }
            tracing::debug!(node = %id, "reconciliation dialing missing peer");
            self.router.route_local(LocalEvent::ConnectNode {
                node_id: id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::LocalKind;

    fn config(n: usize) -> ClusterConfig {
        ClusterConfig {
            self_id: "node-0".to_string(),
            core_nodes: (0..n)
                .map(|i| NodeInfo::new(format!("node-{}", i), "127.0.0.1", 7400 + i as u16))
                .collect(),
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_quorum_arithmetic() {
        for (n, quorum, f_plus_one) in [(1, 1, 1), (2, 2, 1), (3, 2, 2), (4, 3, 2), (5, 3, 3)] {
            let router = Arc::new(Router::new());
            let topology = TopologyManager::new(&config(n), router).unwrap();
            assert_eq!(topology.cluster_size(), n);
            assert_eq!(topology.quorum_size(), quorum, "n={}", n);
            assert_eq!(topology.f_plus_one(), f_plus_one, "n={}", n);
        }
    }

    #[tokio::test]
    async fn test_add_node_first_transition_only() {
        let router = Arc::new(Router::new());
        let mut connects = router
            .subscribe(&[RouteKey::Local(LocalKind::ConnectNode)])
            .unwrap();
        let topology = TopologyManager::new(&config(1), Arc::clone(&router)).unwrap();

        let info = NodeInfo::new("node-9", "127.0.0.1", 7499);
        assert!(topology.add_node(info.clone()));
        assert!(!topology.add_node(info.clone()));
        assert!(!topology.add_node(info));

        // Exactly one ConnectNode despite three AddNode attempts.
        match connects.recv().await.unwrap() {
            Envelope::Local(LocalEvent::ConnectNode { node_id }) => {
                assert_eq!(node_id, "node-9")
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(connects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_address_dropped() {
        let router = Arc::new(Router::new());
        let topology = TopologyManager::new(&config(2), router).unwrap();
        // node-1 already holds 127.0.0.1:7401.
        let squatter = NodeInfo::new("node-8", "127.0.0.1", 7401);
        assert!(!topology.add_node(squatter));
        assert!(!topology.contains(&"node-8".to_string()));
    }

    #[tokio::test]
    async fn test_remove_keeps_reverse_map_in_lockstep() {
        let router = Arc::new(Router::new());
        let topology = TopologyManager::new(&config(3), router).unwrap();
        let addr = NodeAddress::new("127.0.0.1", 7401);
        assert_eq!(topology.reverse_lookup(&addr), Some("node-1".to_string()));

        assert!(topology.remove_node(&"node-1".to_string()));
        assert!(!topology.remove_node(&"node-1".to_string()));
        assert_eq!(topology.reverse_lookup(&addr), None);
        assert_eq!(topology.cluster_size(), 2);
    }

    #[tokio::test]
    async fn test_discovery_union_merge_never_shrinks() {
        let router = Arc::new(Router::new());
        let topology = TopologyManager::new(&config(3), Arc::clone(&router)).unwrap();

        // A discovery payload missing node-2 must not remove it.
        router.route_wire(WireMessage::DiscoveredNodes {
            nodes: vec![
                NodeInfo::new("node-0", "127.0.0.1", 7400),
                NodeInfo::new("node-3", "127.0.0.1", 7403),
            ],
        });

        // Let the inbox task process the message.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(topology.cluster_size(), 4);
        assert!(topology.contains(&"node-2".to_string()));
        assert!(topology.contains(&"node-3".to_string()));
    }

    #[tokio::test]
    async fn test_discover_nodes_triggers_reply() {
        let router = Arc::new(Router::new());
        let mut wire_out = router
            .subscribe(&[RouteKey::Local(LocalKind::SendWire)])
            .unwrap();
        let _topology = TopologyManager::new(&config(2), Arc::clone(&router)).unwrap();

        router.route_wire(WireMessage::DiscoverNodes {
            sender: "node-1".to_string(),
        });

        match wire_out.recv().await.unwrap() {
            Envelope::Local(LocalEvent::SendWire { to, message }) => {
                assert_eq!(to, "node-1");
                match *message {
                    WireMessage::DiscoveredNodes { nodes } => assert_eq!(nodes.len(), 2),
                    other => panic!("unexpected reply: {:?}", other),
                }
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconcile_dials_missing_members() {
        let router = Arc::new(Router::new());
        let mut connects = router
            .subscribe(&[RouteKey::Local(LocalKind::ConnectNode)])
            .unwrap();
        let _topology = TopologyManager::new(&config(3), Arc::clone(&router)).unwrap();

        // node-1 connected, node-2 missing.
        router.route_local(LocalEvent::ConnectedNodes {
            nodes: vec!["node-1".to_string()],
        });

        match connects.recv().await.unwrap() {
            Envelope::Local(LocalEvent::ConnectNode { node_id }) => {
                assert_eq!(node_id, "node-2")
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(connects.try_recv().is_err());
    }
}
