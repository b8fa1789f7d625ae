// Peer link registry
//
// Tracks one active link per peer with put-if-absent registration and
// remove-if-equal teardown, so a duplicate channel from a simultaneous dial
// loses deterministically and a stale close never evicts a newer link.
// Quorum tracking lives here: a single compare-and-set boolean guarantees
// exactly one edge event per transition.

use crate::common::{ClusterView, NodeId};
use crate::error::{ClusterError, Result};
use crate::router::{LocalEvent, Router};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Handle to one established peer channel.
#[derive(Clone)]
pub(crate) struct LinkHandle {
    /// Unique per channel instance; teardown is keyed on it.
    pub link_id: u64,
    pub node_id: NodeId,
    /// Encoded frames to the channel's writer task.
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Signals the channel's read loop to shut down.
    pub close: Arc<Notify>,
}

pub(crate) struct LinkRegistry {
    self_id: NodeId,
    links: DashMap<NodeId, LinkHandle>,
    /// Reverse map from channel instance to peer id.
    channels: DashMap<u64, NodeId>,
    quorum_up: AtomicBool,
    next_link_id: AtomicU64,
}

impl LinkRegistry {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            links: DashMap::new(),
            channels: DashMap::new(),
            quorum_up: AtomicBool::new(false),
            next_link_id: AtomicU64::new(1),
        }
    }

    pub fn next_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Put-if-absent registration. Returns false when a link for the peer
    /// already exists; the caller must close its new channel.
    pub fn register(&self, handle: LinkHandle) -> bool {
        let link_id = handle.link_id;
        let node_id = handle.node_id.clone();
        match self.links.entry(node_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handle);
                self.channels.insert(link_id, node_id);
                true
            }
        }
    }

    /// Remove the peer's link only if it is still this channel instance.
    pub fn remove_if(&self, node_id: &NodeId, link_id: u64) -> bool {
        let removed = self
            .links
            .remove_if(node_id, |_, link| link.link_id == link_id)
            .is_some();
        if removed {
            self.channels.remove(&link_id);
        }
        removed
    }

    /// Remove whatever link the peer currently has and signal it closed.
    pub fn remove_node(&self, node_id: &NodeId) -> Option<LinkHandle> {
        let (_, link) = self.links.remove(node_id)?;
        self.channels.remove(&link.link_id);
        link.close.notify_waiters();
        Some(link)
    }

    pub fn channel_peer(&self, link_id: u64) -> Option<NodeId> {
        self.channels.get(&link_id).map(|id| id.clone())
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.links.contains_key(node_id)
    }

    pub fn connected_ids(&self) -> Vec<NodeId> {
        self.links.iter().map(|l| l.key().clone()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.links.len()
    }

    /// Sorted view of self plus connected peers.
    pub fn view(&self) -> ClusterView {
        ClusterView::new(&self.self_id, self.connected_ids())
    }

    /// Queue a frame on the peer's channel.
    pub fn send_to(&self, node_id: &NodeId, frame: Vec<u8>) -> Result<()> {
        let link = self
            .links
            .get(node_id)
            .ok_or_else(|| ClusterError::ChannelInactive(node_id.clone()))?;
        link.tx
            .send(frame)
            .map_err(|_| ClusterError::ChannelInactive(node_id.clone()))
    }

    /// Fan a frame out to every active link; returns the delivery count.
    pub fn broadcast(&self, frame: &[u8]) -> usize {
        let mut delivered = 0;
        for link in self.links.iter() {
            if link.tx.send(frame.to_vec()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close and drain every link. Used by stop().
    pub fn clear(&self) {
        let ids: Vec<NodeId> = self.connected_ids();
        for id in ids {
            self.remove_node(&id);
        }
    }

    /// Recompute `connected + 1 >= quorum` and emit exactly one edge event
    /// when the threshold is crossed in either direction.
    pub fn update_quorum(&self, cluster_size: usize, router: &Router) {
        let quorum = cluster_size / 2 + 1;
        let have = self.connected_count() + 1 >= quorum;
        if have {
            if self
                .quorum_up
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                tracing::info!(connected = self.connected_count(), quorum, "quorum established");
                router.route_local(LocalEvent::QuorumEstablished);
            }
        } else if self
            .quorum_up
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::warn!(connected = self.connected_count(), quorum, "quorum disappeared");
            router.route_local(LocalEvent::QuorumDisappeared);
        }
    }

    /// Stop path: emit QuorumDisappeared on the established-to-stopped edge.
    pub fn quorum_down_on_stop(&self, router: &Router) {
        if self
            .quorum_up
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            router.route_local(LocalEvent::QuorumDisappeared);
        }
    }

    pub fn has_quorum(&self) -> bool {
        self.quorum_up.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Envelope, LocalKind, RouteKey};

    fn link(registry: &LinkRegistry, node: &str) -> LinkHandle {
        LinkHandle {
            link_id: registry.next_link_id(),
            node_id: node.to_string(),
            tx: mpsc::unbounded_channel().0,
            close: Arc::new(Notify::new()),
        }
    }

    #[test]
    fn test_register_is_put_if_absent() {
        let registry = LinkRegistry::new("node-0".to_string());
        let first = link(&registry, "node-1");
        let second = link(&registry, "node-1");
        assert!(registry.register(first.clone()));
        assert!(!registry.register(second));
        // The peer still maps to the first channel instance.
        assert_eq!(registry.channel_peer(first.link_id), Some("node-1".to_string()));
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn test_remove_if_ignores_stale_instance() {
        let registry = LinkRegistry::new("node-0".to_string());
        let current = link(&registry, "node-1");
        let stale_id = registry.next_link_id();
        assert!(registry.register(current.clone()));

        assert!(!registry.remove_if(&"node-1".to_string(), stale_id));
        assert!(registry.contains(&"node-1".to_string()));
        assert!(registry.remove_if(&"node-1".to_string(), current.link_id));
        assert!(!registry.contains(&"node-1".to_string()));
    }

    #[test]
    fn test_view_is_sorted_with_self() {
        let registry = LinkRegistry::new("node-2".to_string());
        registry.register(link(&registry, "node-3"));
        registry.register(link(&registry, "node-1"));
        let view = registry.view();
        assert_eq!(view.members(), &["node-1", "node-2", "node-3"]);
    }

    #[tokio::test]
    async fn test_quorum_hysteresis_single_edge_events() {
        let router = Arc::new(Router::new());
        let mut events = router
            .subscribe(&[
                RouteKey::Local(LocalKind::QuorumEstablished),
                RouteKey::Local(LocalKind::QuorumDisappeared),
            ])
            .unwrap();
        let registry = LinkRegistry::new("node-0".to_string());

        // Cluster of 3, quorum 2. Self alone is below quorum.
        registry.update_quorum(3, &router);
        registry.update_quorum(3, &router);
        assert!(events.try_recv().is_err());

        let l1 = link(&registry, "node-1");
        registry.register(l1.clone());
        registry.update_quorum(3, &router);
        registry.update_quorum(3, &router); // repeat must not re-emit
        match events.recv().await.unwrap() {
            Envelope::Local(LocalEvent::QuorumEstablished) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(events.try_recv().is_err());

        registry.remove_if(&"node-1".to_string(), l1.link_id);
        registry.update_quorum(3, &router);
        registry.update_quorum(3, &router);
        match events.recv().await.unwrap() {
            Envelope::Local(LocalEvent::QuorumDisappeared) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_quorum_down_on_stop_only_when_up() {
        let router = Arc::new(Router::new());
        let mut events = router
            .subscribe(&[RouteKey::Local(LocalKind::QuorumDisappeared)])
            .unwrap();
        let registry = LinkRegistry::new("node-0".to_string());

        // Never established: stop emits nothing.
        registry.quorum_down_on_stop(&router);
        assert!(events.try_recv().is_err());

        registry.register(link(&registry, "node-1"));
        registry.update_quorum(3, &router);
        assert!(registry.has_quorum());
        registry.quorum_down_on_stop(&router);
        match events.recv().await.unwrap() {
            Envelope::Local(LocalEvent::QuorumDisappeared) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_send_to_missing_peer_fails() {
        let registry = LinkRegistry::new("node-0".to_string());
        let err = registry.send_to(&"node-9".to_string(), vec![1, 2, 3]);
        assert!(matches!(err, Err(ClusterError::ChannelInactive(_))));
    }
}
