// Cluster node
//
// Front object owning one replica's full stack: router, scheduler,
// topology, network, and consensus engine. Routes are wired in the
// constructor and validated before anything starts, so a missing handler
// is a configuration error at build time rather than a dropped message at
// runtime.

use crate::common::{ClusterEvent, ClusterView, NodeId};
use crate::config::ClusterConfig;
use crate::consensus::engine::{spawn_engine, EngineHandle, EngineStatsSnapshot, Outbound};
use crate::consensus::machine::StateMachine;
use crate::consensus::types::{Command, Phase};
use crate::consensus::ENGINE_ROUTES;
use crate::error::Result;
use crate::net::{ClusterNetwork, NetworkStatsSnapshot, NETWORK_ROUTES};
use crate::router::{Envelope, LocalEvent, LocalKind, RouteKey, Router};
use crate::runtime::{Promise, Scheduler};
use crate::topology::{TopologyManager, TOPOLOGY_ROUTES};
use crate::wire::{BincodeSerializer, WireSerializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Routing keys owned by the notification bridge.
pub const NODE_ROUTES: [RouteKey; 6] = [
    RouteKey::Local(LocalKind::ConnectionEstablished),
    RouteKey::Local(LocalKind::ConnectionFailed),
    RouteKey::Local(LocalKind::ConnectionClosed),
    RouteKey::Local(LocalKind::QuorumEstablished),
    RouteKey::Local(LocalKind::QuorumDisappeared),
    RouteKey::Local(LocalKind::ViewChanged),
];

/// One cluster replica. Submit command batches with `apply`; observe
/// leader, quorum, and topology transitions through `subscribe`.
pub struct ClusterNode {
    config: ClusterConfig,
    router: Arc<Router>,
    scheduler: Scheduler,
    topology: Arc<TopologyManager>,
    network: Arc<ClusterNetwork>,
    engine: EngineHandle,
    events: broadcast::Sender<ClusterEvent>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl ClusterNode {
    /// Build a node with the default bincode wire serializer.
    pub fn new(config: ClusterConfig, machine: Arc<dyn StateMachine>) -> Result<Arc<Self>> {
        Self::with_serializer(config, machine, Arc::new(BincodeSerializer))
    }

    /// Build a node with a custom wire serializer. Every member of the
    /// cluster must agree on the serializer.
    pub fn with_serializer(
        config: ClusterConfig,
        machine: Arc<dyn StateMachine>,
        serializer: Arc<dyn WireSerializer>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let router = Arc::new(Router::new());
        let scheduler = Scheduler::new();
        let (events, _) = broadcast::channel(1024);

        let topology = TopologyManager::new(&config, Arc::clone(&router))?;
        let network = ClusterNetwork::new(
            config.clone(),
            Arc::clone(&topology),
            Arc::clone(&router),
            serializer,
            scheduler.clone(),
        )?;
        let engine = spawn_engine(
            &config,
            Arc::clone(&topology),
            Arc::clone(&network) as Arc<dyn Outbound>,
            machine,
            &router,
            &scheduler,
            events.clone(),
        )?;

        let inbox = router.subscribe(&NODE_ROUTES)?;
        tokio::spawn(run_bridge(events.clone(), inbox));

        let mut required: Vec<RouteKey> = Vec::new();
        required.extend_from_slice(&TOPOLOGY_ROUTES);
        required.extend_from_slice(&NETWORK_ROUTES);
        required.extend_from_slice(&ENGINE_ROUTES);
        required.extend_from_slice(&NODE_ROUTES);
        router.validate(&required)?;

        Ok(Arc::new(Self {
            config,
            router,
            scheduler,
            topology,
            network,
            engine,
            events,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Bind the listener, start reconciliation, and dial the configured
    /// members. Starting a running node is a success no-op. A stopped node
    /// stays stopped; recovery is a fresh node that resyncs by state
    /// transfer.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(crate::error::ClusterError::InvalidState(
                "node has been stopped".to_string(),
            ));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(node = %self.config.self_id, "starting cluster node");
        self.network.start().await?;
        self.topology.start(&self.scheduler);
        for node in &self.config.core_nodes {
            if node.id != self.config.self_id {
                self.router.route_local(LocalEvent::ConnectNode {
                    node_id: node.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Stop the engine, close every channel, and cancel timers. Stopping a
    /// stopped node is a success no-op.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stopped.store(true, Ordering::SeqCst);
        tracing::info!(node = %self.config.self_id, "stopping cluster node");
        self.engine.stop();
        self.network.stop();
        self.scheduler.stop();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Submit commands for ordered, at-most-once application. The promise
    /// resolves with the phase at which the commands committed.
    pub fn apply(&self, commands: Vec<Command>) -> Promise<Phase> {
        self.engine.submit(commands)
    }

    /// Subscribe to leader, quorum, topology, and commit notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn self_id(&self) -> &NodeId {
        &self.config.self_id
    }

    /// Sorted view of self plus connected peers.
    pub fn view(&self) -> ClusterView {
        self.network.current_view()
    }

    /// Deterministic leader derived from the view.
    pub fn leader(&self) -> Option<NodeId> {
        self.view().leader().cloned()
    }

    pub fn has_quorum(&self) -> bool {
        self.network.has_quorum()
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn network_stats(&self) -> NetworkStatsSnapshot {
        self.network.stats()
    }

    pub fn engine_stats(&self) -> EngineStatsSnapshot {
        self.engine.stats()
    }
}

/// Forward local notifications onto the consumer broadcast channel and
/// derive leader changes from view changes.
async fn run_bridge(
    events: broadcast::Sender<ClusterEvent>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
) {
    let mut last_leader: Option<NodeId> = None;
    while let Some(envelope) = inbox.recv().await {
        let Envelope::Local(event) = envelope else {
            continue;
        };
        let mapped = match event {
            LocalEvent::ConnectionEstablished { node_id } => {
                Some(ClusterEvent::ConnectionEstablished { node_id })
            }
            LocalEvent::ConnectionFailed { node_id, reason } => {
                Some(ClusterEvent::ConnectionFailed { node_id, reason })
            }
            LocalEvent::ConnectionClosed { node_id } => {
                Some(ClusterEvent::ConnectionClosed { node_id })
            }
            LocalEvent::QuorumEstablished => Some(ClusterEvent::QuorumEstablished),
            LocalEvent::QuorumDisappeared => Some(ClusterEvent::QuorumDisappeared),
            LocalEvent::ViewChanged { view } => {
                let leader = view.leader().cloned();
                if leader != last_leader {
                    last_leader = leader.clone();
                    let _ = events.send(ClusterEvent::LeaderChanged { leader });
                }
                Some(ClusterEvent::ViewChanged { view })
            }
            _ => None,
        };
        if let Some(event) = mapped {
            let _ = events.send(event);
        }
    }
}
