// Cluster network
//
// Framed TCP (optionally TLS) transport between cluster members. The
// network owns the listener, the per-channel tasks, the peer-link registry,
// and the jittered ping schedule. It reports connection, view, and quorum
// transitions as local events; membership mutations are never applied here,
// only routed as AddNode/RemoveNode for topology to apply.

pub mod codec;
pub mod tls;

mod connection;
mod registry;

use crate::common::{ClusterView, NodeId, NodeInfo};
use crate::config::ClusterConfig;
use crate::consensus::engine::Outbound;
use crate::error::{ClusterError, Result};
use crate::router::{Envelope, LocalEvent, LocalKind, RouteKey, Router};
use crate::runtime::Scheduler;
use crate::topology::TopologyManager;
use crate::wire::{MessageKind, WireMessage, WireSerializer};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use registry::LinkRegistry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Routing keys owned by the network inbox.
pub const NETWORK_ROUTES: [RouteKey; 6] = [
    RouteKey::Wire(MessageKind::Ping),
    RouteKey::Wire(MessageKind::Pong),
    RouteKey::Local(LocalKind::ConnectNode),
    RouteKey::Local(LocalKind::DisconnectNode),
    RouteKey::Local(LocalKind::ListConnectedNodes),
    RouteKey::Local(LocalKind::SendWire),
];

#[derive(Default)]
pub(crate) struct NetworkStats {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub pings_sent: AtomicU64,
    pub pongs_received: AtomicU64,
}

/// Point-in-time network counters. Byte counts are wire bytes, length
/// prefixes included.
#[derive(Debug, Clone)]
pub struct NetworkStatsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub connected: usize,
    pub pending: usize,
}

/// State shared between the network front object and its channel tasks.
pub(crate) struct NetContext {
    pub self_id: NodeId,
    pub config: ClusterConfig,
    pub router: Arc<Router>,
    pub topology: Arc<TopologyManager>,
    pub registry: LinkRegistry,
    pub serializer: Arc<dyn WireSerializer>,
    /// Channels that have not completed Hello yet.
    pub pending: DashMap<u64, ()>,
    /// Abort handles for channel and dial tasks.
    pub tasks: DashMap<u64, tokio::task::AbortHandle>,
    pub next_task_id: AtomicU64,
    pub stats: NetworkStats,
    pub running: AtomicBool,
}

fn spawn_tracked<F>(ctx: &Arc<NetContext>, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let id = ctx.next_task_id.fetch_add(1, Ordering::Relaxed);
    let ctx2 = Arc::clone(ctx);
    let handle = tokio::spawn(async move {
        fut.await;
        ctx2.tasks.remove(&id);
    });
    ctx.tasks.insert(id, handle.abort_handle());
}

/// Framed TCP cluster transport with connection lifecycle and liveness.
pub struct ClusterNetwork {
    ctx: Arc<NetContext>,
    scheduler: Scheduler,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    tls_acceptor: Option<TlsAcceptor>,
    tls_connector: Option<TlsConnector>,
}

impl ClusterNetwork {
    /// Build the network and wire its inbox into the router. The listener
    /// does not bind until start().
    pub fn new(
        config: ClusterConfig,
        topology: Arc<TopologyManager>,
        router: Arc<Router>,
        serializer: Arc<dyn WireSerializer>,
        scheduler: Scheduler,
    ) -> Result<Arc<Self>> {
        let (tls_acceptor, tls_connector) = match &config.tls {
            Some(profile) => (
                Some(tls::build_acceptor(profile)?),
                Some(tls::build_connector(profile)?),
            ),
            None => (None, None),
        };

        let ctx = Arc::new(NetContext {
            self_id: config.self_id.clone(),
            registry: LinkRegistry::new(config.self_id.clone()),
            config,
            router: Arc::clone(&router),
            topology,
            serializer,
            pending: DashMap::new(),
            tasks: DashMap::new(),
            next_task_id: AtomicU64::new(1),
            stats: NetworkStats::default(),
            running: AtomicBool::new(false),
        });

        let network = Arc::new(Self {
            ctx,
            scheduler,
            listener_task: Mutex::new(None),
            tls_acceptor,
            tls_connector,
        });

        let inbox = router.subscribe(&NETWORK_ROUTES)?;
        tokio::spawn(Self::run_inbox(Arc::clone(&network), inbox));

        Ok(network)
    }

    /// Bind the listener and begin accepting, dialing, and pinging.
    /// Starting an already running network is a success no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.ctx.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let me = self.ctx.topology.self_info().ok_or_else(|| {
            ClusterError::Configuration("self node missing from topology".to_string())
        })?;
        let bind = format!("{}:{}", self.ctx.config.bind_host, me.address.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| ClusterError::Network(format!("failed to bind {}: {}", bind, e)))?;
        tracing::info!(%bind, "cluster network listening");

        let this = Arc::clone(self);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        if !this.ctx.running.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Err(e) = configure_socket(&stream, &this.ctx.config) {
                            tracing::debug!(%remote, error = %e, "socket option setup failed");
                        }
                        this.spawn_inbound(stream, remote);
                    }
                    Err(e) => {
                        if this.ctx.running.load(Ordering::SeqCst) {
                            tracing::warn!(error = %e, "accept failed");
                        } else {
                            break;
                        }
                    }
                }
            }
        });
        *self.listener_task.lock() = Some(accept_task);

        // Liveness: ping one random connected peer at jittered intervals.
        let this = Arc::clone(self);
        self.scheduler
            .schedule_repeating(self.ctx.config.ping_interval, 0.3, move || {
                let this = Arc::clone(&this);
                async move {
                    this.ping_random_peer();
                }
            });

        Ok(())
    }

    /// Tear down the listener and every channel. Stopping an already
    /// stopped network is a no-op, except that the quorum-disappeared edge
    /// is always reported when quorum was held.
    pub fn stop(&self) {
        if !self.ctx.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping cluster network");
        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }
        for entry in self.ctx.tasks.iter() {
            entry.value().abort();
        }
        self.ctx.tasks.clear();
        self.ctx.registry.clear();
        self.ctx.registry.quorum_down_on_stop(&self.ctx.router);
    }

    pub fn is_running(&self) -> bool {
        self.ctx.running.load(Ordering::SeqCst)
    }

    /// Write and flush on the peer's channel. An absent or inactive channel
    /// is removed and reported as a view change.
    pub fn send(&self, to: &NodeId, message: &WireMessage) -> Result<()> {
        let frame = self.ctx.serializer.serialize(message)?;
        match self.ctx.registry.send_to(to, frame) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.ctx.registry.remove_node(to).is_some() {
                    self.ctx.router.route_local(LocalEvent::ConnectionClosed {
                        node_id: to.clone(),
                    });
                    self.ctx.router.route_local(LocalEvent::ViewChanged {
                        view: self.ctx.registry.view(),
                    });
                    self.ctx
                        .registry
                        .update_quorum(self.ctx.topology.cluster_size(), &self.ctx.router);
                }
                Err(e)
            }
        }
    }

    /// Fan a message out to every active link; returns the delivery count.
    pub fn broadcast(&self, message: &WireMessage) -> Result<usize> {
        let frame = self.ctx.serializer.serialize(message)?;
        Ok(self.ctx.registry.broadcast(&frame))
    }

    /// Sorted view of self plus connected peers.
    pub fn current_view(&self) -> ClusterView {
        self.ctx.registry.view()
    }

    pub fn connected(&self) -> Vec<NodeId> {
        self.ctx.registry.connected_ids()
    }

    pub fn has_quorum(&self) -> bool {
        self.ctx.registry.has_quorum()
    }

    pub fn stats(&self) -> NetworkStatsSnapshot {
        NetworkStatsSnapshot {
            frames_in: self.ctx.stats.frames_in.load(Ordering::Relaxed),
            frames_out: self.ctx.stats.frames_out.load(Ordering::Relaxed),
            bytes_in: self.ctx.stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.ctx.stats.bytes_out.load(Ordering::Relaxed),
            pings_sent: self.ctx.stats.pings_sent.load(Ordering::Relaxed),
            pongs_received: self.ctx.stats.pongs_received.load(Ordering::Relaxed),
            connected: self.ctx.registry.connected_count(),
            pending: self.ctx.pending.len(),
        }
    }

    fn spawn_inbound(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let ctx = Arc::clone(&self.ctx);
        let acceptor = self.tls_acceptor.clone();
        spawn_tracked(&self.ctx, async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        connection::run_channel(tls_stream, remote, None, ctx).await
                    }
                    Err(e) => {
                        tracing::warn!(%remote, error = %e, "TLS handshake failed");
                    }
                },
                None => connection::run_channel(stream, remote, None, ctx).await,
            }
        });
    }

    fn connect(self: &Arc<Self>, node_id: NodeId) {
        if node_id == self.ctx.self_id || self.ctx.registry.contains(&node_id) {
            return;
        }
        let Some(info) = self.ctx.topology.get(&node_id) else {
            tracing::warn!(node = %node_id, "cannot dial unknown node");
            return;
        };
        let this = Arc::clone(self);
        spawn_tracked(&self.ctx, async move {
            if let Err(e) = this.dial(&info).await {
                tracing::warn!(node = %info.id, error = %e, "dial failed");
                this.ctx.router.route_local(LocalEvent::ConnectionFailed {
                    node_id: info.id.clone(),
                    reason: e.to_string(),
                });
            }
        });
    }

    async fn dial(&self, info: &NodeInfo) -> Result<()> {
        let target = format!("{}:{}", info.address.host, info.address.port);
        tracing::debug!(node = %info.id, %target, "dialing peer");
        let stream = tokio::time::timeout(
            self.ctx.config.connect_timeout,
            TcpStream::connect(&target),
        )
        .await
        .map_err(|_| ClusterError::Timeout(format!("connect to {}", target)))?
        .map_err(|e| ClusterError::Network(format!("connect to {}: {}", target, e)))?;

        configure_socket(&stream, &self.ctx.config)?;
        let remote = stream.peer_addr().map_err(ClusterError::Io)?;
        let ctx = Arc::clone(&self.ctx);

        match &self.tls_connector {
            Some(connector) => {
                let name = tls::server_name(&info.address.host)?;
                let tls_stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| ClusterError::Tls(e.to_string()))?;
                connection::run_channel(tls_stream, remote, Some(info.id.clone()), ctx).await;
            }
            None => {
                connection::run_channel(stream, remote, Some(info.id.clone()), ctx).await;
            }
        }
        Ok(())
    }

    fn disconnect(&self, node_id: &NodeId) {
        if self.ctx.registry.remove_node(node_id).is_some() {
            self.ctx.router.route_local(LocalEvent::ConnectionClosed {
                node_id: node_id.clone(),
            });
            self.ctx.router.route_local(LocalEvent::ViewChanged {
                view: self.ctx.registry.view(),
            });
            self.ctx
                .registry
                .update_quorum(self.ctx.topology.cluster_size(), &self.ctx.router);
        }
    }

    fn ping_random_peer(&self) {
        let peers = self.ctx.registry.connected_ids();
        if peers.is_empty() {
            return;
        }
        let target = &peers[rand::rng().random_range(0..peers.len())];
        self.ctx.stats.pings_sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.send(
            target,
            &WireMessage::Ping {
                sender: self.ctx.self_id.clone(),
            },
        );
    }

    async fn run_inbox(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbox.recv().await {
            match envelope {
                Envelope::Wired(WireMessage::Ping { sender }) => {
                    let _ = self.send(
                        &sender,
                        &WireMessage::Pong {
                            sender: self.ctx.self_id.clone(),
                        },
                    );
                }
                Envelope::Wired(WireMessage::Pong { sender }) => {
                    self.ctx.stats.pongs_received.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(peer = %sender, "pong");
                }
                Envelope::Local(LocalEvent::ConnectNode { node_id }) => {
                    self.connect(node_id);
                }
                Envelope::Local(LocalEvent::DisconnectNode { node_id }) => {
                    self.disconnect(&node_id);
                }
                Envelope::Local(LocalEvent::ListConnectedNodes) => {
                    self.ctx.router.route_local(LocalEvent::ConnectedNodes {
                        nodes: self.ctx.registry.connected_ids(),
                    });
                }
                Envelope::Local(LocalEvent::SendWire { to, message }) => {
                    let _ = self.send(&to, &message);
                }
                other => {
                    tracing::warn!(key = ?other.key(), "network inbox got unexpected message");
                }
            }
        }
    }
}

impl Outbound for ClusterNetwork {
    fn send_to(&self, to: &NodeId, message: WireMessage) {
        let _ = self.send(to, &message);
    }

    fn send_all(&self, message: WireMessage) {
        let _ = self.broadcast(&message);
    }

    fn peers(&self) -> Vec<NodeId> {
        self.ctx.registry.connected_ids()
    }
}

/// Apply socket options on a fresh TCP stream.
fn configure_socket(stream: &TcpStream, config: &ClusterConfig) -> Result<()> {
    if config.nodelay {
        stream
            .set_nodelay(true)
            .map_err(|e| ClusterError::Network(format!("failed to set TCP_NODELAY: {}", e)))?;
    }

    if let Some(interval) = config.keepalive_interval {
        let socket = socket2::SockRef::from(stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(interval)
            .with_interval(interval);
        socket
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| ClusterError::Network(format!("failed to set keepalive: {}", e)))?;
    }

    Ok(())
}
