// Cluster runtime configuration
//
// All behavior flows from this struct; there are no environment variables
// and no hidden globals. Defaults are suitable for a small LAN cluster.

use crate::common::{NodeId, NodeInfo};
use crate::error::{ClusterError, Result};
use std::collections::HashSet;
use std::time::Duration;

/// TLS profile for the cluster transport.
///
/// `identity_cert`/`identity_key` are PEM paths presented to peers;
/// `trust_anchors` is a PEM bundle of accepted CAs. With
/// `require_client_auth` set, the server side demands a client certificate
/// signed by the trust anchors (mutual TLS).
#[derive(Debug, Clone)]
pub struct TlsProfile {
    pub identity_cert: String,
    pub identity_key: String,
    pub trust_anchors: String,
    pub require_client_auth: bool,
}

/// Configuration for one cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// NodeId of this process. Must appear in `core_nodes`.
    pub self_id: NodeId,

    /// Initial membership.
    pub core_nodes: Vec<NodeInfo>,

    /// Host the listener binds to. The port always comes from this node's
    /// `core_nodes` entry so peers can dial it.
    pub bind_host: String,

    /// Topology reconcile period.
    pub reconciliation_interval: Duration,

    /// Base liveness period; actual intervals are jittered by ±30 %.
    pub ping_interval: Duration,

    /// Max wait for Hello after a channel opens.
    pub hello_timeout: Duration,

    /// Outbound dial timeout.
    pub connect_timeout: Duration,

    /// Upper bound on a wire frame payload.
    pub max_frame_size: usize,

    /// Proposal cap in commands per batch.
    pub batch_size: usize,

    /// How many phases ahead of the committed floor messages are buffered.
    /// A Decide beyond this window triggers state transfer.
    pub pipeline_depth: u64,

    /// Disable Nagle on peer sockets.
    pub nodelay: bool,

    /// SO_KEEPALIVE interval, if any.
    pub keepalive_interval: Option<Duration>,

    /// Optional TLS profile; when present every peer channel is TLS.
    pub tls: Option<TlsProfile>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            self_id: String::new(),
            core_nodes: Vec::new(),
            bind_host: "0.0.0.0".to_string(),
            reconciliation_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            hello_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            max_frame_size: 1024 * 1024, // 1 MiB
            batch_size: 64,
            pipeline_depth: 16,
            nodelay: true,
            keepalive_interval: Some(Duration::from_secs(60)),
            tls: None,
        }
    }
}

impl ClusterConfig {
    /// Validate membership and limits. Called once at node construction;
    /// invalid configurations never start.
    pub fn validate(&self) -> Result<()> {
        if self.core_nodes.is_empty() {
            return Err(ClusterError::Configuration(
                "core_nodes cannot be empty".to_string(),
            ));
        }

        let me = self
            .core_nodes
            .iter()
            .find(|n| n.id == self.self_id)
            .ok_or_else(|| {
                ClusterError::Configuration(format!(
                    "self id '{}' not present in core_nodes",
                    self.self_id
                ))
            })?;

        if me.address.port == 0 {
            return Err(ClusterError::Configuration(
                "listen port must be non-zero".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut addrs = HashSet::new();
        for node in &self.core_nodes {
            if node.address.port == 0 {
                return Err(ClusterError::Configuration(format!(
                    "node '{}' has port 0",
                    node.id
                )));
            }
            if !ids.insert(node.id.clone()) {
                return Err(ClusterError::Configuration(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            if !addrs.insert(node.address.clone()) {
                return Err(ClusterError::Configuration(format!(
                    "duplicate address {}",
                    node.address
                )));
            }
        }

        if self.max_frame_size == 0 {
            return Err(ClusterError::Configuration(
                "max_frame_size must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ClusterError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.pipeline_depth == 0 {
            return Err(ClusterError::Configuration(
                "pipeline_depth must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// This node's own membership entry.
    pub fn self_info(&self) -> Option<&NodeInfo> {
        self.core_nodes.iter().find(|n| n.id == self.self_id)
    }
}
