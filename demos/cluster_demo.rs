// Cluster Consensus Demo
// Boots a three-node cluster in one process, replicates a handful of
// key-value commands, and prints the converged state of every replica.

use rusty_cluster::{
    ClusterConfig, ClusterEvent, ClusterNode, KvCommand, KvStore, NodeInfo, StateMachine,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("=== Cluster Consensus Demo ===\n");

    // 1. Shared membership for a three-node cluster on loopback.
    let members = vec![
        NodeInfo::new("node-0", "127.0.0.1", 7450),
        NodeInfo::new("node-1", "127.0.0.1", 7451),
        NodeInfo::new("node-2", "127.0.0.1", 7452),
    ];

    // 2. Build and start every node with its own key-value machine.
    println!("1. Starting three nodes...");
    let mut nodes = Vec::new();
    let mut stores = Vec::new();
    for member in &members {
        let config = ClusterConfig {
            self_id: member.id.clone(),
            core_nodes: members.clone(),
            bind_host: "127.0.0.1".to_string(),
            ping_interval: Duration::from_millis(500),
            reconciliation_interval: Duration::from_secs(1),
            ..ClusterConfig::default()
        };
        let store = Arc::new(KvStore::new());
        let node = ClusterNode::new(config, Arc::clone(&store) as Arc<dyn StateMachine>)?;
        node.start().await?;
        nodes.push(node);
        stores.push(store);
    }

    // 3. Watch notifications from the first node.
    println!("2. Subscribing to cluster events...");
    let mut events = nodes[0].subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClusterEvent::ConnectionEstablished { node_id } => {
                    println!("   [EVENT] connected to {}", node_id);
                }
                ClusterEvent::QuorumEstablished => {
                    println!("   [EVENT] quorum established");
                }
                ClusterEvent::QuorumDisappeared => {
                    println!("   [EVENT] quorum disappeared");
                }
                ClusterEvent::LeaderChanged { leader } => {
                    println!("   [EVENT] leader is now {:?}", leader);
                }
                ClusterEvent::Committed { phase, .. } => {
                    println!("   [EVENT] committed phase {}", phase);
                }
                _ => {}
            }
        }
    });

    // 4. Wait for the mesh to form.
    while nodes.iter().any(|n| n.view().len() < members.len()) {
        sleep(Duration::from_millis(100)).await;
    }
    println!("3. All nodes connected: {}", nodes[0].view());

    // 5. Each node submits a command; consensus orders them identically.
    println!("4. Replicating commands...");
    for (i, node) in nodes.iter().enumerate() {
        let command = KvCommand::put(format!("key-{}", i), format!("value-{}", i)).encode()?;
        let phase = node
            .apply(vec![command])
            .await_timeout(Duration::from_secs(10))
            .await?;
        println!("   node-{} committed its put at phase {}", i, phase);
    }

    // 6. Every store converges to the same contents.
    sleep(Duration::from_millis(500)).await;
    for (i, store) in stores.iter().enumerate() {
        let digest = store.digest().await;
        println!(
            "5. node-{}: {} entries, digest {}",
            i,
            store.len().await,
            hex::encode(&digest[..8])
        );
    }

    // 7. Shut everything down.
    for node in &nodes {
        node.stop().await?;
    }
    println!("\nDemo complete.");
    Ok(())
}
