// DNS resolver against a mock UDP responder.

use rusty_cluster::{DnsResolver, Scheduler};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Answers every A query with the given address and TTL.
async fn mock_dns_server(address: [u8; 4], ttl: u32, hits: Arc<AtomicUsize>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            hits.fetch_add(1, Ordering::SeqCst);
            let mut response = Vec::new();
            response.extend_from_slice(&buf[0..2]); // echo the id
            response.extend_from_slice(&0x8180u16.to_be_bytes());
            response.extend_from_slice(&1u16.to_be_bytes());
            response.extend_from_slice(&1u16.to_be_bytes());
            response.extend_from_slice(&0u16.to_be_bytes());
            response.extend_from_slice(&0u16.to_be_bytes());
            response.extend_from_slice(&buf[12..n]); // echo the question
            response.extend_from_slice(&0xC00Cu16.to_be_bytes());
            response.extend_from_slice(&1u16.to_be_bytes()); // A
            response.extend_from_slice(&1u16.to_be_bytes()); // IN
            response.extend_from_slice(&ttl.to_be_bytes());
            response.extend_from_slice(&4u16.to_be_bytes());
            response.extend_from_slice(&address);
            let _ = socket.send_to(&response, from).await;
        }
    });
    addr
}

#[tokio::test]
async fn resolves_caches_and_expires() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = mock_dns_server([93, 184, 216, 34], 1, Arc::clone(&hits)).await;
    let scheduler = Scheduler::new();
    let resolver = DnsResolver::new(&[server.to_string()], scheduler.clone()).unwrap();

    let expected = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
    assert_eq!(resolver.resolve("example.com").await.unwrap(), expected);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Second lookup inside the TTL is served from cache.
    assert_eq!(resolver.resolve("example.com").await.unwrap(), expected);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // After the TTL deadline the entry is gone.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(resolver.cached("example.com").is_none());
    assert_eq!(resolver.resolve("example.com").await.unwrap(), expected);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    scheduler.stop();
}

#[tokio::test]
async fn parallel_servers_first_success_wins() {
    let hits = Arc::new(AtomicUsize::new(0));
    let live = mock_dns_server([10, 9, 8, 7], 30, Arc::clone(&hits)).await;
    let dead = UdpSocket::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let scheduler = Scheduler::new();
    let resolver = DnsResolver::new(&[dead.to_string(), live.to_string()], scheduler.clone())
        .unwrap()
        .with_query_timeout(Duration::from_millis(500));

    assert_eq!(
        resolver.resolve("db.cluster.internal").await.unwrap(),
        IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7))
    );
    scheduler.stop();
}
