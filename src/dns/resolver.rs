// DNS resolver client
//
// Resolves a domain to an IP address against a configured server list.
// Queries go to every server in parallel over UDP and the first successful
// reply wins. Successful lookups are cached and evicted by a scheduled
// task exactly when their TTL expires; failures are never cached.
// `localhost` is seeded as loopback with unbounded TTL.

use crate::dns::protocol::{self, QTYPE_A};
use crate::error::{ClusterError, Result};
use crate::runtime::{Promise, Scheduler};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const DNS_PORT: u16 = 53;
const MAX_RESPONSE_SIZE: usize = 512;

struct CacheEntry {
    address: IpAddr,
    /// Guards scheduled eviction against a refreshed entry.
    generation: u64,
}

/// UDP DNS client with a TTL cache.
pub struct DnsResolver {
    servers: Vec<SocketAddr>,
    cache: Arc<DashMap<String, CacheEntry>>,
    scheduler: Scheduler,
    query_timeout: Duration,
    generation: AtomicU64,
}

impl DnsResolver {
    /// Build a resolver over the given servers. Each entry is an IP
    /// address, optionally with a port (53 by default).
    pub fn new(servers: &[String], scheduler: Scheduler) -> Result<Self> {
        if servers.is_empty() {
            return Err(ClusterError::Configuration(
                "at least one DNS server is required".to_string(),
            ));
        }
        let mut parsed = Vec::with_capacity(servers.len());
        for server in servers {
            let addr = if let Ok(addr) = server.parse::<SocketAddr>() {
                addr
            } else if let Ok(ip) = server.parse::<IpAddr>() {
                SocketAddr::new(ip, DNS_PORT)
            } else {
                return Err(ClusterError::InvalidIpAddress(server.clone()));
            };
            parsed.push(addr);
        }

        let cache: Arc<DashMap<String, CacheEntry>> = Arc::new(DashMap::new());
        cache.insert(
            "localhost".to_string(),
            CacheEntry {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                generation: 0,
            },
        );

        Ok(Self {
            servers: parsed,
            cache,
            scheduler,
            query_timeout: Duration::from_secs(2),
            generation: AtomicU64::new(0),
        })
    }

    /// Override the per-query timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn cached(&self, domain: &str) -> Option<IpAddr> {
        self.cache
            .get(&domain.to_ascii_lowercase())
            .map(|e| e.address)
    }

    /// Resolve `domain`, consulting the cache first. All configured
    /// servers are queried in parallel; the first success wins, and when
    /// every server fails the result is UnknownDomain.
    pub async fn resolve(&self, domain: &str) -> Result<IpAddr> {
        let key = domain.to_ascii_lowercase();

        // IP literals resolve to themselves.
        if let Ok(ip) = key.parse::<IpAddr>() {
            return Ok(ip);
        }

        if let Some(entry) = self.cache.get(&key) {
            tracing::debug!(domain = %key, address = %entry.address, "DNS cache hit");
            return Ok(entry.address);
        }

        let queries: Vec<Promise<(IpAddr, u32)>> = self
            .servers
            .iter()
            .map(|server| {
                let server = *server;
                let domain = key.clone();
                let timeout = self.query_timeout;
                Promise::spawn(async move { query_server(server, &domain, timeout).await })
            })
            .collect();

        let (address, ttl) = Promise::any_success(
            queries,
            ClusterError::UnknownDomain(domain.to_string()),
        )
        .value()
        .await?;

        tracing::debug!(domain = %key, %address, ttl, "DNS resolved");
        if ttl > 0 {
            self.cache_entry(key, address, ttl);
        }
        Ok(address)
    }

    fn cache_entry(&self, key: String, address: IpAddr, ttl: u32) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.cache.insert(
            key.clone(),
            CacheEntry {
                address,
                generation,
            },
        );
        let cache = Arc::clone(&self.cache);
        self.scheduler
            .schedule_once(Duration::from_secs(u64::from(ttl)), async move {
                // Only the generation that scheduled this eviction may
                // remove the entry; a refresh supersedes it.
                cache.remove_if(&key, |_, entry| entry.generation == generation);
                tracing::debug!(domain = %key, "DNS cache entry expired");
            });
    }
}

/// One query against one server.
async fn query_server(server: SocketAddr, domain: &str, timeout: Duration) -> Result<(IpAddr, u32)> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid literal")
    } else {
        "[::]:0".parse().expect("valid literal")
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ClusterError::ServerError(format!("bind failed: {}", e)))?;
    socket
        .connect(server)
        .await
        .map_err(|e| ClusterError::ServerError(format!("connect {} failed: {}", server, e)))?;

    let id = rand::random::<u16>();
    let query = protocol::encode_query(id, domain, QTYPE_A)?;
    socket
        .send(&query)
        .await
        .map_err(|e| ClusterError::ServerError(format!("send to {} failed: {}", server, e)))?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; MAX_RESPONSE_SIZE];
    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                ClusterError::RequestTimeout(format!("{} via {}", domain, server))
            })?
            .map_err(|e| ClusterError::ServerError(format!("recv from {} failed: {}", server, e)))?;

        // Late or foreign datagrams carry a different id; keep waiting.
        if received < 2 || buf[0..2] != id.to_be_bytes() {
            continue;
        }

        let answer = protocol::decode_response(&buf[..received], id, domain)?;
        let address = answer
            .addresses
            .first()
            .copied()
            .ok_or_else(|| ClusterError::UnknownDomain(domain.to_string()))?;
        return Ok((address, answer.min_ttl));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Minimal mock DNS server answering every A query with one address.
    async fn mock_server(
        address: [u8; 4],
        ttl: u32,
        hits: Arc<AtomicUsize>,
    ) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                hits.fetch_add(1, Ordering::SeqCst);
                let id = [buf[0], buf[1]];
                // Echo the question section back, then append one A answer.
                let mut response = Vec::new();
                response.extend_from_slice(&id);
                response.extend_from_slice(&0x8180u16.to_be_bytes());
                response.extend_from_slice(&1u16.to_be_bytes());
                response.extend_from_slice(&1u16.to_be_bytes());
                response.extend_from_slice(&0u16.to_be_bytes());
                response.extend_from_slice(&0u16.to_be_bytes());
                response.extend_from_slice(&buf[12..n]);
                response.extend_from_slice(&0xC00Cu16.to_be_bytes());
                response.extend_from_slice(&1u16.to_be_bytes());
                response.extend_from_slice(&1u16.to_be_bytes());
                response.extend_from_slice(&ttl.to_be_bytes());
                response.extend_from_slice(&4u16.to_be_bytes());
                response.extend_from_slice(&address);
                let _ = socket.send_to(&response, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_resolve_and_cache_until_ttl() {
        let hits = Arc::new(AtomicUsize::new(0));
        let server = mock_server([93, 184, 216, 34], 1, Arc::clone(&hits)).await;
        let scheduler = Scheduler::new();
        let resolver =
            DnsResolver::new(&[server.to_string()], scheduler.clone()).unwrap();

        let first = resolver.resolve("example.com").await.unwrap();
        assert_eq!(first, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Within the TTL the cache answers.
        let second = resolver.resolve("Example.COM").await.unwrap();
        assert_eq!(second, first);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Past the TTL the entry is gone and the server is asked again.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(resolver.cached("example.com").is_none());
        let third = resolver.resolve("example.com").await.unwrap();
        assert_eq!(third, first);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        scheduler.stop();
    }

    #[tokio::test]
    async fn test_first_success_wins_across_servers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let live = mock_server([10, 0, 0, 7], 30, Arc::clone(&hits)).await;
        // A dead socket address nobody answers on.
        let dead = {
            let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            s.local_addr().unwrap()
        };

        let scheduler = Scheduler::new();
        let resolver = DnsResolver::new(
            &[dead.to_string(), live.to_string()],
            scheduler.clone(),
        )
        .unwrap()
        .with_query_timeout(Duration::from_millis(500));

        let ip = resolver.resolve("service.internal").await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_all_failures_surface_unknown_domain() {
        let dead = {
            let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            s.local_addr().unwrap()
        };
        let scheduler = Scheduler::new();
        let resolver = DnsResolver::new(&[dead.to_string()], scheduler.clone())
            .unwrap()
            .with_query_timeout(Duration::from_millis(200));

        let result = resolver.resolve("nope.example").await;
        assert!(matches!(result, Err(ClusterError::UnknownDomain(_))));
        // Failures are never cached.
        assert!(resolver.cached("nope.example").is_none());
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_localhost_is_seeded() {
        let scheduler = Scheduler::new();
        let resolver =
            DnsResolver::new(&["127.0.0.1:1".to_string()], scheduler.clone()).unwrap();
        assert_eq!(
            resolver.resolve("localhost").await.unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_ip_literals_resolve_to_themselves() {
        let scheduler = Scheduler::new();
        let resolver =
            DnsResolver::new(&["127.0.0.1".to_string()], scheduler.clone()).unwrap();
        assert_eq!(
            resolver.resolve("10.1.2.3").await.unwrap(),
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))
        );
        scheduler.stop();
    }

    #[test]
    fn test_invalid_server_rejected() {
        let scheduler = Scheduler::new();
        let result = DnsResolver::new(&["not an address".to_string()], scheduler);
        assert!(matches!(result, Err(ClusterError::InvalidIpAddress(_))));
    }

    #[test]
    fn test_empty_server_list_rejected() {
        let scheduler = Scheduler::new();
        assert!(matches!(
            DnsResolver::new(&[], scheduler),
            Err(ClusterError::Configuration(_))
        ));
    }
}
