// Peer channel lifecycle
//
// Every channel, inbound or outbound, follows the same sequence: send our
// Hello, hold the channel pending until the peer's Hello arrives within the
// hello timeout, then register the link and pump frames. Unknown senders
// are learned from the channel's remote address, and the AddNode is routed
// before the link registers so topology always hears about a peer before
// the first protocol message from it.

use crate::common::{NodeAddress, NodeId, NodeInfo};
use crate::error::{ClusterError, Result};
use crate::net::codec;
use crate::net::registry::LinkHandle;
use crate::net::NetContext;
use crate::router::LocalEvent;
use crate::wire::{WireMessage, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};

/// Drive one peer channel to completion. `expected` is the dialed peer id
/// for outbound channels and None for inbound ones.
pub(crate) async fn run_channel<S>(
    stream: S,
    remote: SocketAddr,
    expected: Option<NodeId>,
    ctx: Arc<NetContext>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let link_id = ctx.registry.next_link_id();
    ctx.pending.insert(link_id, ());

    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let max_frame = ctx.config.max_frame_size;

    let writer_ctx = Arc::clone(&ctx);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match codec::write_frame(&mut writer, &frame, max_frame).await {
                Ok(()) => {
                    writer_ctx.stats.frames_out.fetch_add(1, Ordering::Relaxed);
                    writer_ctx.stats.bytes_out.fetch_add(
                        (frame.len() + codec::LENGTH_PREFIX_SIZE) as u64,
                        Ordering::Relaxed,
                    );
                }
                Err(e) => {
                    tracing::debug!(error = %e, "peer channel write failed");
                    break;
                }
            }
        }
    });

    let established = establish(&mut reader, &tx, remote, expected.as_ref(), &ctx).await;
    ctx.pending.remove(&link_id);

    let (peer_id, newly_learned) = match established {
        Ok(result) => result,
        Err(e) => {
            match &expected {
                Some(id) => {
                    tracing::warn!(peer = %id, error = %e, "handshake failed");
                    ctx.router.route_local(LocalEvent::ConnectionFailed {
                        node_id: id.clone(),
                        reason: e.to_string(),
                    });
                }
                None => {
                    tracing::debug!(%remote, error = %e, "inbound channel dropped before Hello")
                }
            }
            writer_task.abort();
            return;
        }
    };

    let close = Arc::new(Notify::new());
    let handle = LinkHandle {
        link_id,
        node_id: peer_id.clone(),
        tx: tx.clone(),
        close: Arc::clone(&close),
    };
    if !ctx.registry.register(handle) {
        // A link for this peer already exists (simultaneous dial); the new
        // channel loses and is simply closed.
        tracing::debug!(peer = %peer_id, "duplicate link, closing new channel");
        writer_task.abort();
        return;
    }

    tracing::info!(peer = %peer_id, %remote, "connection established");
    ctx.router.route_local(LocalEvent::ConnectionEstablished {
        node_id: peer_id.clone(),
    });
    ctx.router.route_local(LocalEvent::ViewChanged {
        view: ctx.registry.view(),
    });
    ctx.registry
        .update_quorum(ctx.topology.cluster_size(), &ctx.router);

    if newly_learned {
        // Bootstrap topology through the freshly learned peer.
        if let Ok(payload) = ctx.serializer.serialize(&WireMessage::DiscoverNodes {
            sender: ctx.self_id.clone(),
        }) {
            let _ = tx.send(payload);
        }
    }

    loop {
        tokio::select! {
            frame = codec::read_frame(&mut reader, max_frame) => match frame {
                Ok(Some(payload)) => {
                    ctx.stats.frames_in.fetch_add(1, Ordering::Relaxed);
                    ctx.stats.bytes_in.fetch_add(
                        (payload.len() + codec::LENGTH_PREFIX_SIZE) as u64,
                        Ordering::Relaxed,
                    );
                    match ctx.serializer.deserialize(&payload) {
                        Ok(WireMessage::Hello { .. }) => {
                            tracing::debug!(peer = %peer_id, "ignoring repeated Hello");
                        }
                        Ok(message) => ctx.router.route_wire(message),
                        Err(e) => {
                            tracing::warn!(peer = %peer_id, error = %e, "closing channel on undecodable frame");
                            break;
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!(peer = %peer_id, "peer closed channel");
                    break;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer_id, error = %e, "closing channel on read error");
                    break;
                }
            },
            _ = close.notified() => {
                tracing::debug!(peer = %peer_id, "channel close requested");
                break;
            }
        }
    }

    writer_task.abort();
    if ctx.registry.remove_if(&peer_id, link_id) {
        ctx.router.route_local(LocalEvent::ConnectionClosed {
            node_id: peer_id.clone(),
        });
        ctx.router.route_local(LocalEvent::ViewChanged {
            view: ctx.registry.view(),
        });
        ctx.registry
            .update_quorum(ctx.topology.cluster_size(), &ctx.router);
    }
}

/// Hello exchange. No other message is dispatched from a pending channel.
async fn establish<R>(
    reader: &mut R,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    remote: SocketAddr,
    expected: Option<&NodeId>,
    ctx: &Arc<NetContext>,
) -> Result<(NodeId, bool)>
where
    R: AsyncRead + Unpin,
{
    let hello = WireMessage::Hello {
        sender: ctx.self_id.clone(),
        protocol_version: PROTOCOL_VERSION,
    };
    let payload = ctx.serializer.serialize(&hello)?;
    tx.send(payload)
        .map_err(|_| ClusterError::ChannelInactive("writer task gone".to_string()))?;

    let timeout = ctx.config.hello_timeout;
    let frame = tokio::time::timeout(
        timeout,
        codec::read_frame(reader, ctx.config.max_frame_size),
    )
    .await
    .map_err(|_| ClusterError::HelloTimeout(timeout.as_millis() as u64))??
    .ok_or_else(|| ClusterError::Network("channel closed before Hello".to_string()))?;
    ctx.stats.frames_in.fetch_add(1, Ordering::Relaxed);
    ctx.stats.bytes_in.fetch_add(
        (frame.len() + codec::LENGTH_PREFIX_SIZE) as u64,
        Ordering::Relaxed,
    );

    let (sender, protocol_version) = match ctx.serializer.deserialize(&frame)? {
        WireMessage::Hello {
            sender,
            protocol_version,
        } => (sender, protocol_version),
        other => {
            return Err(ClusterError::Network(format!(
                "expected Hello, got {:?}",
                other.kind()
            )))
        }
    };

    if protocol_version != PROTOCOL_VERSION {
        return Err(ClusterError::Network(format!(
            "protocol version mismatch: ours {}, theirs {}",
            PROTOCOL_VERSION, protocol_version
        )));
    }
    if sender == ctx.self_id {
        return Err(ClusterError::Network(
            "peer identified as ourselves".to_string(),
        ));
    }
    if let Some(dialed) = expected {
        if *dialed != sender {
            tracing::warn!(dialed = %dialed, identified = %sender, "peer identity differs from dialed id");
        }
    }

    let newly_learned = !ctx.topology.contains(&sender);
    if newly_learned {
        let info = NodeInfo {
            id: sender.clone(),
            address: NodeAddress::new(remote.ip().to_string(), remote.port()),
        };
        ctx.router.route_wire(WireMessage::AddNode { node: info });
    }

    Ok((sender, newly_learned))
}
