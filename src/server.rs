use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::core::{DhtNetwork, DhtNode};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{Rpc, RpcKind};

/// Accept inbound connections forever, one task per connection.
///
/// Only returns if the listener itself fails.
pub async fn serve<N: DhtNetwork>(node: Arc<DhtNode<N>>, listener: TcpListener) -> Result<()> {
    info!(addr = %listener.local_addr()?, "accepting DHT connections");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                // Per-connection accept errors (e.g. the peer reset) are not fatal.
                warn!("failed to accept connection: {err}");
                continue;
            }
        };
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(node, stream).await {
                debug!(%peer, "connection failed: {err:?}");
            }
        });
    }
}

/// Handles a single inbound connection: one request frame, one reply frame.
///
/// The sender of every request is reported to the routing table before the
/// request is answered.
pub async fn handle_connection<N, S>(node: Arc<DhtNode<N>>, mut stream: S) -> Result<()>
where
    N: DhtNetwork,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(bytes) = read_frame(&mut stream).await? else {
        return Ok(());
    };
    let rpc: Rpc = serde_json::from_slice(&bytes)?;
    let from = rpc.from;

    let reply_kind = match rpc.kind {
        RpcKind::Ping => {
            node.handle_ping(&from).await;
            RpcKind::Pong
        }
        RpcKind::FindNode { target } => {
            let nodes = node.handle_find_node_request(&from, target).await;
            RpcKind::Nodes { nodes }
        }
        RpcKind::Deliver { message } => match node.handle_deliver_request(&from, message).await {
            Ok(()) => RpcKind::Ack,
            Err(err) => RpcKind::Error {
                reason: err.to_string(),
            },
        },
        RpcKind::Pong | RpcKind::Nodes { .. } | RpcKind::Ack | RpcKind::Error { .. } => {
            // Replies never arrive as requests; answer with an error so the
            // peer does not wait for a response that will not come.
            RpcKind::Error {
                reason: "unexpected reply sent as a request".into(),
            }
        }
    };

    let reply = Rpc::new(node.self_contact.clone(), reply_kind);
    let reply_bytes = serde_json::to_vec(&reply)?;
    write_frame(&mut stream, &reply_bytes).await?;
    Ok(())
}
