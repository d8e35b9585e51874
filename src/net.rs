//! Network implementation over plain TCP.
//!
//! This module provides the [`TcpNetwork`] implementation of the [`DhtNetwork`]
//! trait. Each RPC opens a fresh connection to the contact's `ip:port`,
//! writes one request frame and reads one reply frame.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::core::{Contact, DhtNetwork, Message, NodeId};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{Rpc, RpcKind};

/// Network implementation using one TCP connection per RPC.
#[derive(Clone, Debug)]
pub struct TcpNetwork {
    /// Contact info for the local node (included in all RPC requests).
    pub self_contact: Contact,
    /// Budget for establishing a connection.
    pub connect_timeout: Duration,
}

impl TcpNetwork {
    pub fn new(self_contact: Contact, connect_timeout: Duration) -> Self {
        Self {
            self_contact,
            connect_timeout,
        }
    }

    /// Send `kind` to `to` and wait for the reply.
    async fn call(&self, to: &Contact, kind: RpcKind) -> Result<RpcKind> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&to.addr))
            .await
            .map_err(|_| anyhow!("connecting to {} timed out", to.addr))?
            .with_context(|| format!("connecting to {}", to.addr))?;

        let request = Rpc::new(self.self_contact.clone(), kind);
        let bytes = serde_json::to_vec(&request)?;
        write_frame(&mut stream, &bytes).await?;

        let reply = read_frame(&mut stream)
            .await?
            .ok_or_else(|| anyhow!("{} closed the connection without replying", to.addr))?;
        let reply: Rpc = serde_json::from_slice(&reply)?;
        if reply.from.id != to.id {
            bail!("{} answered as a different node", to.addr);
        }
        Ok(reply.kind)
    }
}

#[async_trait]
impl DhtNetwork for TcpNetwork {
    /// Send a FIND_NODE RPC to find contacts near a target ID.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        match self.call(to, RpcKind::FindNode { target }).await? {
            RpcKind::Nodes { nodes } => Ok(nodes),
            other => bail!("unexpected reply to FIND_NODE: {other:?}"),
        }
    }

    /// Send a PING RPC to check if a node is responsive.
    async fn ping(&self, to: &Contact) -> Result<()> {
        match self.call(to, RpcKind::Ping).await? {
            RpcKind::Pong => Ok(()),
            other => bail!("unexpected reply to PING: {other:?}"),
        }
    }

    /// Deliver a message and wait for the receiver's acknowledgment.
    async fn deliver(&self, to: &Contact, message: Message) -> Result<()> {
        match self.call(to, RpcKind::Deliver { message }).await? {
            RpcKind::Ack => Ok(()),
            RpcKind::Error { reason } => bail!("{} refused the message: {reason}", to.addr),
            other => bail!("unexpected reply to DELIVER: {other:?}"),
        }
    }
}
