//! DHT protocol message definitions.
//!
//! Every exchange is one [`Rpc`] request answered by one [`Rpc`] reply. Both
//! carry the sender's contact so the receiving side can record a sighting.

use serde::{Deserialize, Serialize};

use crate::core::{Contact, Message, NodeId};

/// An RPC envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rpc {
    /// The sender's contact information.
    pub from: Contact,
    pub kind: RpcKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcKind {
    /// Liveness check.
    Ping,
    /// Reply to [`RpcKind::Ping`].
    Pong,
    /// Ask for the closest known contacts to `target`.
    FindNode { target: NodeId },
    /// Reply to [`RpcKind::FindNode`].
    Nodes { nodes: Vec<Contact> },
    /// Hand a message to its receiver.
    Deliver { message: Message },
    /// Reply to [`RpcKind::Deliver`].
    Ack,
    /// The request was understood but refused.
    Error { reason: String },
}

impl Rpc {
    pub fn new(from: Contact, kind: RpcKind) -> Self {
        Self { from, kind }
    }
}
