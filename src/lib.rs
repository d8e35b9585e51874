//! # kadmesh
//!
//! This crate implements a Kademlia-style overlay used as the addressing layer
//! of a small peer-to-peer messaging system. Peers are named by fixed-width
//! identifiers, keep what they know about other peers in XOR-distance
//! buckets, find each other with an iterative FIND_NODE lookup, and then
//! exchange text messages directly.
//!
//! The crate is split into a handful of modules:
//!
//! - [`core`]: the transport-agnostic Kademlia logic, including the routing
//!   table, the eviction policy, and the [`DhtNode`] state machine.
//! - [`config`]: [`DhtConfig`], the identifier width, bucket capacity and
//!   lookup parallelism of a node.
//! - [`error`]: the [`DhtError`] taxonomy.
//! - [`net`]: a TCP based [`DhtNetwork`] implementation.
//! - [`protocol`]: the JSON serialisable wire messages exchanged between peers.
//! - [`framing`]: helpers for length-prefixed frames.
//! - [`server`]: the accept loop and per-connection request handling.
//!
//! ## Getting started
//!
//! Bind a listener, derive the node's identifier from its address, build a
//! [`TcpNetwork`] and a [`DhtNode`], then serve and drive the async methods
//! from your application:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use kadmesh::{derive_node_id, Contact, DhtConfig, DhtNode, TcpNetwork};
//! use tokio::net::TcpListener;
//!
//! # async fn launch() -> Result<()> {
//! let config = DhtConfig::default();
//! let listener = TcpListener::bind("127.0.0.1:8001").await?;
//! let addr = listener.local_addr()?.to_string();
//! let self_contact = Contact::new(derive_node_id(addr.as_bytes(), config.id_bits), addr);
//! let network = TcpNetwork::new(self_contact.clone(), config.connect_timeout());
//! let node = Arc::new(DhtNode::new(self_contact, network, config)?);
//! tokio::spawn(kadmesh::serve(node.clone(), listener));
//!
//! let peer = "127.0.0.1:8002";
//! node.observe_contact(Contact::new(derive_node_id(peer.as_bytes(), 64), peer))
//!     .await?;
//! node.send_message("hello", derive_node_id(peer.as_bytes(), 64)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces together into an
//! interactive peer.

pub mod config;
pub mod core;
pub mod error;
pub mod framing;
pub mod net;
pub mod protocol;
pub mod server;

pub use crate::config::DhtConfig;
pub use crate::core::{
    derive_node_id, distance_index, id_hex, xor_distance, Contact, DhtNetwork, DhtNode, Distance,
    Insertion, LookupOutcome, Message, NodeId, PendingEviction, RoutingTable, TelemetrySnapshot,
};
pub use crate::error::DhtError;
pub use crate::net::TcpNetwork;
pub use crate::server::{handle_connection, serve};
