//! Core DHT logic: transport-agnostic Kademlia routing, lookup and dispatch.
//!
//! This module contains the fundamental building blocks of the overlay:
//!
//! - **Identity & Metric**: [`NodeId`], [`derive_node_id`], [`xor_distance`],
//!   [`distance_index`]
//! - **Routing**: [`Contact`], [`RoutingTable`] and its k-buckets with the
//!   ping-before-evict rule
//! - **Network seam**: [`DhtNetwork`], implemented by the TCP transport and by
//!   in-memory test networks
//! - **Node State Machine**: [`DhtNode`] for sightings, iterative FIND_NODE and
//!   message delivery

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use iroh_blake3::Hasher;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{DhtConfig, MAX_ID_BITS};
use crate::error::DhtError;

// ============================================================================
// Type Aliases
// ============================================================================

/// A node identifier stored as a 256-bit big-endian unsigned integer.
///
/// A table configured for `B`-bit identifiers only uses the low `B` bits; the
/// leading `32 - B/8` bytes are zero. Keeping one container for every width
/// lets distances between identifiers be compared as plain byte arrays.
pub type NodeId = [u8; 32];

/// XOR distance between two [`NodeId`]s, big-endian.
///
/// Array ordering is numeric ordering, so distances sort with `Ord`.
pub type Distance = [u8; 32];

const ID_BYTES: usize = 32;

// ============================================================================
// Hashing Functions
// ============================================================================

/// Compute a 32-byte BLAKE3 digest of the input data.
fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable `bits`-wide [`NodeId`] by hashing arbitrary input with BLAKE3.
///
/// The first `bits / 8` digest bytes become the low bytes of the identifier.
/// Typically the seed is the node's `ip:port` address:
///
/// ```
/// use kadmesh::derive_node_id;
///
/// let id = derive_node_id(b"127.0.0.1:8001", 64);
/// assert!(id[..24].iter().all(|byte| *byte == 0));
/// assert_eq!(id, derive_node_id(b"127.0.0.1:8001", 64));
/// ```
pub fn derive_node_id(data: &[u8], bits: usize) -> NodeId {
    let bytes = bits.min(MAX_ID_BITS) / 8;
    let digest = blake3_digest(data);

    let mut out = [0u8; ID_BYTES];
    out[ID_BYTES - bytes..].copy_from_slice(&digest[..bytes]);
    out
}

/// Render an identifier as hex with its zero padding stripped.
pub fn id_hex(id: &NodeId) -> String {
    let first = id
        .iter()
        .position(|byte| *byte != 0)
        .unwrap_or(ID_BYTES - 1);
    hex::encode(&id[first..])
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// Compute the XOR distance between two node IDs.
///
/// # Properties
/// - `xor_distance(a, a) == [0; 32]`
/// - `xor_distance(a, b) == xor_distance(b, a)`
pub fn xor_distance(a: &NodeId, b: &NodeId) -> Distance {
    let mut out = [0u8; ID_BYTES];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Position of the most significant set bit of `xor_distance(a, b)`, counted
/// from the least significant bit. `None` when the identifiers are equal.
///
/// This is the index of the bucket `b` belongs to in `a`'s routing table.
pub fn distance_index(a: &NodeId, b: &NodeId) -> Option<usize> {
    let dist = xor_distance(a, b);
    dist.iter()
        .enumerate()
        .find(|(_, byte)| **byte != 0)
        .map(|(byte_idx, byte)| {
            let msb = 7 - byte.leading_zeros() as usize;
            (ID_BYTES - 1 - byte_idx) * 8 + msb
        })
}

// ============================================================================
// Contacts and Messages
// ============================================================================

/// Another node's routable identity as known locally.
///
/// `last_seen` is a process-local timestamp. It never goes over the wire; a
/// decoded contact is stamped with the decoding time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    /// The node's identifier.
    pub id: NodeId,
    /// Opaque transport address (`ip:port` for the TCP transport).
    pub addr: String,
    /// When this contact was last sighted.
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
}

impl Contact {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            last_seen: Instant::now(),
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

impl Eq for Contact {}

/// A text message exchanged between two nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Hex digest identifying this message.
    pub id: String,
    pub sender: NodeId,
    pub receiver: NodeId,
    pub content: String,
}

/// Distinguishes messages created within one clock tick.
static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

impl Message {
    pub fn new(sender: NodeId, receiver: NodeId, content: impl Into<String>) -> Self {
        let content = content.into();
        let sent_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();

        let mut hasher = Hasher::new();
        hasher.update(&sender);
        hasher.update(&receiver);
        hasher.update(content.as_bytes());
        hasher.update(&sent_at.to_be_bytes());
        hasher.update(&MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed).to_be_bytes());
        let digest = hasher.finalize();

        Self {
            id: hex::encode(&digest.as_bytes()[..16]),
            sender,
            receiver,
            content,
        }
    }
}

// ============================================================================
// Routing Table
// ============================================================================

/// A single Kademlia routing bucket.
///
/// Contacts are kept least recently seen first. A full bucket never drops a
/// contact on its own: it reports the eviction candidate and waits for the
/// outcome of a liveness probe.
#[derive(Debug, Default, Clone)]
struct Bucket {
    contacts: Vec<Contact>,
}

/// Outcome of attempting to add or refresh a contact in a bucket.
#[derive(Debug)]
enum BucketTouchOutcome {
    /// Contact was newly inserted (bucket had space).
    Inserted,
    /// Existing contact was refreshed (moved to the most recently seen end).
    Refreshed,
    /// Bucket is full; includes the least recently seen contact to probe.
    Full { new_contact: Contact, oldest: Contact },
}

/// A full-bucket insertion waiting for the liveness probe of `oldest`.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    pub bucket_index: usize,
    pub oldest: Contact,
    pub new_contact: Contact,
}

/// Result of [`RoutingTable::add`].
#[derive(Debug)]
pub enum Insertion {
    Inserted,
    Refreshed,
    /// The bucket is full: probe `oldest`, then call
    /// [`RoutingTable::complete_eviction`].
    Full(PendingEviction),
}

impl Bucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
        }
    }

    fn find(&self, id: &NodeId) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.id == id)
    }

    /// The contact with the oldest `last_seen`, first one on ties.
    fn least_recently_seen(&self) -> Option<&Contact> {
        self.contacts.iter().min_by_key(|c| c.last_seen)
    }

    /// Attempt to add or refresh a contact in the bucket.
    ///
    /// - If the id exists, its `last_seen` is refreshed and it moves to the end;
    ///   the stored address is kept
    /// - If the bucket has space, the contact is appended
    /// - If the bucket is full, nothing changes and the eviction candidate is returned
    fn touch(&mut self, contact: Contact, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            let mut existing = self.contacts.remove(pos);
            existing.last_seen = existing.last_seen.max(contact.last_seen);
            self.contacts.push(existing);
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(contact);
            BucketTouchOutcome::Inserted
        } else {
            let oldest = self
                .least_recently_seen()
                .cloned()
                .expect("bucket cannot be empty when full");
            BucketTouchOutcome::Full {
                new_contact: contact,
                oldest,
            }
        }
    }

    /// Mark a contact as seen at `now` and move it to the end.
    fn refresh(&mut self, id: &NodeId, now: Instant) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.id == id) {
            let mut existing = self.contacts.remove(pos);
            existing.last_seen = existing.last_seen.max(now);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.id == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }

    /// Second half of an eviction: apply the probe result for `pending.oldest`.
    ///
    /// Returns whether `pending.new_contact` is in the bucket afterwards. The
    /// bucket may have changed while the probe was in flight, so the state is
    /// re-validated here rather than trusted from [`Bucket::touch`].
    fn apply_probe_result(&mut self, pending: &PendingEviction, alive: bool, k: usize) -> bool {
        if alive {
            self.refresh(&pending.oldest.id, Instant::now());
        } else {
            self.remove(&pending.oldest.id);
        }

        if self.find(&pending.new_contact.id).is_some() {
            return true;
        }
        if alive || self.contacts.len() >= k {
            return false;
        }
        self.contacts.push(pending.new_contact.clone());
        true
    }
}

/// Kademlia routing table with one bucket per identifier bit.
///
/// Bucket `i` holds the contacts whose distance from the local node has its
/// most significant set bit at position `i`. The table itself is synchronous;
/// [`DhtNode`] owns it behind a lock and runs the liveness probe between
/// [`RoutingTable::add`] and [`RoutingTable::complete_eviction`] with the lock
/// released.
#[derive(Debug)]
pub struct RoutingTable {
    /// This node's ID.
    self_id: NodeId,
    /// Maximum contacts per bucket.
    k: usize,
    /// Identifier width in bits; also the number of buckets.
    id_bits: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Create an empty routing table for `self_id`.
    ///
    /// `k` is clamped to at least 1 and `id_bits` to `1..=256`.
    pub fn new(self_id: NodeId, k: usize, id_bits: usize) -> Self {
        let id_bits = id_bits.clamp(1, MAX_ID_BITS);
        Self {
            self_id,
            k: k.max(1),
            id_bits,
            buckets: (0..id_bits).map(|_| Bucket::new()).collect(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn id_bits(&self) -> usize {
        self.id_bits
    }

    /// Bucket index for `id`, or why it cannot be stored.
    fn index_for(&self, id: &NodeId) -> Result<usize, DhtError> {
        match distance_index(&self.self_id, id) {
            None => Err(DhtError::SelfContact),
            Some(idx) if idx >= self.id_bits => Err(DhtError::InvalidContact(format!(
                "{} is wider than {} bits",
                id_hex(id),
                self.id_bits
            ))),
            Some(idx) => Ok(idx),
        }
    }

    /// Add or refresh a contact.
    ///
    /// When the target bucket is full this does not mutate anything and
    /// returns [`Insertion::Full`] so the caller can probe the least recently
    /// seen contact.
    pub fn add(&mut self, contact: Contact) -> Result<Insertion, DhtError> {
        if contact.addr.is_empty() {
            return Err(DhtError::InvalidContact(format!(
                "{} has no address",
                id_hex(&contact.id)
            )));
        }
        let idx = self.index_for(&contact.id)?;
        match self.buckets[idx].touch(contact, self.k) {
            BucketTouchOutcome::Inserted => Ok(Insertion::Inserted),
            BucketTouchOutcome::Refreshed => Ok(Insertion::Refreshed),
            BucketTouchOutcome::Full {
                new_contact,
                oldest,
            } => Ok(Insertion::Full(PendingEviction {
                bucket_index: idx,
                oldest,
                new_contact,
            })),
        }
    }

    /// Apply the liveness probe result of a pending eviction.
    ///
    /// A live candidate is kept and refreshed; the new contact is then rejected
    /// with [`DhtError::BucketFull`].
    pub fn complete_eviction(
        &mut self,
        pending: PendingEviction,
        alive: bool,
    ) -> Result<(), DhtError> {
        let index = pending.bucket_index;
        let Some(bucket) = self.buckets.get_mut(index) else {
            return Err(DhtError::InvalidContact(format!(
                "bucket {index} does not exist"
            )));
        };
        if bucket.apply_probe_result(&pending, alive, self.k) {
            Ok(())
        } else {
            Err(DhtError::BucketFull { index })
        }
    }

    /// Look up a contact in the bucket its identifier maps to.
    pub fn find(&self, id: &NodeId) -> Option<Contact> {
        let idx = self.index_for(id).ok()?;
        self.buckets[idx].find(id).cloned()
    }

    /// The `count` known contacts closest to `target`, nearest first.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all = self.contacts();
        all.sort_by_key(|c| (xor_distance(&c.id, target), c.id));
        all.truncate(count);
        all
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, |b| b.contacts.len())
    }

    /// Contacts of one bucket, least recently seen first.
    pub fn bucket_contacts(&self, index: usize) -> &[Contact] {
        self.buckets
            .get(index)
            .map_or(&[][..], |b| b.contacts.as_slice())
    }

    pub fn non_empty_buckets(&self) -> usize {
        self.buckets
            .iter()
            .filter(|b| !b.contacts.is_empty())
            .count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Network Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Network abstraction for the RPCs the core needs.
///
/// This trait abstracts the transport layer, allowing the core logic to work
/// with different network implementations (TCP, in-memory mocks for testing).
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Ask `to` for its closest known contacts to `target`.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Check whether `to` is still reachable.
    ///
    /// Used for the Kademlia "ping-before-evict" rule. Callers bound the call
    /// with a timeout, so implementations may block on connection attempts.
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// Hand a message to `to`.
    async fn deliver(&self, to: &Contact, message: Message) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// DHT Node
// ─────────────────────────────────────────────────────────────────────────────

/// Result of an iterative lookup.
#[derive(Clone, Debug)]
pub struct LookupOutcome {
    /// The closest contacts found, nearest first, at most `k`.
    pub contacts: Vec<Contact>,
    /// Number of query rounds issued.
    pub rounds: usize,
    /// Number of distinct contacts queried.
    pub queried: usize,
}

/// Point-in-time view of a node for logs and diagnostics.
#[derive(Clone, Debug, Default)]
pub struct TelemetrySnapshot {
    pub contacts: usize,
    pub non_empty_buckets: usize,
    pub bucket_capacity: usize,
    pub id_bits: usize,
    pub concurrency: usize,
    pub messages: usize,
}

/// A peer in the overlay.
///
/// A `DhtNode` owns a routing table, the log of messages it received, and the
/// [`DhtNetwork`] used to reach other peers. The type is generic over the
/// network layer so tests can use an in-memory mock while production uses
/// [`crate::net::TcpNetwork`].
///
/// # Key Methods
///
/// * [`observe_contact`](Self::observe_contact) - Record a sighting, probing on full buckets
/// * [`iterative_find_node`](Self::iterative_find_node) - Converge on the closest contacts to a target
/// * [`send_message`](Self::send_message) - Resolve a peer's address and deliver a message
/// * [`handle_find_node_request`](Self::handle_find_node_request) - Handle incoming FIND_NODE RPC
/// * [`handle_deliver_request`](Self::handle_deliver_request) - Handle an incoming message
///
/// The node is `Arc`-friendly and can be shared between connection tasks.
pub struct DhtNode<N: DhtNetwork> {
    /// This node's unique identifier.
    pub id: NodeId,
    /// Contact info for this node.
    pub self_contact: Contact,
    config: DhtConfig,
    routing: Arc<Mutex<RoutingTable>>,
    network: Arc<N>,
    inbox: Mutex<Vec<Message>>,
}

impl<N: DhtNetwork> DhtNode<N> {
    /// Create a node with an empty routing table.
    pub fn new(self_contact: Contact, network: N, config: DhtConfig) -> Result<Self, DhtError> {
        config.validate()?;
        let id = self_contact.id;
        Ok(Self {
            id,
            self_contact,
            routing: Arc::new(Mutex::new(RoutingTable::new(id, config.k, config.id_bits))),
            network: Arc::new(network),
            inbox: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Record a sighting of `contact` now.
    ///
    /// If the contact's bucket is full, the least recently seen contact is
    /// pinged (bounded by the probe timeout, with the table unlocked) and only
    /// replaced when it does not answer. Dropping the returned future at any
    /// point leaves the table consistent.
    pub async fn observe_contact(&self, mut contact: Contact) -> Result<(), DhtError> {
        contact.last_seen = Instant::now();
        let pending = {
            let mut rt = self.routing.lock().await;
            match rt.add(contact)? {
                Insertion::Inserted | Insertion::Refreshed => return Ok(()),
                Insertion::Full(pending) => pending,
            }
        };
        finish_eviction(
            &self.routing,
            self.network.as_ref(),
            self.config.probe_timeout(),
            pending,
        )
        .await
    }

    /// Record a sighting from an inbound request or a lookup response.
    ///
    /// Never waits on the network: a full bucket hands its eviction probe to
    /// a background task, so answering a peer is never delayed by our own
    /// probe of some other peer.
    async fn record_sighting(&self, contact: &Contact) {
        let mut contact = contact.clone();
        contact.last_seen = Instant::now();
        let added = {
            let mut rt = self.routing.lock().await;
            rt.add(contact.clone())
        };
        match added {
            Ok(Insertion::Inserted | Insertion::Refreshed) => {}
            Ok(Insertion::Full(pending)) => self.spawn_bucket_refresh(pending),
            Err(err) => {
                debug!(peer = %id_hex(&contact.id), addr = %contact.addr, "sighting ignored: {err}")
            }
        }
    }

    /// Probe the eviction candidate of a full bucket in the background.
    fn spawn_bucket_refresh(&self, pending: PendingEviction) {
        let routing = self.routing.clone();
        let network = self.network.clone();
        let probe_timeout = self.config.probe_timeout();
        tokio::spawn(async move {
            // The outcome is logged by `finish_eviction`.
            let _ = finish_eviction(&routing, network.as_ref(), probe_timeout, pending).await;
        });
    }

    /// Send one FIND_NODE query, bounded by the query timeout.
    async fn query(&self, contact: &Contact, target: NodeId) -> Option<Vec<Contact>> {
        match timeout(
            self.config.query_timeout(),
            self.network.find_node(contact, target),
        )
        .await
        {
            Ok(Ok(nodes)) => Some(nodes),
            Ok(Err(err)) => {
                debug!(peer = %id_hex(&contact.id), "find_node failed: {err:?}");
                None
            }
            Err(_) => {
                debug!(peer = %id_hex(&contact.id), "find_node timed out");
                None
            }
        }
    }

    /// Handle an incoming FIND_NODE RPC request.
    ///
    /// Returns the k closest contacts to the target ID from our routing table.
    pub async fn handle_find_node_request(&self, from: &Contact, target: NodeId) -> Vec<Contact> {
        self.record_sighting(from).await;
        let rt = self.routing.lock().await;
        rt.find_closest(&target, self.config.k)
    }

    /// Handle an incoming PING.
    pub async fn handle_ping(&self, from: &Contact) {
        self.record_sighting(from).await;
    }

    /// Handle an incoming message: record the sender and append to the log.
    pub async fn handle_deliver_request(
        &self,
        from: &Contact,
        message: Message,
    ) -> Result<(), DhtError> {
        self.record_sighting(from).await;
        if message.receiver != self.id {
            warn!(
                from = %id_hex(&from.id),
                receiver = %id_hex(&message.receiver),
                "dropping misrouted message"
            );
            return Err(DhtError::MisroutedMessage);
        }
        info!(
            from = %id_hex(&message.sender),
            id = %message.id,
            "received message: {}",
            message.content
        );
        self.inbox.lock().await.push(message);
        Ok(())
    }

    /// Perform an iterative FIND_NODE lookup for the target ID.
    ///
    /// Returns up to k closest contacts found, nearest first.
    pub async fn iterative_find_node(&self, target: NodeId) -> Vec<Contact> {
        self.lookup(target).await.contacts
    }

    /// Perform an iterative FIND_NODE lookup and report how it went.
    ///
    /// The lookup process:
    /// 1. Seed the shortlist and the closest set from the routing table
    /// 2. Query every unvisited shortlist contact, at most alpha in flight
    /// 3. Merge the newly returned contacts into the closest set, keep k
    /// 4. Stop once the closest set no longer changes; otherwise the new
    ///    contacts become the next shortlist
    ///
    /// Every contact is queried at most once, so the loop ends after at most
    /// as many rounds as there are reachable contacts.
    pub async fn lookup(&self, target: NodeId) -> LookupOutcome {
        let k = self.config.k;
        let alpha = self.config.alpha;
        let mut closest = {
            let rt = self.routing.lock().await;
            rt.find_closest(&target, k)
        };
        let mut shortlist = closest.clone();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut rounds = 0;

        loop {
            let candidates: Vec<Contact> = shortlist
                .into_iter()
                .filter(|c| c.id != self.id && visited.insert(c.id))
                .collect();
            if candidates.is_empty() {
                break;
            }
            rounds += 1;

            let responses: Vec<(Contact, Option<Vec<Contact>>)> = stream::iter(candidates)
                .map(|contact| async move {
                    let nodes = self.query(&contact, target).await;
                    (contact, nodes)
                })
                .buffer_unordered(alpha)
                .collect()
                .await;

            let mut collected: HashSet<NodeId> = HashSet::new();
            let mut new_candidates = Vec::new();
            for (contact, nodes) in responses {
                let Some(nodes) = nodes else {
                    continue;
                };
                self.record_sighting(&contact).await;
                for node in nodes {
                    if node.id == self.id || visited.contains(&node.id) {
                        continue;
                    }
                    if collected.insert(node.id) {
                        new_candidates.push(node);
                    }
                }
            }

            let merged = merge_closest(&closest, &new_candidates, &target, k);
            if same_ids(&merged, &closest) {
                break;
            }
            closest = merged;
            shortlist = new_candidates;
        }

        debug!(
            target = %id_hex(&target),
            rounds,
            queried = visited.len(),
            found = closest.len(),
            "lookup converged"
        );
        LookupOutcome {
            contacts: closest,
            rounds,
            queried: visited.len(),
        }
    }

    /// Resolve a peer's contact: the routing table first, then a lookup.
    ///
    /// `None` means no address is known for `target`.
    pub async fn resolve(&self, target: NodeId) -> Option<Contact> {
        let known = {
            let rt = self.routing.lock().await;
            rt.find(&target)
        };
        if known.is_some() {
            return known;
        }
        self.lookup(target)
            .await
            .contacts
            .into_iter()
            .find(|c| c.id == target)
    }

    /// Resolve `target` and deliver `content` to it.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        target: NodeId,
    ) -> Result<Message, DhtError> {
        if target == self.id {
            return Err(DhtError::InvalidTarget);
        }
        let contact = self
            .resolve(target)
            .await
            .ok_or_else(|| DhtError::PeerNotFound(id_hex(&target)))?;

        let message = Message::new(self.id, target, content);
        timeout(
            self.config.query_timeout(),
            self.network.deliver(&contact, message.clone()),
        )
        .await
        .map_err(|_| anyhow!("delivery to {} timed out", contact.addr))??;

        debug!(to = %id_hex(&target), addr = %contact.addr, id = %message.id, "message delivered");
        Ok(message)
    }

    /// Join the overlay through `seeds` and look up our own ID.
    ///
    /// Returns the number of contacts known afterwards.
    pub async fn bootstrap(&self, seeds: Vec<Contact>) -> usize {
        for seed in seeds {
            if let Err(err) = self.observe_contact(seed.clone()).await {
                warn!(addr = %seed.addr, "bootstrap contact rejected: {err}");
            }
        }
        let outcome = self.lookup(self.id).await;
        for contact in &outcome.contacts {
            self.record_sighting(contact).await;
        }
        let known = self.routing.lock().await.len();
        info!(known, rounds = outcome.rounds, "bootstrap finished");
        known
    }

    /// Snapshot of every contact in the routing table.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.routing.lock().await.contacts()
    }

    /// Snapshot of the received message log.
    pub async fn messages(&self) -> Vec<Message> {
        self.inbox.lock().await.clone()
    }

    /// Get a snapshot of current node state for telemetry.
    pub async fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let (contacts, non_empty_buckets) = {
            let rt = self.routing.lock().await;
            (rt.len(), rt.non_empty_buckets())
        };
        let messages = self.inbox.lock().await.len();
        TelemetrySnapshot {
            contacts,
            non_empty_buckets,
            bucket_capacity: self.config.k,
            id_bits: self.config.id_bits,
            concurrency: self.config.alpha,
            messages,
        }
    }
}

/// Second half of an eviction: ping the candidate, then apply the result
/// under the lock.
async fn finish_eviction<N: DhtNetwork>(
    routing: &Mutex<RoutingTable>,
    network: &N,
    probe_timeout: Duration,
    pending: PendingEviction,
) -> Result<(), DhtError> {
    let alive = probe(network, &pending.oldest, probe_timeout).await;
    let oldest = pending.oldest.id;
    let newcomer = pending.new_contact.id;

    let mut rt = routing.lock().await;
    let result = rt.complete_eviction(pending, alive);
    match &result {
        Ok(()) if !alive => debug!(
            evicted = %id_hex(&oldest),
            peer = %id_hex(&newcomer),
            "replaced unreachable contact"
        ),
        Ok(()) => {}
        Err(err) => debug!(peer = %id_hex(&newcomer), "contact not added: {err}"),
    }
    result
}

/// Liveness probe for eviction. A timeout counts as unreachable.
async fn probe<N: DhtNetwork>(network: &N, contact: &Contact, probe_timeout: Duration) -> bool {
    match timeout(probe_timeout, network.ping(contact)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(
                peer = %id_hex(&contact.id),
                addr = %contact.addr,
                "ping failed: {err:?}"
            );
            false
        }
        Err(_) => {
            debug!(
                peer = %id_hex(&contact.id),
                addr = %contact.addr,
                "ping timed out"
            );
            false
        }
    }
}

/// `closest ∪ candidates`, deduplicated, nearest first, at most `k`.
fn merge_closest(
    closest: &[Contact],
    candidates: &[Contact],
    target: &NodeId,
    k: usize,
) -> Vec<Contact> {
    let mut seen = HashSet::new();
    let mut all: Vec<Contact> = closest
        .iter()
        .chain(candidates)
        .filter(|c| seen.insert(c.id))
        .cloned()
        .collect();
    all.sort_by_key(|c| (xor_distance(&c.id, target), c.id));
    all.truncate(k);
    all
}

fn same_ids(a: &[Contact], b: &[Contact]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id == y.id)
}
