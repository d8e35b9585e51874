#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

use kadmesh::{Contact, DhtConfig, DhtNetwork, DhtNode, Message, NodeId};

/// In-memory network: every call is dispatched straight to the target node
/// registered in the shared [`NetworkRegistry`].
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_contact: Contact,
    latencies: Arc<Mutex<HashMap<NodeId, Duration>>>,
    ping_latencies: Arc<Mutex<HashMap<NodeId, Duration>>>,
    failures: Arc<Mutex<HashSet<NodeId>>>,
    pings: Arc<Mutex<Vec<NodeId>>>,
    queries: Arc<Mutex<Vec<NodeId>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
        Self {
            registry,
            self_contact,
            latencies: Arc::new(Mutex::new(HashMap::new())),
            ping_latencies: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_latency(&self, node: NodeId, latency: Duration) {
        let mut latencies = self.latencies.lock().await;
        latencies.insert(node, latency);
    }

    /// Extra delay applied to pings only, on top of any [`Self::set_latency`].
    pub async fn set_ping_latency(&self, node: NodeId, latency: Duration) {
        let mut latencies = self.ping_latencies.lock().await;
        latencies.insert(node, latency);
    }

    pub async fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    pub async fn ping_calls(&self) -> Vec<NodeId> {
        let calls = self.pings.lock().await;
        calls.clone()
    }

    pub async fn query_calls(&self) -> Vec<NodeId> {
        let calls = self.queries.lock().await;
        calls.clone()
    }

    async fn should_fail(&self, node: &NodeId) -> bool {
        let failures = self.failures.lock().await;
        failures.contains(node)
    }

    async fn maybe_sleep(&self, node: &NodeId) {
        let latency = {
            let latencies = self.latencies.lock().await;
            latencies.get(node).copied()
        };
        if let Some(delay) = latency {
            sleep(delay).await;
        }
    }

    async fn reachable(&self, to: &Contact) -> Result<Arc<DhtNode<TestNetwork>>> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        self.maybe_sleep(&to.id).await;
        self.registry
            .get(&to.id)
            .await
            .ok_or_else(|| anyhow!("peer not reachable"))
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<NodeId, Arc<DhtNode<TestNetwork>>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &Arc<DhtNode<TestNetwork>>) {
        let mut peers = self.peers.write().await;
        peers.insert(node.id, node.clone());
    }

    pub async fn unregister(&self, id: &NodeId) {
        let mut peers = self.peers.write().await;
        peers.remove(id);
    }

    pub async fn get(&self, id: &NodeId) -> Option<Arc<DhtNode<TestNetwork>>> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }
}

#[async_trait::async_trait]
impl DhtNetwork for TestNetwork {
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        {
            let mut calls = self.queries.lock().await;
            calls.push(to.id);
        }
        let peer = self.reachable(to).await?;
        Ok(peer
            .handle_find_node_request(&self.self_contact, target)
            .await)
    }

    async fn ping(&self, to: &Contact) -> Result<()> {
        {
            let mut calls = self.pings.lock().await;
            calls.push(to.id);
        }
        let peer = self.reachable(to).await?;
        let extra = {
            let latencies = self.ping_latencies.lock().await;
            latencies.get(&to.id).copied()
        };
        if let Some(delay) = extra {
            sleep(delay).await;
        }
        peer.handle_ping(&self.self_contact).await;
        Ok(())
    }

    async fn deliver(&self, to: &Contact, message: Message) -> Result<()> {
        let peer = self.reachable(to).await?;
        peer.handle_deliver_request(&self.self_contact, message)
            .await
            .map_err(|err| anyhow!(err))
    }
}

pub struct TestNode {
    pub node: Arc<DhtNode<TestNetwork>>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, k: usize, alpha: usize) -> Self {
        let config = DhtConfig {
            id_bits: 64,
            k,
            alpha,
            ..DhtConfig::default()
        };
        Self::with_config(registry, make_contact(index), config).await
    }

    pub async fn with_config(
        registry: Arc<NetworkRegistry>,
        contact: Contact,
        config: DhtConfig,
    ) -> Self {
        let network = TestNetwork::new(registry.clone(), contact.clone());
        let node = Arc::new(
            DhtNode::new(contact, network.clone(), config).expect("valid test configuration"),
        );
        registry.register(&node).await;
        Self { node, network }
    }

    pub fn contact(&self) -> Contact {
        self.node.self_contact.clone()
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }
}

/// A 64-bit id whose top 32 bits are `index`.
pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 32];
    id[24..28].copy_from_slice(&index.to_be_bytes());
    id
}

pub fn make_contact(index: u32) -> Contact {
    Contact::new(make_node_id(index), format!("node-{index}"))
}
