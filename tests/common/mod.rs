//! Shared in-process cluster harness.
//!
//! Nodes are wired through loopback peer clients instead of sockets: each
//! node's pool registry resolves addresses against a shared, mutable peer
//! map, so tests can cut and restore links to simulate node failures.

use async_trait::async_trait;
use basalt::cluster::{ManagerClient, StaticManager};
use basalt::config::BasaltConfig;
use basalt::node::ExtentNode;
use basalt::pool::{Connector, CopyStream, PeerClient, PoolRegistry};
use basalt::storage::ReadEntriesResult;
use basalt::types::{Block, ErasureConfig, ExtentId, NodeId};
use basalt::{BasaltError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared address book of live peers.
#[derive(Clone, Default)]
pub struct PeerMap {
    inner: Arc<RwLock<HashMap<String, Arc<dyn PeerClient>>>>,
}

impl PeerMap {
    pub fn insert(&self, addr: impl Into<String>, client: Arc<dyn PeerClient>) {
        self.inner.write().insert(addr.into(), client);
    }

    pub fn remove(&self, addr: &str) {
        self.inner.write().remove(addr);
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.inner.read().contains_key(addr)
    }

    fn get(&self, addr: &str) -> Option<Arc<dyn PeerClient>> {
        self.inner.read().get(addr).cloned()
    }
}

struct MapConnector {
    map: PeerMap,
}

impl Connector for MapConnector {
    fn connect(&self, addr: &str) -> Result<Arc<dyn PeerClient>> {
        self.map
            .get(addr)
            .ok_or_else(|| BasaltError::Network(format!("no route to {}", addr)))
    }
}

/// Peer client calling straight into another node's methods.
pub struct LoopbackPeer {
    addr: String,
    node: Arc<ExtentNode>,
    map: PeerMap,
}

#[async_trait]
impl PeerClient for LoopbackPeer {
    async fn replicate_blocks(
        &self,
        extent_id: ExtentId,
        commit: u32,
        blocks: Vec<Block>,
    ) -> Result<(Vec<u32>, u32)> {
        if !self.map.contains(&self.addr) {
            return Err(BasaltError::Network(format!("no route to {}", self.addr)));
        }
        self.node.replicate_blocks(extent_id, commit, blocks).await
    }

    async fn copy_extent(&self, extent_id: ExtentId) -> Result<CopyStream> {
        if !self.map.contains(&self.addr) {
            return Err(BasaltError::Network(format!("no route to {}", self.addr)));
        }
        Ok(self.node.copy_extent(extent_id).await)
    }

    async fn read_entries(
        &self,
        extent_id: ExtentId,
        offset: u32,
        replay: bool,
    ) -> Result<ReadEntriesResult> {
        if !self.map.contains(&self.addr) {
            return Err(BasaltError::Network(format!("no route to {}", self.addr)));
        }
        self.node.read_entries(extent_id, offset, replay)
    }

    async fn ping(&self) -> bool {
        self.map.contains(&self.addr)
    }
}

/// A secondary that acknowledges appends at fabricated offsets without
/// writing anything, to force divergence.
pub struct DivergentPeer;

#[async_trait]
impl PeerClient for DivergentPeer {
    async fn replicate_blocks(
        &self,
        _extent_id: ExtentId,
        _commit: u32,
        _blocks: Vec<Block>,
    ) -> Result<(Vec<u32>, u32)> {
        Ok((vec![0, 999], 999))
    }

    async fn copy_extent(&self, extent_id: ExtentId) -> Result<CopyStream> {
        Err(BasaltError::NotFound(extent_id))
    }

    async fn read_entries(
        &self,
        extent_id: ExtentId,
        _offset: u32,
        _replay: bool,
    ) -> Result<ReadEntriesResult> {
        Err(BasaltError::NotFound(extent_id))
    }

    async fn ping(&self) -> bool {
        true
    }
}

pub struct TestCluster {
    pub manager: Arc<StaticManager>,
    pub nodes: Vec<Arc<ExtentNode>>,
    pub peers: PeerMap,
    dirs: Vec<tempfile::TempDir>,
}

pub fn addr_of(node_id: NodeId) -> String {
    format!("node-{}", node_id)
}

/// Build `n` nodes (IDs 1..=n) with a fast recovery retry and a 4+2 erasure
/// configuration over 64 KiB cells.
pub fn build_cluster(n: usize) -> TestCluster {
    let manager = Arc::new(StaticManager::new());
    let peers = PeerMap::default();
    let mut nodes = Vec::with_capacity(n);
    let mut dirs = Vec::with_capacity(n);

    for i in 1..=n as NodeId {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = BasaltConfig::development();
        config.node.id = i;
        config.node.name = format!("test-node-{}", i);
        config.node.data_dirs = vec![dir.path().to_path_buf()];
        config.recovery.retry_interval = Duration::from_millis(100);
        config.storage.erasure = ErasureConfig::DEFAULT;

        let pools = Arc::new(PoolRegistry::new(
            Box::new(MapConnector { map: peers.clone() }),
            Duration::from_millis(0),
        ));
        let node = ExtentNode::new(
            config,
            pools,
            Arc::clone(&manager) as Arc<dyn ManagerClient>,
        )
        .expect("node");

        manager.register_node(i, addr_of(i));
        peers.insert(
            addr_of(i),
            Arc::new(LoopbackPeer {
                addr: addr_of(i),
                node: Arc::clone(&node),
                map: peers.clone(),
            }),
        );
        nodes.push(node);
        dirs.push(dir);
    }

    TestCluster {
        manager,
        nodes,
        peers,
        dirs,
    }
}

impl TestCluster {
    pub fn node(&self, node_id: NodeId) -> &Arc<ExtentNode> {
        &self.nodes[(node_id - 1) as usize]
    }

    /// Data directory of one node.
    pub fn dir_of(&self, node_id: NodeId) -> &std::path::Path {
        self.dirs[(node_id - 1) as usize].path()
    }

    /// Cut a node off the loopback network.
    pub fn disconnect(&self, node_id: NodeId) {
        self.peers.remove(&addr_of(node_id));
    }

    /// Restore a previously cut node.
    pub fn reconnect(&self, node_id: NodeId) {
        let node = Arc::clone(self.node(node_id));
        self.peers.insert(
            addr_of(node_id),
            Arc::new(LoopbackPeer {
                addr: addr_of(node_id),
                node,
                map: self.peers.clone(),
            }),
        );
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Deterministic pseudo-random payload.
pub fn payload(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).max(1);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}
