//! Peer transport façade: pooled connections keyed by address.
//!
//! Components never talk to a transport directly; they ask the
//! [`PoolRegistry`] for the pool of an address and take a health-checked
//! [`PeerClient`] handle from it. The registry is constructed explicitly at
//! node startup and its lifecycle ends with the node; there are no
//! process-wide singletons.

use crate::error::{BasaltError, Result};
use crate::storage::ReadEntriesResult;
use crate::types::{Block, CopyHeader, ExtentId};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A `CopyExtent` stream as seen by the receiving side: the decoded header,
/// then the raw payload bytes in chunks.
pub struct CopyStream {
    pub header: CopyHeader,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Unary and streaming calls a node issues against one peer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Secondary-side append: apply `blocks` provided the peer's commit
    /// length equals `commit`.
    async fn replicate_blocks(
        &self,
        extent_id: ExtentId,
        commit: u32,
        blocks: Vec<Block>,
    ) -> Result<(Vec<u32>, u32)>;

    /// Open a sealed-extent byte stream.
    async fn copy_extent(&self, extent_id: ExtentId) -> Result<CopyStream>;

    /// Fetch block entries for WAL-style replay.
    async fn read_entries(
        &self,
        extent_id: ExtentId,
        offset: u32,
        replay: bool,
    ) -> Result<ReadEntriesResult>;

    /// Liveness probe.
    async fn ping(&self) -> bool;
}

/// Factory turning an address into a connected [`PeerClient`].
pub trait Connector: Send + Sync {
    fn connect(&self, addr: &str) -> Result<Arc<dyn PeerClient>>;
}

/// Health-tracked connection pool for one peer address.
pub struct Pool {
    addr: String,
    client: Arc<dyn PeerClient>,
    healthy: AtomicBool,
    last_check: Mutex<Option<Instant>>,
    check_interval: Duration,
}

impl Pool {
    fn new(addr: String, client: Arc<dyn PeerClient>, check_interval: Duration) -> Self {
        Self {
            addr,
            client,
            healthy: AtomicBool::new(false),
            last_check: Mutex::new(None),
            check_interval,
        }
    }

    pub fn address(&self) -> &str {
        &self.addr
    }

    /// Last observed health, without probing.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Return the peer handle, probing first when the last check has aged
    /// out. An unhealthy peer yields an error, never a stale handle.
    pub async fn healthy_client(&self) -> Result<Arc<dyn PeerClient>> {
        let due = {
            let last = self.last_check.lock();
            match *last {
                None => true,
                Some(at) => at.elapsed() >= self.check_interval,
            }
        };

        if due {
            let alive = self.client.ping().await;
            self.healthy.store(alive, Ordering::SeqCst);
            *self.last_check.lock() = Some(Instant::now());
            debug!(addr = %self.addr, alive, "peer health probe");
        }

        if self.is_healthy() {
            Ok(Arc::clone(&self.client))
        } else {
            Err(BasaltError::PeerUnhealthy(self.addr.clone()))
        }
    }
}

/// Process-wide registry of peer pools, keyed by address.
pub struct PoolRegistry {
    connector: Box<dyn Connector>,
    check_interval: Duration,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl PoolRegistry {
    pub fn new(connector: Box<dyn Connector>, check_interval: Duration) -> Self {
        Self {
            connector,
            check_interval,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Pool for `addr`, connecting on first use. A connect failure surfaces
    /// as `PeerUnhealthy`.
    pub fn get(&self, addr: &str) -> Result<Arc<Pool>> {
        if let Some(pool) = self.pools.read().get(addr) {
            return Ok(Arc::clone(pool));
        }

        let client = self
            .connector
            .connect(addr)
            .map_err(|e| BasaltError::PeerUnhealthy(format!("{}: {}", addr, e)))?;
        let pool = Arc::new(Pool::new(addr.to_string(), client, self.check_interval));

        let mut pools = self.pools.write();
        Ok(Arc::clone(
            pools.entry(addr.to_string()).or_insert(pool),
        ))
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }

    /// Drop every pool; part of node shutdown.
    pub fn close(&self) {
        self.pools.write().clear();
    }
}
