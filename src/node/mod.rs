//! The storage node: extent registry, disk selection, and shared handles.

mod copy;
mod recovery;
pub mod rpc;
mod service;

pub use copy::{copy_stream_to_file, COPY_CHUNK_SIZE};

use crate::cluster::ManagerClient;
use crate::config::BasaltConfig;
use crate::error::{BasaltError, Result};
use crate::pool::PoolRegistry;
use crate::storage::{DiskFs, Extent};
use crate::types::{ExtentId, NodeId};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// One storage node's in-process state. The node owns its extent handles,
/// its pool registry, and a handle to the manager client; extents receive
/// manager snapshots by value.
pub struct ExtentNode {
    node_id: NodeId,
    config: BasaltConfig,
    disks: Vec<DiskFs>,
    extents: RwLock<HashMap<ExtentId, Arc<Extent>>>,
    pools: Arc<PoolRegistry>,
    manager: Arc<dyn ManagerClient>,
    recovery_task_num: AtomicI32,
}

impl ExtentNode {
    /// Build a node from configuration, scanning every disk for existing
    /// replicas.
    pub fn new(
        config: BasaltConfig,
        pools: Arc<PoolRegistry>,
        manager: Arc<dyn ManagerClient>,
    ) -> Result<Arc<Self>> {
        let mut disks = Vec::with_capacity(config.node.data_dirs.len());
        for dir in &config.node.data_dirs {
            disks.push(DiskFs::new(dir, config.storage.syncing_options())?);
        }

        let mut extents: HashMap<ExtentId, Arc<Extent>> = HashMap::new();
        for disk in &disks {
            for extent in disk.load_extents()? {
                let id = extent.id();
                if extents.contains_key(&id) {
                    warn!(
                        extent_id = id,
                        disk = %disk.root().display(),
                        "duplicate replica on a second disk, keeping the first"
                    );
                    continue;
                }
                extents.insert(id, Arc::new(extent));
            }
        }
        info!(
            node_id = config.node.id,
            disks = disks.len(),
            extents = extents.len(),
            "extent node initialised"
        );

        Ok(Arc::new(Self {
            node_id: config.node.id,
            config,
            disks,
            extents: RwLock::new(extents),
            pools,
            manager,
            recovery_task_num: AtomicI32::new(0),
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &BasaltConfig {
        &self.config
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    pub fn manager(&self) -> &Arc<dyn ManagerClient> {
        &self.manager
    }

    /// Node-local lookup; absence is a per-RPC `NotFound` for callers.
    pub fn get_extent(&self, extent_id: ExtentId) -> Option<Arc<Extent>> {
        self.extents.read().get(&extent_id).cloned()
    }

    /// Insert a handle into the registry, detecting ID collisions.
    pub fn register_extent(&self, extent: Arc<Extent>) -> Result<()> {
        let mut extents = self.extents.write();
        if extents.contains_key(&extent.id()) {
            return Err(BasaltError::AlreadyExists(extent.id()));
        }
        extents.insert(extent.id(), extent);
        Ok(())
    }

    /// In-flight recovery workers.
    pub fn recovery_task_count(&self) -> i32 {
        self.recovery_task_num.load(Ordering::SeqCst)
    }

    /// Uniform-random disk pick for new allocations.
    fn pick_disk(&self) -> &DiskFs {
        let i = rand::thread_rng().gen_range(0..self.disks.len());
        &self.disks[i]
    }
}
