//! Client seam to the cluster metadata manager.
//!
//! The manager itself is an external service: it owns extent placement,
//! assigns sealed lengths, and schedules recovery. Nodes only ever consume
//! immutable [`ExtentInfo`] snapshots and hand back recovery tasks, so the
//! surface is a small trait. [`StaticManager`] is the in-process
//! implementation used by tests and single-process clusters.

use crate::cluster::AllocExtentPolicy;
use crate::error::{BasaltError, Result};
use crate::types::{ExtentId, ExtentInfo, NodeId, NodeStatus, RecoveryTask};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

/// Slot index of `replace_id` within `replicates ∪ parity`, or `None` when
/// the task targeting it has become obsolete.
pub fn find_replace_slot(info: &ExtentInfo, replace_id: NodeId) -> Option<usize> {
    info.slots().position(|id| id == replace_id)
}

/// Manager-facing operations a storage node depends on.
#[async_trait]
pub trait ManagerClient: Send + Sync {
    /// Latest placement snapshot for an extent.
    async fn extent_info(&self, extent_id: ExtentId) -> Result<ExtentInfo>;

    /// Peer addresses aligned with the extent's slots (replicates first,
    /// then parity).
    async fn peers_of(&self, extent_id: ExtentId) -> Result<Vec<String>>;

    /// Hand a recovery task to the manager for later scheduling. Callers
    /// bound this with their configured submit deadline.
    async fn submit_recovery_task(&self, task: RecoveryTask) -> Result<()>;
}

#[derive(Default)]
struct StaticManagerState {
    extents: HashMap<ExtentId, ExtentInfo>,
    addresses: HashMap<NodeId, String>,
    submitted: Vec<RecoveryTask>,
}

/// In-process manager with a hand-maintained registry.
#[derive(Default)]
pub struct StaticManager {
    policy: AllocExtentPolicy,
    state: RwLock<StaticManagerState>,
}

impl StaticManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: AllocExtentPolicy) -> Self {
        Self {
            policy,
            state: RwLock::default(),
        }
    }

    /// Place a new replication extent across `count` of the given candidate
    /// nodes, excluding the keep set, and record the resulting snapshot.
    pub fn place_extent(
        &self,
        extent_id: ExtentId,
        candidates: &[NodeStatus],
        count: usize,
        keep: &[NodeId],
    ) -> Result<ExtentInfo> {
        let picked = self.policy.alloc_extent(candidates, count, keep)?;
        let info = ExtentInfo {
            extent_id,
            replicates: picked.iter().map(|n| n.node_id).collect(),
            parity: Vec::new(),
            sealed_length: 0,
        };
        self.state.write().extents.insert(extent_id, info.clone());
        Ok(info)
    }

    pub fn register_node(&self, node_id: NodeId, address: impl Into<String>) {
        self.state.write().addresses.insert(node_id, address.into());
    }

    /// Insert or replace an extent's placement snapshot.
    pub fn register_extent(&self, info: ExtentInfo) {
        self.state.write().extents.insert(info.extent_id, info);
    }

    /// Record the manager-assigned sealed length for an extent.
    pub fn seal_extent(&self, extent_id: ExtentId, sealed_length: u32) {
        if let Some(info) = self.state.write().extents.get_mut(&extent_id) {
            info.sealed_length = sealed_length;
        }
    }

    /// Recovery tasks submitted by nodes so far.
    pub fn submitted_tasks(&self) -> Vec<RecoveryTask> {
        self.state.read().submitted.clone()
    }
}

#[async_trait]
impl ManagerClient for StaticManager {
    async fn extent_info(&self, extent_id: ExtentId) -> Result<ExtentInfo> {
        self.state
            .read()
            .extents
            .get(&extent_id)
            .cloned()
            .ok_or(BasaltError::NotFound(extent_id))
    }

    async fn peers_of(&self, extent_id: ExtentId) -> Result<Vec<String>> {
        let state = self.state.read();
        let info = state
            .extents
            .get(&extent_id)
            .ok_or(BasaltError::NotFound(extent_id))?;
        info.slots()
            .map(|node_id| {
                state.addresses.get(&node_id).cloned().ok_or_else(|| {
                    BasaltError::Internal(format!("no address registered for node {}", node_id))
                })
            })
            .collect()
    }

    async fn submit_recovery_task(&self, task: RecoveryTask) -> Result<()> {
        info!(
            extent_id = task.extent_id,
            replace_id = task.replace_id,
            "recovery task submitted"
        );
        self.state.write().submitted.push(task);
        Ok(())
    }
}
