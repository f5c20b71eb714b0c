//! Core type definitions for the Basalt extent store.
//!
//! The fundamental vocabulary shared by every layer of the node: extent and
//! node identifiers, the manager-supplied [`ExtentInfo`] snapshot, recovery
//! tasks, placement inputs, wire result codes, and the erasure-coding
//! parameters.
//!
//! # Key Types
//!
//! - [`ExtentInfo`]: immutable placement snapshot received from the metadata
//!   manager and passed around by value
//! - [`RecoveryTask`]: a manager-initiated request to rebuild one replica slot
//! - [`Code`]: in-band result codes carried by every RPC response
//! - [`ErasureConfig`]: Reed-Solomon striping parameters
//!
//! # Examples
//!
//! ```rust
//! use basalt::types::ErasureConfig;
//!
//! // Default 4+2 configuration: tolerates two lost shards.
//! let config = ErasureConfig::DEFAULT;
//! assert_eq!(config.total_shards(), 6);
//! ```

use crate::error::BasaltError;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Unique identifier for an extent.
pub type ExtentId = u64;

/// Unique identifier for a storage node.
pub type NodeId = u64;

/// A block queued for append. Blocks are opaque payloads; the extent layer
/// records their boundaries but never interprets their contents.
pub type Block = bytes::Bytes;

/// Immutable placement snapshot for one extent, as reported by the metadata
/// manager. `replicates` holds the full-copy (or data-shard) slots in order;
/// `parity` is empty for replication extents and holds the parity-shard slots
/// for erasure-coded ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentInfo {
    pub extent_id: ExtentId,
    pub replicates: Vec<NodeId>,
    pub parity: Vec<NodeId>,
    /// 0 while the extent is open. For erasure-coded extents this is the
    /// uniform shard length, not the payload length.
    pub sealed_length: u32,
}

impl ExtentInfo {
    pub fn is_sealed(&self) -> bool {
        self.sealed_length > 0
    }

    pub fn is_erasure_coded(&self) -> bool {
        !self.parity.is_empty()
    }

    /// All replica slots in wire order: replicates first, then parity.
    pub fn slots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.replicates.iter().chain(self.parity.iter()).copied()
    }

    pub fn slot_count(&self) -> usize {
        self.replicates.len() + self.parity.len()
    }
}

/// A manager-initiated request to rebuild `replace_id`'s slot of an extent.
/// The task stays valid only while `replace_id` occupies a slot in the
/// latest [`ExtentInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryTask {
    pub extent_id: ExtentId,
    pub replace_id: NodeId,
}

/// Liveness and capacity snapshot of one node, the input to placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    /// Free space in bytes.
    pub free: u64,
    /// Timestamp of the last successful heartbeat.
    pub last_echo: SystemTime,
}

/// In-band result codes carried by RPC responses. Transport-level failures
/// surface as [`BasaltError::Network`] instead and never map onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    Ok,
    /// Read reached the commit length of a still-open extent; more data may
    /// arrive later.
    EndOfStream,
    /// Read reached the sealed length; the extent will never grow.
    EndOfExtent,
    Error,
}

impl Code {
    pub fn is_ok(&self) -> bool {
        matches!(self, Code::Ok)
    }
}

/// First message of a `CopyExtent` stream. `payload_len` is the exact number
/// of body bytes to follow; the receiver rejects the transfer when the count
/// does not match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyHeader {
    pub code: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_des: Option<String>,
    pub payload_len: u64,
}

impl CopyHeader {
    pub fn ok(payload_len: u64) -> Self {
        Self {
            code: Code::Ok,
            code_des: None,
            payload_len,
        }
    }

    pub fn error(err: &BasaltError) -> Self {
        Self {
            code: Code::Error,
            code_des: Some(err.to_string()),
            payload_len: 0,
        }
    }
}

/// Reed-Solomon striping parameters for erasure-coded extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Data shard count (k).
    pub data_shards: usize,
    /// Parity shard count (m). 0 means plain striping without redundancy.
    pub parity_shards: usize,
    /// Cell size in bytes; a power of two, at least 4.
    pub cell_size: usize,
}

impl ErasureConfig {
    /// 4 data + 2 parity over 64 KiB cells.
    pub const DEFAULT: Self = Self {
        data_shards: 4,
        parity_shards: 2,
        cell_size: 64 * 1024,
    };

    /// 2 data + 1 parity over 4 KiB cells, for small test clusters.
    pub const SMALL_CLUSTER: Self = Self {
        data_shards: 2,
        parity_shards: 1,
        cell_size: 4 * 1024,
    };

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.data_shards == 0 {
            return Err(BasaltError::InvalidConfig {
                field: "erasure.data_shards".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        // Vandermonde matrix limit of the underlying codec.
        if self.total_shards() > 256 {
            return Err(BasaltError::InvalidConfig {
                field: "erasure.parity_shards".to_string(),
                reason: format!("{} total shards exceed the limit of 256", self.total_shards()),
            });
        }
        if self.cell_size < 4 || !self.cell_size.is_power_of_two() {
            return Err(BasaltError::InvalidConfig {
                field: "erasure.cell_size".to_string(),
                reason: format!("{} is not a power of two >= 4", self.cell_size),
            });
        }
        Ok(())
    }
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
