//! Error types for the Basalt extent store.
//!
//! This module provides the unified error type [`BasaltError`] for all node
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Extent state**: missing extents, seal violations, registry collisions
//! - **Replicated append**: unhealthy peers and cross-replica divergence
//! - **Recovery**: shard shortfalls, truncated transfers, obsolete tasks
//! - **Erasure codec**: unreconstructable shard sets
//! - **Placement**: insufficient candidate nodes
//! - **Network / configuration**: transport failures and invalid settings
//!
//! # Example
//!
//! ```rust
//! use basalt::error::{BasaltError, Result};
//!
//! fn check_commit(expected: u32, actual: u32) -> Result<()> {
//!     if expected != actual {
//!         return Err(BasaltError::BadState(format!(
//!             "commit mismatch: {expected} vs {actual}"
//!         )));
//!     }
//!     Ok(())
//! }
//!
//! fn handle(err: &BasaltError) {
//!     if err.is_retryable() {
//!         // transient: the caller may retry, possibly elsewhere
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Main error type for Basalt operations.
#[derive(Error, Debug)]
pub enum BasaltError {
    // Extent lookup and state
    #[error("no such extent: {0}")]
    NotFound(u64),

    #[error("bad state: {0}")]
    BadState(String),

    #[error("extent already registered: {0}")]
    AlreadyExists(u64),

    #[error("invariant violated: {0}")]
    Invariant(String),

    // Replicated append
    #[error("peer unhealthy: {0}")]
    PeerUnhealthy(String),

    #[error("replicas diverged: {0}")]
    Divergence(String),

    // Recovery
    #[error("not enough surviving shards: have {available}, need {required}")]
    ShardShort { available: usize, required: usize },

    #[error("transfer truncated: expected {expected} bytes, received {actual}")]
    TransferTruncated { expected: u64, actual: u64 },

    #[error("recovery task obsolete: {0}")]
    Obsolete(String),

    #[error("recovery capacity exceeded: {0}")]
    CapacityExceeded(String),

    // Erasure codec
    #[error("corrupt shards: {0}")]
    CorruptShards(String),

    // Placement
    #[error("not enough nodes: need {need}, have {have}")]
    NotEnoughNodes { need: usize, have: usize },

    // Configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Network
    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    // External
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BasaltError {
    /// Check whether the condition is transient and worth retrying.
    ///
    /// `Divergence` is retryable by the *client*: the failed append left every
    /// acknowledged replica at the pre-append commit length, so a fresh
    /// attempt is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BasaltError::PeerUnhealthy(_)
                | BasaltError::Divergence(_)
                | BasaltError::ShardShort { .. }
                | BasaltError::TransferTruncated { .. }
                | BasaltError::Network(_)
                | BasaltError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for BasaltError {
    fn from(e: serde_json::Error) -> Self {
        BasaltError::Serialization(e.to_string())
    }
}

/// Result type alias for Basalt operations.
pub type Result<T> = std::result::Result<T, BasaltError>;
