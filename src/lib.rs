//! Basalt - the data-plane of a distributed append-only extent store.
//!
//! Storage nodes host replicas of *extents*: large byte containers that grow
//! through replicated appends and become immutable once sealed at a
//! manager-assigned length. A primary node fans each append out to two
//! secondary replicas under a per-extent lock and acknowledges only unanimous
//! agreement; sealed extents stream their bytes to recovering peers; lost
//! replicas are rebuilt either from one healthy copy or by Reed-Solomon
//! reconstruction from `k` surviving shards.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Basalt node                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  RPC surface: append | read | seal | copy | recovery         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Append coordinator: per-extent lock | 3-way fan-out         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Recovery engine: replica copy | shard reconstruction        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Storage: extents | syncing files | per-disk layout          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cluster metadata manager (placement, seal assignment, recovery
//! scheduling) is an external service reached through
//! [`cluster::ManagerClient`]; [`cluster::StaticManager`] is the in-process
//! stand-in used by tests and single-process clusters.
//!
//! # Quick Start
//!
//! ```no_run
//! use basalt::config::BasaltConfig;
//!
//! #[tokio::main]
//! async fn main() -> basalt::Result<()> {
//!     let config = BasaltConfig::development();
//!     basalt::run(config).await
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod erasure;
pub mod error;
pub mod node;
pub mod observability;
pub mod pool;
pub mod storage;
pub mod types;

// Re-exports
pub use error::{BasaltError, Result};
pub use types::*;

use crate::cluster::{ManagerClient, StaticManager};
use crate::config::BasaltConfig;
use crate::node::rpc::{router, HttpConnector};
use crate::node::ExtentNode;
use crate::pool::PoolRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Run a storage node with an in-process manager. Suitable for development
/// and single-process clusters; production deployments pass their manager
/// client through [`run_with_manager`].
pub async fn run(config: BasaltConfig) -> Result<()> {
    run_with_manager(config, Arc::new(StaticManager::new())).await
}

/// Run a storage node against the given metadata manager until shutdown.
pub async fn run_with_manager(
    config: BasaltConfig,
    manager: Arc<dyn ManagerClient>,
) -> Result<()> {
    observability::init(&config.observability)?;
    config.validate()?;

    let pools = Arc::new(PoolRegistry::new(
        Box::new(HttpConnector::new(
            config.network.connect_timeout,
            config.network.request_timeout,
        )),
        config.network.echo_duration,
    ));

    let node = ExtentNode::new(config.clone(), Arc::clone(&pools), manager)?;
    let app = router(Arc::clone(&node));

    let listener = TcpListener::bind(config.node.listen_addr).await?;
    info!(
        node_id = config.node.id,
        addr = %config.node.listen_addr,
        "extent node listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| BasaltError::Network(e.to_string()))?;

    info!(node_id = config.node.id, "extent node stopped");
    pools.close();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
