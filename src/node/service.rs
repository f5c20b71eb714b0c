//! Append coordination and the thin read/seal/alloc dispatchers.

use super::ExtentNode;
use crate::error::{BasaltError, Result};
use crate::storage::{Extent, ReadBlocksResult, ReadEntriesResult};
use crate::types::{Block, ExtentId};
use bytes::Bytes;
use futures::future::{join_all, BoxFuture, FutureExt};
use futures::Stream;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Per-call payload ceiling for `ReadBlocks`.
const READ_BLOCKS_LIMIT: u32 = 32 << 20;

/// Per-call payload ceiling for `ReadEntries`.
const READ_ENTRIES_LIMIT: u32 = 25 << 20;

impl ExtentNode {
    /// Primary-side replicated append: write locally and to both secondary
    /// peers under the per-extent lock, and acknowledge only when all three
    /// replicas report identical offsets and end watermark.
    ///
    /// Any sub-write error or disagreement fails the whole append; the local
    /// replica is rolled back to the captured offset first, so a failed
    /// append never leaves partial success visible. The caller retries.
    pub async fn append(
        &self,
        extent_id: ExtentId,
        peers: &[String],
        blocks: Vec<Block>,
    ) -> Result<(Vec<u32>, u32)> {
        let extent = self
            .get_extent(extent_id)
            .ok_or(BasaltError::NotFound(extent_id))?;
        if peers.len() != 2 {
            return Err(BasaltError::BadState(format!(
                "append expects 2 secondary peers, got {}",
                peers.len()
            )));
        }

        let _guard = extent.lock().await;

        let mut clients = Vec::with_capacity(peers.len());
        for addr in peers {
            let pool = self.pools().get(addr)?;
            clients.push(pool.healthy_client().await?);
        }

        let offset = extent.commit_length();

        let mut writes: Vec<BoxFuture<'_, Result<(Vec<u32>, u32)>>> =
            Vec::with_capacity(clients.len() + 1);
        let local = Arc::clone(&extent);
        let local_blocks = blocks.clone();
        writes.push(async move { local.append_with_wal(&local_blocks) }.boxed());
        for client in clients {
            let blocks = blocks.clone();
            writes.push(
                async move { client.replicate_blocks(extent_id, offset, blocks).await }.boxed(),
            );
        }

        let deadline = self.config().network.append_timeout;
        let results = match timeout(deadline, join_all(writes)).await {
            Ok(results) => results,
            Err(_) => {
                self.rollback_append(&extent, offset);
                return Err(BasaltError::Timeout(format!(
                    "append fan-out for extent {} exceeded {:?}",
                    extent_id, deadline
                )));
            }
        };

        // Agreement check: every replica must succeed with the same offsets
        // and the same end watermark.
        let mut reference: Option<(Vec<u32>, u32)> = None;
        for result in results {
            let (offsets, end) = match result {
                Ok(r) => r,
                Err(e) => {
                    self.rollback_append(&extent, offset);
                    return Err(e);
                }
            };
            match &reference {
                Some((ref_offsets, ref_end)) => {
                    if offsets != *ref_offsets || end != *ref_end {
                        self.rollback_append(&extent, offset);
                        return Err(BasaltError::Divergence(format!(
                            "extent {} replicas disagree: {:?}/{} vs {:?}/{}",
                            extent_id, offsets, end, ref_offsets, ref_end
                        )));
                    }
                }
                None => reference = Some((offsets, end)),
            }
        }

        reference.ok_or_else(|| BasaltError::Internal("append produced no results".to_string()))
    }

    /// Secondary-side append: apply the primary's blocks provided this
    /// replica sits exactly at the primary's captured commit length.
    pub async fn replicate_blocks(
        &self,
        extent_id: ExtentId,
        commit: u32,
        blocks: Vec<Block>,
    ) -> Result<(Vec<u32>, u32)> {
        let extent = self
            .get_extent(extent_id)
            .ok_or(BasaltError::NotFound(extent_id))?;
        let _guard = extent.lock().await;

        let local = extent.commit_length();
        if local != commit {
            return Err(BasaltError::BadState(format!(
                "commit mismatch on extent {}: primary {} vs local {}",
                extent_id, commit, local
            )));
        }
        extent.append_with_wal(&blocks)
    }

    /// Create a fresh local replica for `extent_id` on a random disk.
    pub fn alloc_extent(&self, extent_id: ExtentId) -> Result<()> {
        if self.get_extent(extent_id).is_some() {
            return Err(BasaltError::AlreadyExists(extent_id));
        }
        let disk = self.pick_disk();
        let extent = disk.alloc_extent(extent_id)?;
        let data_path = extent.data_path().to_path_buf();
        if let Err(e) = self.register_extent(Arc::new(extent)) {
            // Lost a race with a concurrent allocation: drop the fresh files.
            let _ = std::fs::remove_file(&data_path);
            let _ = std::fs::remove_file(crate::storage::index_path_for(&data_path));
            return Err(e);
        }
        debug!(extent_id, "allocated extent");
        Ok(())
    }

    /// Freeze an extent at the manager-assigned commit length.
    pub async fn seal(&self, extent_id: ExtentId, commit_length: u32) -> Result<()> {
        let extent = self
            .get_extent(extent_id)
            .ok_or(BasaltError::NotFound(extent_id))?;
        let _guard = extent.lock().await;
        extent.seal(commit_length)
    }

    /// Commit length of a local replica, from the atomic snapshot.
    pub fn commit_length_of(&self, extent_id: ExtentId) -> Result<u32> {
        let extent = self
            .get_extent(extent_id)
            .ok_or(BasaltError::NotFound(extent_id))?;
        Ok(extent.commit_length())
    }

    /// Read whole blocks starting at a block boundary, capped at 32 MiB.
    pub fn read_blocks(
        &self,
        extent_id: ExtentId,
        offset: u32,
        num_blocks: u32,
    ) -> Result<ReadBlocksResult> {
        let extent = self
            .get_extent(extent_id)
            .ok_or(BasaltError::NotFound(extent_id))?;
        extent.read_blocks(offset, num_blocks, READ_BLOCKS_LIMIT)
    }

    /// Read block entries for replay, capped at 25 MiB.
    pub fn read_entries(
        &self,
        extent_id: ExtentId,
        offset: u32,
        replay: bool,
    ) -> Result<ReadEntriesResult> {
        let extent = self
            .get_extent(extent_id)
            .ok_or(BasaltError::NotFound(extent_id))?;
        extent.read_entries(offset, READ_ENTRIES_LIMIT, replay)
    }

    /// Server-side heartbeat: one `beat` every `echo_duration` until the
    /// peer drops the stream.
    pub fn heartbeat_stream(&self) -> impl Stream<Item = Bytes> + Send + 'static {
        let period = self.config().network.echo_duration;
        let start = tokio::time::Instant::now() + period;
        futures::stream::unfold(
            tokio::time::interval_at(start, period),
            |mut interval| async move {
                interval.tick().await;
                Some((Bytes::from_static(b"beat"), interval))
            },
        )
    }

    fn rollback_append(&self, extent: &Extent, offset: u32) {
        if extent.commit_length() == offset {
            return;
        }
        if let Err(e) = extent.truncate_to(offset) {
            warn!(
                extent_id = extent.id(),
                offset,
                error = %e,
                "failed to roll back diverged append"
            );
        }
    }
}
