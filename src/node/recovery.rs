//! Recovery engine: rebuilding a lost replica slot on this node.
//!
//! Admission happens in [`ExtentNode::require_recovery`]; accepted tasks run
//! on a spawned worker that loops until the rebuild succeeds or the task
//! becomes obsolete. Replication extents stream one healthy copy; erasure
//! extents stage `k` surviving shards into scratch files and reconstruct the
//! missing shard. The finished target is renamed onto the live `<id>.ext`
//! path and registered.

use super::copy::copy_stream_to_file;
use super::ExtentNode;
use crate::cluster::find_replace_slot;
use crate::erasure::ErasureCoder;
use crate::error::{BasaltError, Result};
use crate::pool::PeerClient;
use crate::storage::{write_index, BlockEntry, Extent};
use crate::types::{Code, ErasureConfig, ExtentInfo, NodeId, RecoveryTask};
use futures::future::join_all;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Scoped decrement of the node's recovery-task counter.
struct RecoveryPermit {
    node: Arc<ExtentNode>,
}

impl Drop for RecoveryPermit {
    fn drop(&mut self) {
        self.node.recovery_task_num.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExtentNode {
    /// Admit a recovery task. Rejections: the node is at its concurrency
    /// cap, or the extent has not been sealed yet. A task whose replaced
    /// node no longer occupies a slot is obsolete and ignored.
    pub async fn require_recovery(self: &Arc<Self>, task: RecoveryTask) -> Result<()> {
        let running = self.recovery_task_num.load(Ordering::SeqCst);
        let max = self.config().recovery.max_concurrent_tasks as i32;
        if running >= max {
            return Err(BasaltError::CapacityExceeded(format!(
                "{} of {} recovery workers busy",
                running, max
            )));
        }

        let info = self.manager().extent_info(task.extent_id).await?;
        if find_replace_slot(&info, task.replace_id).is_none() {
            info!(
                extent_id = task.extent_id,
                replace_id = task.replace_id,
                "recovery task no longer matches placement, ignoring"
            );
            return Ok(());
        }
        if info.sealed_length == 0 {
            return Err(BasaltError::BadState(format!(
                "extent {} must be sealed before recovery",
                task.extent_id
            )));
        }

        let disk = self.pick_disk();
        let (target, target_path) = disk.alloc_copy_extent(task.extent_id, task.replace_id)?;
        let final_path = disk.extent_path(task.extent_id);

        info!(
            extent_id = task.extent_id,
            replace_id = task.replace_id,
            node_id = self.node_id(),
            "recovery task admitted"
        );
        self.recovery_task_num.fetch_add(1, Ordering::SeqCst);
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = RecoveryPermit {
                node: Arc::clone(&node),
            };
            node.run_recovery_task(task, info, target, target_path, final_path)
                .await;
        });
        Ok(())
    }

    async fn run_recovery_task(
        self: &Arc<Self>,
        task: RecoveryTask,
        mut info: ExtentInfo,
        mut target: File,
        target_path: PathBuf,
        final_path: PathBuf,
    ) {
        let retry = self.config().recovery.retry_interval;

        let entries = loop {
            if find_replace_slot(&info, task.replace_id).is_none() {
                info!(
                    extent_id = task.extent_id,
                    "recovery task became obsolete, discarding target"
                );
                drop(target);
                let _ = std::fs::remove_file(&target_path);
                return;
            }

            let attempt = match reset_target(&mut target) {
                Ok(()) => {
                    if info.parity.is_empty() {
                        self.recover_replicated(&info, task.replace_id, &mut target)
                            .await
                            .map(Some)
                    } else {
                        self.recover_erasure(&info, task.replace_id, &mut target, &target_path)
                            .await
                            .map(|()| None)
                    }
                }
                Err(e) => Err(e),
            };

            match attempt {
                Ok(entries) => break entries,
                Err(e) => {
                    warn!(
                        extent_id = task.extent_id,
                        error = %e,
                        "recovery attempt failed, retrying"
                    );
                    tokio::time::sleep(retry).await;
                    match self.manager().extent_info(task.extent_id).await {
                        Ok(latest) => info = latest,
                        Err(e) => warn!(
                            extent_id = task.extent_id,
                            error = %e,
                            "could not refresh extent info"
                        ),
                    }
                }
            }
        };

        if let Err(e) = self.finish_recovery(&info, entries, target, &target_path, &final_path) {
            error!(
                extent_id = task.extent_id,
                error = %e,
                "failed to finalise recovered replica"
            );
            let _ = std::fs::remove_file(&target_path);
        }
    }

    fn finish_recovery(
        &self,
        info: &ExtentInfo,
        entries: Option<Vec<BlockEntry>>,
        target: File,
        target_path: &Path,
        final_path: &Path,
    ) -> Result<()> {
        target.sync_all()?;
        drop(target);
        std::fs::rename(target_path, final_path)?;
        if let Some(entries) = &entries {
            write_index(final_path, entries, info.sealed_length)?;
        }

        let extent = Extent::open(
            info.extent_id,
            final_path,
            self.config().storage.syncing_options(),
        )?;
        self.register_extent(Arc::new(extent))?;
        info!(
            extent_id = info.extent_id,
            sealed_length = info.sealed_length,
            erasure = info.is_erasure_coded(),
            "replica recovered"
        );
        Ok(())
    }

    /// Stream one healthy full copy into `target`, then rebuild the block
    /// index from the same peer's replay entries.
    async fn recover_replicated(
        &self,
        info: &ExtentInfo,
        replace_id: NodeId,
        target: &mut File,
    ) -> Result<Vec<BlockEntry>> {
        let peers = self.manager().peers_of(info.extent_id).await?;
        let client = self.choose_alive_replica(info, &peers, replace_id).await?;

        let stream = client.copy_extent(info.extent_id).await?;
        copy_stream_to_file(stream, target).await?;

        let mut entries = Vec::new();
        let mut offset = 0u32;
        loop {
            let page = client.read_entries(info.extent_id, offset, true).await?;
            if page.entries.is_empty() && page.code == Code::Ok {
                return Err(BasaltError::Internal(
                    "entry replay made no progress".to_string(),
                ));
            }
            for entry in &page.entries {
                entries.push(BlockEntry {
                    offset: entry.offset,
                    len: entry.data.len() as u32,
                    crc: entry.crc,
                });
            }
            offset = page.end;
            match page.code {
                Code::Ok => {}
                Code::EndOfStream | Code::EndOfExtent => break,
                Code::Error => {
                    return Err(BasaltError::Network(
                        "entry replay failed on source peer".to_string(),
                    ));
                }
            }
        }
        Ok(entries)
    }

    /// Stage `k` surviving shards into scratch files and reconstruct the
    /// replaced slot's shard into `target`.
    async fn recover_erasure(
        &self,
        info: &ExtentInfo,
        replace_id: NodeId,
        target: &mut File,
        target_path: &Path,
    ) -> Result<()> {
        let k = info.replicates.len();
        let m = info.parity.len();
        let total = k + m;

        let peers = self.manager().peers_of(info.extent_id).await?;
        if peers.len() != total {
            return Err(BasaltError::Internal(format!(
                "peer list covers {} of {} slots",
                peers.len(),
                total
            )));
        }
        let replace_slot = find_replace_slot(info, replace_id).ok_or_else(|| {
            BasaltError::Obsolete(format!("node {} holds no slot", replace_id))
        })?;

        // Reconstruction needs exactly k shards; take the first k live
        // survivors in slot order.
        let mut clients: Vec<Option<Arc<dyn PeerClient>>> = vec![None; total];
        let mut live = 0;
        for slot in 0..total {
            if slot == replace_slot || live == k {
                continue;
            }
            let pool = match self.pools().get(&peers[slot]) {
                Ok(pool) => pool,
                Err(_) => continue,
            };
            if let Ok(client) = pool.healthy_client().await {
                clients[slot] = Some(client);
                live += 1;
            }
        }
        if live < k {
            return Err(BasaltError::ShardShort {
                available: live,
                required: k,
            });
        }

        // Scratch files live next to the target and vanish with the guard
        // on every exit path.
        let scratch_parent = target_path.parent().ok_or_else(|| {
            BasaltError::Internal("recovery target has no parent directory".to_string())
        })?;
        let scratch = tempfile::Builder::new()
            .prefix("ec-recovery-")
            .tempdir_in(scratch_parent)?;

        let extent_id = info.extent_id;
        let transfers = clients
            .iter()
            .enumerate()
            .filter_map(|(slot, client)| client.clone().map(|client| (slot, client)))
            .map(|(slot, client)| {
                let path = scratch.path().join(slot.to_string());
                async move {
                    let mut file = File::options()
                        .create_new(true)
                        .read(true)
                        .write(true)
                        .open(&path)?;
                    let stream = client.copy_extent(extent_id).await?;
                    copy_stream_to_file(stream, &mut file).await?;
                    file.seek(SeekFrom::Start(0))?;
                    Ok::<(usize, File), BasaltError>((slot, file))
                }
            });

        let mut inputs: Vec<Option<File>> = (0..total).map(|_| None).collect();
        for staged in join_all(transfers).await {
            let (slot, file) = staged?;
            inputs[slot] = Some(file);
        }

        let coder = ErasureCoder::new(ErasureConfig {
            data_shards: k,
            parity_shards: m,
            cell_size: self.config().storage.erasure.cell_size,
        })?;
        let mut outputs: Vec<Option<&mut File>> = (0..total).map(|_| None).collect();
        outputs[replace_slot] = Some(target);
        coder.reconstruct(&mut inputs, &mut outputs)?;
        Ok(())
    }

    /// First live full-copy peer other than the replaced node.
    async fn choose_alive_replica(
        &self,
        info: &ExtentInfo,
        peers: &[String],
        except: NodeId,
    ) -> Result<Arc<dyn PeerClient>> {
        for (slot, node_id) in info.replicates.iter().enumerate() {
            if *node_id == except {
                continue;
            }
            let addr = match peers.get(slot) {
                Some(addr) => addr,
                None => continue,
            };
            let pool = match self.pools().get(addr) {
                Ok(pool) => pool,
                Err(_) => continue,
            };
            if let Ok(client) = pool.healthy_client().await {
                return Ok(client);
            }
        }
        Err(BasaltError::PeerUnhealthy(format!(
            "no live replica of extent {}",
            info.extent_id
        )))
    }
}

fn reset_target(target: &mut File) -> Result<()> {
    target.set_len(0)?;
    target.seek(SeekFrom::Start(0))?;
    Ok(())
}
