//! Sealed-extent byte streaming between nodes.
//!
//! The sender ships a header naming the exact payload length, then the raw
//! extent bytes in chunks of at most 512 KiB with a short spacer between
//! chunks as crude pacing. The receiver counts bytes and rejects any
//! transfer that does not match the header.

use super::ExtentNode;
use crate::error::{BasaltError, Result};
use crate::pool::CopyStream;
use crate::types::{Code, CopyHeader, ExtentId, RecoveryTask};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, warn};

/// Maximum payload chunk carried by one stream message.
pub const COPY_CHUNK_SIZE: usize = 512 << 10;

/// Inter-chunk delay, a crude per-stream rate limit.
const CHUNK_SPACER: Duration = Duration::from_millis(1);

impl ExtentNode {
    /// Serve a `CopyExtent` stream. Errors are delivered in-band as an
    /// error header followed by an empty body.
    ///
    /// An open replica is sealed on the fly when it already holds the
    /// manager-assigned sealed length; one that falls short is incomplete,
    /// so a recovery task for this node is submitted in the background and
    /// the stream is refused. A replica that is sealed yet does not hold its
    /// sealed length is broken in a way recovery cannot explain, which is
    /// reported loudly and refused.
    pub async fn copy_extent(self: &Arc<Self>, extent_id: ExtentId) -> CopyStream {
        let extent = match self.get_extent(extent_id) {
            Some(extent) => extent,
            None => return error_stream(&BasaltError::NotFound(extent_id)),
        };
        let info = match self.manager().extent_info(extent_id).await {
            Ok(info) => info,
            Err(e) => return error_stream(&e),
        };

        if !extent.is_sealed() {
            if info.sealed_length == 0 {
                return error_stream(&BasaltError::BadState(format!(
                    "extent {} has no sealed length yet",
                    extent_id
                )));
            }
            if extent.commit_length() >= info.sealed_length {
                let _guard = extent.lock().await;
                if let Err(e) = extent.seal(info.sealed_length) {
                    return error_stream(&e);
                }
            } else {
                self.submit_self_recovery(extent_id);
                return error_stream(&BasaltError::BadState(format!(
                    "extent {} on node {} is not complete",
                    extent_id,
                    self.node_id()
                )));
            }
        } else if extent.commit_length() != extent.sealed_length() {
            let err = BasaltError::Invariant(format!(
                "extent {} sealed at {} but holds {} bytes",
                extent_id,
                extent.sealed_length(),
                extent.commit_length()
            ));
            error!(extent_id, node_id = self.node_id(), %err, "refusing to serve replica");
            return error_stream(&err);
        }

        let payload_len = u64::from(extent.commit_length());
        let reader = match extent.reader() {
            Ok(reader) => reader,
            Err(e) => return error_stream(&e),
        };

        let body = stream::unfold((reader, payload_len), |(mut file, remaining)| async move {
            if remaining == 0 {
                return None;
            }
            let n = COPY_CHUNK_SIZE.min(remaining as usize);
            let mut buf = vec![0u8; n];
            if let Err(e) = file.read_exact(&mut buf) {
                return Some((Err(BasaltError::Io(e)), (file, 0)));
            }
            tokio::time::sleep(CHUNK_SPACER).await;
            Some((Ok(Bytes::from(buf)), (file, remaining - n as u64)))
        })
        .boxed();

        CopyStream {
            header: CopyHeader::ok(payload_len),
            body,
        }
    }

    /// This replica is missing bytes the manager already sealed: ask the
    /// manager to have it rebuilt here. Fire-and-forget with a deadline.
    fn submit_self_recovery(self: &Arc<Self>, extent_id: ExtentId) {
        let task = RecoveryTask {
            extent_id,
            replace_id: self.node_id(),
        };
        let manager = Arc::clone(self.manager());
        let deadline = self.config().recovery.submit_timeout;
        tokio::spawn(async move {
            match timeout(deadline, manager.submit_recovery_task(task)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    extent_id = task.extent_id,
                    error = %e,
                    "failed to submit recovery task"
                ),
                Err(_) => warn!(
                    extent_id = task.extent_id,
                    "recovery task submission timed out"
                ),
            }
        });
    }
}

fn error_stream(err: &BasaltError) -> CopyStream {
    CopyStream {
        header: CopyHeader::error(err),
        body: stream::empty().boxed(),
    }
}

/// Drain a copy stream into `target`, enforcing the header's byte count.
pub async fn copy_stream_to_file(stream: CopyStream, target: &mut File) -> Result<u64> {
    let CopyStream { header, mut body } = stream;
    if header.code != Code::Ok {
        return Err(BasaltError::BadState(format!(
            "copy refused by peer: {}",
            header.code_des.unwrap_or_else(|| "unknown".to_string())
        )));
    }

    let mut received = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        target.write_all(&chunk)?;
        received += chunk.len() as u64;
    }

    if received != header.payload_len {
        return Err(BasaltError::TransferTruncated {
            expected: header.payload_len,
            actual: received,
        });
    }
    Ok(received)
}
