//! Recovery engine scenarios: replicated copy and erasure reconstruction.

#[allow(dead_code)]
mod common;

use basalt::erasure::ErasureCoder;
use basalt::types::{ErasureConfig, ExtentInfo, RecoveryTask};
use bytes::Bytes;
use common::{build_cluster, wait_for};
use std::time::Duration;

const EXTENT: u64 = 1;

/// Fill a replica through the secondary append path in 256 KiB blocks.
async fn fill_replica(cluster: &common::TestCluster, node_id: u64, data: &[u8]) -> u32 {
    let node = cluster.node(node_id);
    let mut commit = 0u32;
    for chunk in data.chunks(256 * 1024) {
        let (_, end) = node
            .replicate_blocks(EXTENT, commit, vec![Bytes::copy_from_slice(chunk)])
            .await
            .unwrap();
        commit = end;
    }
    commit
}

#[tokio::test]
async fn test_replicated_extent_recovery() {
    let cluster = build_cluster(3);
    let data = common::payload(42, 4 << 20);

    // A sealed 4 MiB extent on nodes 1 and 2; node 3 lost its replica.
    cluster.manager.register_extent(ExtentInfo {
        extent_id: EXTENT,
        replicates: vec![1, 2, 3],
        parity: vec![],
        sealed_length: 0,
    });
    for node_id in [1u64, 2] {
        cluster.node(node_id).alloc_extent(EXTENT).unwrap();
        let end = fill_replica(&cluster, node_id, &data).await;
        cluster.node(node_id).seal(EXTENT, end).await.unwrap();
    }
    cluster.manager.seal_extent(EXTENT, data.len() as u32);

    cluster
        .node(3)
        .require_recovery(RecoveryTask {
            extent_id: EXTENT,
            replace_id: 3,
        })
        .await
        .unwrap();

    let node3 = cluster.node(3);
    assert!(
        wait_for(|| node3.get_extent(EXTENT).is_some(), Duration::from_secs(10)).await,
        "recovery did not complete"
    );
    assert!(
        wait_for(|| node3.recovery_task_count() == 0, Duration::from_secs(5)).await,
        "worker counter not released"
    );

    // The recovered replica is sealed and byte-identical to node 1's.
    assert_eq!(
        node3.commit_length_of(EXTENT).unwrap(),
        data.len() as u32
    );
    let mut offset = 0;
    loop {
        let healthy = cluster.node(1).read_blocks(EXTENT, offset, 8).unwrap();
        let rebuilt = node3.read_blocks(EXTENT, offset, 8).unwrap();
        assert_eq!(rebuilt.blocks, healthy.blocks);
        assert_eq!(rebuilt.end, healthy.end);
        if healthy.end == offset {
            break;
        }
        offset = healthy.end;
    }
}

#[tokio::test]
async fn test_obsolete_task_is_ignored() {
    let cluster = build_cluster(3);
    cluster.manager.register_extent(ExtentInfo {
        extent_id: EXTENT,
        replicates: vec![1, 2, 3],
        parity: vec![],
        sealed_length: 4096,
    });

    // Node 9 holds no slot: the task is stale and must be a quiet no-op.
    cluster
        .node(1)
        .require_recovery(RecoveryTask {
            extent_id: EXTENT,
            replace_id: 9,
        })
        .await
        .unwrap();

    assert_eq!(cluster.node(1).recovery_task_count(), 0);
    assert!(cluster.node(1).get_extent(EXTENT).is_none());
}

#[tokio::test]
async fn test_erasure_recovery_waits_for_enough_survivors() {
    // k=4, m=2 over 64 KiB cells: shards live on nodes 1..=6, slot 3
    // (node 4) is lost. With two survivors down the attempt falls short of
    // k live peers; once one comes back the next attempt succeeds.
    let cluster = build_cluster(6);
    let erasure = ErasureConfig::DEFAULT;
    let coder = ErasureCoder::new(erasure).unwrap();
    let data = common::payload(7, 123_456);
    let shards = coder.encode(&data).unwrap();
    let object_size = shards[0].len() as u32;

    cluster.manager.register_extent(ExtentInfo {
        extent_id: EXTENT,
        replicates: vec![1, 2, 3, 4],
        parity: vec![5, 6],
        sealed_length: 0,
    });
    for (slot, shard) in shards.iter().enumerate() {
        if slot == 3 {
            continue; // node 4's shard is the one being rebuilt
        }
        let node_id = (slot + 1) as u64;
        let node = cluster.node(node_id);
        node.alloc_extent(EXTENT).unwrap();
        node.replicate_blocks(EXTENT, 0, vec![Bytes::copy_from_slice(shard)])
            .await
            .unwrap();
        node.seal(EXTENT, object_size).await.unwrap();
    }
    cluster.manager.seal_extent(EXTENT, object_size);

    // Two survivors down: only 3 of the required 4 peers are reachable.
    cluster.disconnect(2);
    cluster.disconnect(5);

    let node4 = cluster.node(4);
    node4
        .require_recovery(RecoveryTask {
            extent_id: EXTENT,
            replace_id: 4,
        })
        .await
        .unwrap();

    // Attempts keep failing while the survivors are short.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(node4.get_extent(EXTENT).is_none());
    assert_eq!(node4.recovery_task_count(), 1);

    // One survivor returns; the retry loop picks it up.
    cluster.reconnect(2);
    assert!(
        wait_for(|| node4.get_extent(EXTENT).is_some(), Duration::from_secs(10)).await,
        "recovery did not complete after survivor returned"
    );
    assert!(
        wait_for(|| node4.recovery_task_count() == 0, Duration::from_secs(5)).await,
        "worker counter not released"
    );

    // The rebuilt shard is byte-identical to the original slot-3 shard.
    let rebuilt = std::fs::read(cluster.dir_of(4).join(format!("{}.ext", EXTENT))).unwrap();
    assert_eq!(rebuilt, shards[3]);

    // And the replica opens as a sealed opaque shard of the right length.
    assert_eq!(node4.commit_length_of(EXTENT).unwrap(), object_size);
}

#[tokio::test]
async fn test_copy_of_incomplete_replica_submits_recovery() {
    let cluster = build_cluster(2);
    cluster.manager.register_extent(ExtentInfo {
        extent_id: EXTENT,
        replicates: vec![1, 2],
        parity: vec![],
        sealed_length: 0,
    });
    cluster.node(1).alloc_extent(EXTENT).unwrap();
    cluster
        .node(1)
        .replicate_blocks(EXTENT, 0, vec![Bytes::from(common::payload(3, 100))])
        .await
        .unwrap();

    // The manager sealed the extent beyond what this replica holds.
    cluster.manager.seal_extent(EXTENT, 5_000);

    let stream = cluster.node(1).copy_extent(EXTENT).await;
    assert_eq!(stream.header.code, basalt::types::Code::Error);

    // The node asked the manager to have its own slot rebuilt.
    let manager = std::sync::Arc::clone(&cluster.manager);
    assert!(
        wait_for(
            move || {
                manager
                    .submitted_tasks()
                    .contains(&RecoveryTask {
                        extent_id: EXTENT,
                        replace_id: 1,
                    })
            },
            Duration::from_secs(5)
        )
        .await,
        "no recovery task submitted"
    );
}

#[tokio::test]
async fn test_sealed_but_short_replica_refuses_to_serve() {
    use basalt::storage::{write_index, BlockEntry, Extent, SyncingFileOptions};

    let cluster = build_cluster(1);

    // Fabricate a replica whose sidecar claims a seal at 200 bytes while
    // the data file holds only 100.
    let path = cluster.dir_of(1).join("33.ext");
    let bytes = vec![1u8; 100];
    std::fs::write(&path, &bytes).unwrap();
    write_index(
        &path,
        &[BlockEntry {
            offset: 0,
            len: 100,
            crc: crc32fast::hash(&bytes),
        }],
        200,
    )
    .unwrap();

    let broken = Extent::open(33, &path, SyncingFileOptions::default()).unwrap();
    assert!(broken.is_sealed());
    assert_eq!(broken.commit_length(), 100);
    cluster
        .node(1)
        .register_extent(std::sync::Arc::new(broken))
        .unwrap();
    cluster.manager.register_extent(ExtentInfo {
        extent_id: 33,
        replicates: vec![1],
        parity: vec![],
        sealed_length: 200,
    });

    let stream = cluster.node(1).copy_extent(33).await;
    assert_eq!(stream.header.code, basalt::types::Code::Error);
    let reason = stream.header.code_des.unwrap_or_default();
    assert!(reason.contains("invariant"), "unexpected reason: {reason}");
}

#[tokio::test]
async fn test_recovery_capacity_cap() {
    let cluster = build_cluster(3);

    // Saturate the cap with tasks that retry forever: the extent is sealed
    // in the manager's view but no replica exists anywhere, so every
    // attempt fails and the workers stay busy.
    let max = cluster.node(1).config().recovery.max_concurrent_tasks;
    for extent_id in 100..100 + max as u64 {
        cluster.manager.register_extent(ExtentInfo {
            extent_id,
            replicates: vec![1, 2, 3],
            parity: vec![],
            sealed_length: 4096,
        });
        cluster
            .node(1)
            .require_recovery(RecoveryTask {
                extent_id,
                replace_id: 1,
            })
            .await
            .unwrap();
    }

    cluster.manager.register_extent(ExtentInfo {
        extent_id: 999,
        replicates: vec![1, 2, 3],
        parity: vec![],
        sealed_length: 4096,
    });
    let err = cluster
        .node(1)
        .require_recovery(RecoveryTask {
            extent_id: 999,
            replace_id: 1,
        })
        .await
        .unwrap_err();
    assert!(
        matches!(err, basalt::BasaltError::CapacityExceeded(_)),
        "got {err}"
    );
}
