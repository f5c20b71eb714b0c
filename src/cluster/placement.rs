//! Placement policy for new extent allocations.

use crate::error::{BasaltError, Result};
use crate::types::{NodeId, NodeStatus};
use std::collections::HashSet;
use tracing::debug;

/// Node-selection policy for new extents. Variants are selected once at
/// startup; each exposes the same capability.
#[derive(Debug, Clone, Copy, Default)]
pub enum AllocExtentPolicy {
    /// Prefer the most recently alive nodes, breaking ties by free space.
    #[default]
    Simple,
}

impl AllocExtentPolicy {
    /// Pick `count` distinct nodes for a new extent, never returning a node
    /// whose ID is in `keep`.
    pub fn alloc_extent(
        &self,
        nodes: &[NodeStatus],
        count: usize,
        keep: &[NodeId],
    ) -> Result<Vec<NodeStatus>> {
        match self {
            AllocExtentPolicy::Simple => simple_alloc(nodes, count, keep),
        }
    }
}

fn simple_alloc(nodes: &[NodeStatus], count: usize, keep: &[NodeId]) -> Result<Vec<NodeStatus>> {
    debug!(candidates = nodes.len(), count, "allocating extent placement");

    let mut sorted = nodes.to_vec();
    sorted.sort_by(|a, b| {
        b.last_echo
            .cmp(&a.last_echo)
            .then(b.free.cmp(&a.free))
    });

    let keep: HashSet<NodeId> = keep.iter().copied().collect();
    let picked: Vec<NodeStatus> = sorted
        .into_iter()
        .filter(|n| !keep.contains(&n.node_id))
        .take(count)
        .collect();

    if picked.len() < count {
        return Err(BasaltError::NotEnoughNodes {
            need: count,
            have: picked.len(),
        });
    }
    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::{Duration, SystemTime};

    fn status(node_id: NodeId, free: u64, echo_age_secs: u64) -> NodeStatus {
        NodeStatus {
            node_id,
            free,
            last_echo: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - echo_age_secs),
        }
    }

    #[test]
    fn test_prefers_recently_alive_then_free_space() {
        let nodes = vec![
            status(1, 100, 60),
            status(2, 500, 0),
            status(3, 900, 0),
            status(4, 50, 120),
        ];

        let picked = AllocExtentPolicy::Simple
            .alloc_extent(&nodes, 2, &[])
            .unwrap();
        assert_eq!(picked[0].node_id, 3);
        assert_eq!(picked[1].node_id, 2);
    }

    #[test]
    fn test_keep_set_excluded_and_distinct() {
        let nodes: Vec<_> = (1..=6).map(|i| status(i, i * 100, 0)).collect();
        let keep = vec![6, 5];

        let picked = AllocExtentPolicy::Simple
            .alloc_extent(&nodes, 3, &keep)
            .unwrap();

        assert_eq!(picked.len(), 3);
        let ids: HashSet<_> = picked.iter().map(|n| n.node_id).collect();
        assert_eq!(ids.len(), 3);
        for id in &keep {
            assert!(!ids.contains(id));
        }
        // Sorted-prefix of the survivors: freest first among equal echoes.
        assert_eq!(picked[0].node_id, 4);
        assert_eq!(picked[1].node_id, 3);
        assert_eq!(picked[2].node_id, 2);
    }

    #[test]
    fn test_keep_set_does_not_starve_later_candidates() {
        // The keep set covers the head of the sorted order; selection must
        // keep scanning past it instead of failing.
        let nodes: Vec<_> = (1..=5).map(|i| status(i, 1000 - i, 0)).collect();
        let picked = AllocExtentPolicy::Simple
            .alloc_extent(&nodes, 3, &[1, 2])
            .unwrap();
        assert_eq!(
            picked.iter().map(|n| n.node_id).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }

    #[test]
    fn test_not_enough_nodes() {
        let nodes: Vec<_> = (1..=3).map(|i| status(i, 100, 0)).collect();
        let result = AllocExtentPolicy::Simple.alloc_extent(&nodes, 3, &[2]);
        assert!(matches!(
            result,
            Err(BasaltError::NotEnoughNodes { need: 3, have: 2 })
        ));
    }
}
