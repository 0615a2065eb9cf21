use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use storage::StorageNode;

/// Position of a node id or measurement key on the ring: the MD5 digest of
/// its UTF-8 bytes, read as a big-endian 128-bit integer. This choice is
/// load-bearing: replica placement must be identical across processes, so
/// the hash is fixed rather than configurable.
pub fn ring_position(bytes: &[u8]) -> u128 {
    u128::from_be_bytes(md5::compute(bytes).0)
}

/// A measurement parked on a stand-in node while its natural holder is down.
/// Recorded by [`HashRing::redistribute`] and drained by
/// [`HashRing::recover_node`].
#[derive(Debug, Clone, PartialEq)]
pub struct Hint {
    /// Node currently holding the measurement in place of the failed one.
    pub holder_id: u32,
    pub value: String,
}

/// HashRing places measurement keys onto storage nodes by consistent
/// hashing: each node occupies the ring position of its decimal id, and a
/// key's replicas are the first `replication_factor` distinct nodes at or
/// after the key's own position, walking clockwise.
///
/// The map is ordered by ring position, so its key order *is* the sorted
/// hash sequence, and a colliding node id structurally replaces the earlier
/// occupant rather than duplicating a slot.
pub struct HashRing {
    nodes: BTreeMap<u128, Arc<StorageNode>>,
    replication_factor: usize,
    hints: BTreeMap<String, Hint>,
}

impl HashRing {
    /// Build a ring over `nodes`. A missing replication factor defaults to
    /// the node count; explicit values are clamped into `[1, len(nodes)]`.
    pub fn new(nodes: &[Arc<StorageNode>], replication_factor: Option<usize>) -> Self {
        let replication_factor = replication_factor
            .unwrap_or(nodes.len())
            .clamp(1, nodes.len().max(1));

        let mut ring = Self {
            nodes: BTreeMap::new(),
            replication_factor,
            hints: BTreeMap::new(),
        };
        for node in nodes {
            ring.add_node(node.clone());
        }
        ring
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Temporary placements recorded by failure redistribution, keyed by
    /// measurement key.
    pub fn hints(&self) -> &BTreeMap<String, Hint> {
        &self.hints
    }

    pub fn add_node(&mut self, node: Arc<StorageNode>) {
        let position = ring_position(node.node_id().to_string().as_bytes());
        tracing::debug!(node_id = node.node_id(), position = %position, "adding storage node to ring");
        self.nodes.insert(position, node);
    }

    pub fn remove_node(&mut self, node: &StorageNode) {
        let position = ring_position(node.node_id().to_string().as_bytes());
        if self.nodes.remove(&position).is_some() {
            tracing::debug!(node_id = node.node_id(), position = %position, "removed storage node from ring");
        }
    }

    /// Walk the ring clockwise starting from the first slot strictly after
    /// `start`, visiting every slot exactly once.
    fn walk(&self, start: u128) -> impl Iterator<Item = &Arc<StorageNode>> {
        self.nodes
            .range((Bound::Excluded(start), Bound::Unbounded))
            .chain(self.nodes.range(..=start))
            .map(|(_, node)| node)
    }

    /// The ordered replica set for `key`: up to `replication_factor` distinct
    /// nodes in walk order, the first being the primary. Liveness is not
    /// consulted here. An empty ring yields an empty set, and a factor larger
    /// than the ring truncates once every slot has been visited.
    pub fn responsible_nodes(&self, key: &str) -> Vec<Arc<StorageNode>> {
        self.walk(ring_position(key.as_bytes()))
            .take(self.replication_factor)
            .cloned()
            .collect()
    }

    /// The first live replica of `key` in walk order, if any.
    pub fn primary_live(&self, key: &str) -> Option<Arc<StorageNode>> {
        self.responsible_nodes(key)
            .into_iter()
            .find(|node| node.is_alive())
    }

    /// The first live node after `key`'s position whose id differs from
    /// `exclude_id`, visiting every slot at most once.
    pub fn next_active(&self, key: &str, exclude_id: u32) -> Option<Arc<StorageNode>> {
        self.walk(ring_position(key.as_bytes()))
            .find(|node| node.is_alive() && node.node_id() != exclude_id)
            .cloned()
    }

    /// Re-home the measurements of a node that just failed onto its next
    /// live successor, recording a hint for every pair actually written.
    /// A pair the successor already holds needs no hint: the successor is a
    /// natural replica and keeps it regardless of recovery.
    pub fn redistribute(&mut self, failed: &StorageNode) -> Result<(), storage::Error> {
        let probe = format!("{}:0", failed.node_id());
        let Some(target) = self.next_active(&probe, failed.node_id()) else {
            tracing::warn!(
                node_id = failed.node_id(),
                "no live successor to absorb measurements of failed node"
            );
            return Ok(());
        };

        tracing::info!(
            from = failed.node_id(),
            to = target.node_id(),
            "redistributing measurements of failed node"
        );
        for (key, value) in failed.get_all_keys()? {
            if !target.key_exists(&key)? {
                target.write(&key, &value)?;
                self.hints.insert(
                    key,
                    Hint {
                        holder_id: target.node_id(),
                        value,
                    },
                );
            }
        }
        Ok(())
    }

    /// Drain hints for a node that just came back: restore each hinted pair
    /// onto the recovered node, and reclaim the stand-in copy when its holder
    /// is not a natural replica of the key. Hints whose holder *is* the
    /// recovering node are left intact: the data is already in place.
    pub fn recover_node(&mut self, recovered: &StorageNode) -> Result<(), storage::Error> {
        tracing::info!(node_id = recovered.node_id(), "draining hints for recovered node");

        let pending: Vec<String> = self
            .hints
            .iter()
            .filter(|(_, hint)| hint.holder_id != recovered.node_id())
            .map(|(key, _)| key.clone())
            .collect();

        for key in pending {
            let Some(hint) = self.hints.remove(&key) else {
                continue;
            };
            let natural = self.responsible_nodes(&key);

            if let Some(holder) = self.node_by_id(hint.holder_id) {
                if !natural.iter().any(|node| node.node_id() == hint.holder_id) {
                    holder.delete(&key)?;
                }
            }
            if !recovered.key_exists(&key)? {
                recovered.write(&key, &hint.value)?;
            }
        }
        Ok(())
    }

    fn node_by_id(&self, node_id: u32) -> Option<Arc<StorageNode>> {
        self.nodes
            .values()
            .find(|node| node.node_id() == node_id)
            .cloned()
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("nodes", &self.nodes.values().map(|n| n.node_id()).collect::<Vec<_>>())
            .field("replication_factor", &self.replication_factor)
            .field("hints", &self.hints.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::Path;

    fn open_nodes(dir: &Path, count: u32) -> Vec<Arc<StorageNode>> {
        (0..count)
            .map(|id| Arc::new(StorageNode::open(id, 5000 + id as u16, dir).unwrap()))
            .collect()
    }

    fn ids(nodes: &[Arc<StorageNode>]) -> Vec<u32> {
        nodes.iter().map(|n| n.node_id()).collect()
    }

    #[test]
    fn ring_position_is_md5_big_endian() {
        // md5("0") == cfcd208495d565ef66e7dff9f98764da
        assert_eq!(
            ring_position(b"0"),
            0xcfcd208495d565ef66e7dff9f98764da_u128,
        );
    }

    #[test]
    fn replica_walk_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let nodes = open_nodes(tmp.path(), 3);

        // With node ids 0..3 the ring order is [1, 2, 0].
        let ring = HashRing::new(&nodes, None);
        assert_eq!(ring.replication_factor(), 3);
        assert_eq!(ids(&ring.responsible_nodes("aa:1")), vec![1, 2, 0]);
        assert_eq!(ids(&ring.responsible_nodes("ag:3")), vec![0, 1, 2]);
        assert_eq!(ids(&ring.responsible_nodes("dj:2")), vec![2, 0, 1]);

        // A fresh ring over the same ids walks identically.
        let again = HashRing::new(&nodes, Some(2));
        assert_eq!(ids(&again.responsible_nodes("aa:1")), vec![1, 2]);
        assert_eq!(ids(&again.responsible_nodes("ag:3")), vec![0, 1]);
        assert_eq!(ids(&again.responsible_nodes("dj:2")), vec![2, 0]);
    }

    #[test]
    fn factor_bounds() {
        let tmp = tempfile::tempdir().unwrap();
        let nodes = open_nodes(tmp.path(), 2);

        // An oversized factor truncates at the ring size.
        let ring = HashRing::new(&nodes, Some(5));
        assert_eq!(ring.responsible_nodes("aa:1").len(), 2);

        // Factor zero is clamped up rather than defaulting to nothing.
        let ring = HashRing::new(&nodes, Some(0));
        assert_eq!(ring.responsible_nodes("aa:1").len(), 1);
    }

    #[test]
    fn removing_a_node_shrinks_the_walk() {
        let tmp = tempfile::tempdir().unwrap();
        let nodes = open_nodes(tmp.path(), 3);
        let mut ring = HashRing::new(&nodes, Some(2));

        ring.remove_node(&nodes[1]);
        assert_eq!(ids(&ring.responsible_nodes("aa:1")), vec![2, 0]);

        ring.add_node(nodes[1].clone());
        assert_eq!(ids(&ring.responsible_nodes("aa:1")), vec![1, 2]);
    }

    #[test]
    fn empty_ring() {
        let ring = HashRing::new(&[], None);
        assert!(ring.responsible_nodes("aa:1").is_empty());
        assert!(ring.primary_live("aa:1").is_none());
        assert!(ring.next_active("aa:1", 0).is_none());
    }

    #[test]
    fn primary_live_follows_walk_order() {
        let tmp = tempfile::tempdir().unwrap();
        let nodes = open_nodes(tmp.path(), 3);
        let ring = HashRing::new(&nodes, Some(2));

        // "aa:1" -> [1, 2].
        assert_eq!(ring.primary_live("aa:1").unwrap().node_id(), 1);
        nodes[1].fail();
        assert_eq!(ring.primary_live("aa:1").unwrap().node_id(), 2);
        nodes[2].fail();
        assert!(ring.primary_live("aa:1").is_none());
    }

    #[test]
    fn next_active_skips_dead_and_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        let nodes = open_nodes(tmp.path(), 3);
        let ring = HashRing::new(&nodes, None);

        // The walk from "0:0" visits [1, 2, 0].
        assert_eq!(ring.next_active("0:0", 0).unwrap().node_id(), 1);
        nodes[1].fail();
        assert_eq!(ring.next_active("0:0", 0).unwrap().node_id(), 2);
        nodes[2].fail();
        assert!(ring.next_active("0:0", 0).is_none());
    }

    #[test]
    fn redistribute_records_hints_only_for_rehomed_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        let nodes = open_nodes(tmp.path(), 3);
        let mut ring = HashRing::new(&nodes, Some(2));

        // "ag:3" -> [0, 1] and "dj:2" -> [2, 0]; write both replica sets.
        nodes[0].write("ag:3", "7").unwrap();
        nodes[1].write("ag:3", "7").unwrap();
        nodes[2].write("dj:2", "9").unwrap();
        nodes[0].write("dj:2", "9").unwrap();

        nodes[0].fail();
        ring.redistribute(&nodes[0]).unwrap();

        // The successor for node 0 is node 1. It already held "ag:3" (it is
        // a natural replica), so only "dj:2" was re-homed and hinted.
        assert_eq!(nodes[1].read("dj:2").unwrap(), Some("9".to_string()));
        assert_eq!(ring.hints().len(), 1);
        assert_eq!(
            ring.hints().get("dj:2"),
            Some(&Hint {
                holder_id: 1,
                value: "9".to_string()
            })
        );
    }

    #[test]
    fn recover_reclaims_stand_in_copies() {
        let tmp = tempfile::tempdir().unwrap();
        let nodes = open_nodes(tmp.path(), 3);
        let mut ring = HashRing::new(&nodes, Some(2));

        nodes[2].write("dj:2", "9").unwrap();
        nodes[0].write("dj:2", "9").unwrap();

        nodes[0].fail();
        ring.redistribute(&nodes[0]).unwrap();
        assert_eq!(ring.hints().len(), 1);

        nodes[0].recover(&nodes, false).unwrap();
        ring.recover_node(&nodes[0]).unwrap();

        // Node 1 was only a stand-in for "dj:2" and gives it back; the
        // natural replicas still hold it; the hint is drained.
        assert_eq!(nodes[1].read("dj:2").unwrap(), None);
        assert_eq!(nodes[0].read("dj:2").unwrap(), Some("9".to_string()));
        assert_eq!(nodes[2].read("dj:2").unwrap(), Some("9".to_string()));
        assert!(ring.hints().is_empty());

        // Draining again is a no-op.
        ring.recover_node(&nodes[0]).unwrap();
        assert!(ring.hints().is_empty());
    }

    #[test]
    fn hints_held_by_recovering_node_stay() {
        let tmp = tempfile::tempdir().unwrap();
        let nodes = open_nodes(tmp.path(), 3);
        let mut ring = HashRing::new(&nodes, Some(2));

        nodes[2].write("dj:2", "9").unwrap();
        nodes[0].write("dj:2", "9").unwrap();

        nodes[0].fail();
        ring.redistribute(&nodes[0]).unwrap();
        assert_eq!(ring.hints().get("dj:2").unwrap().holder_id, 1);

        // Node 1 holds the hinted pair; recovering node 1 must not drain it.
        ring.recover_node(&nodes[1]).unwrap();
        assert_eq!(ring.hints().len(), 1);
        assert_eq!(nodes[1].read("dj:2").unwrap(), Some("9".to_string()));
    }

    #[test]
    fn restored_pair_is_not_rewritten_when_already_present() {
        let tmp = tempfile::tempdir().unwrap();
        let nodes = open_nodes(tmp.path(), 3);
        let mut ring = HashRing::new(&nodes, Some(2));

        // Only the failed primary holds the pair; it is re-homed with a hint.
        nodes[2].write("dj:2", "9").unwrap();
        nodes[2].fail();
        ring.redistribute(&nodes[2]).unwrap();

        // The successor walk for "2:0" lands on node 1, which is not a
        // natural replica of "dj:2" -> [2, 0].
        assert_eq!(ring.hints().get("dj:2").unwrap().holder_id, 1);
        assert_eq!(nodes[1].read("dj:2").unwrap(), Some("9".to_string()));

        nodes[2].recover(&nodes, false).unwrap();
        ring.recover_node(&nodes[2]).unwrap();

        assert_eq!(nodes[2].read("dj:2").unwrap(), Some("9".to_string()));
        assert_eq!(nodes[1].read("dj:2").unwrap(), None);
        assert!(ring.hints().is_empty());
    }
}
