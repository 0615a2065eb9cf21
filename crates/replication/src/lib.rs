mod alerts;

pub use alerts::{Alert, AlertManager};

use std::path::Path;
use std::sync::Arc;

use placement::HashRing;
use storage::StorageNode;

/// Replication policy for measurement placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Every live node holds every measurement.
    Full,
    /// Placement on the hash ring with a replication factor.
    Consistent,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Full => f.write_str("full"),
            Strategy::Consistent => f.write_str("consistent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Alive,
    Dead,
}

/// Wire-facing status of a single storage node.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeStatus {
    pub node_id: u32,
    pub status: NodeHealth,
    pub port: u16,
}

/// A successfully retrieved measurement and the node that served it.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieved {
    pub value: String,
    pub source_node_id: u32,
}

/// ReplicationManager owns the fixed set of storage nodes and routes every
/// measurement operation according to the active strategy. Under `full` it
/// fans writes out to all live nodes and reads from the first live hit in id
/// order; under `consistent` it follows the hash ring's replica walk, with
/// hinted handoff on failure and hint drainage on recovery.
///
/// The manager is not internally synchronized: callers serialize operations
/// behind one exclusive lock held for the duration of each call.
pub struct ReplicationManager {
    nodes: Vec<Arc<StorageNode>>,
    strategy: Strategy,
    hash_ring: Option<HashRing>,
    alert_manager: AlertManager,
}

impl ReplicationManager {
    /// Open `num_nodes` storage nodes with ids `0..num_nodes` and metadata
    /// ports `base_port + id`, all backed by files under `data_dir`. The
    /// manager starts on the `full` strategy.
    pub fn new(num_nodes: u32, base_port: u16, data_dir: &Path) -> Result<Self, storage::Error> {
        let nodes = (0..num_nodes)
            .map(|id| StorageNode::open(id, base_port + id as u16, data_dir).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            nodes,
            strategy: Strategy::Full,
            hash_ring: None,
            alert_manager: AlertManager::new(),
        })
    }

    pub fn nodes(&self) -> &[Arc<StorageNode>] {
        &self.nodes
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// The active hash ring, present iff the strategy is `consistent`.
    pub fn hash_ring(&self) -> Option<&HashRing> {
        self.hash_ring.as_ref()
    }

    /// Switch the replication strategy. Entering `consistent` builds a fresh
    /// ring over all nodes (factor defaults to the node count); leaving it
    /// discards the ring together with any pending hints. No data moves:
    /// subsequent writes follow the new placement and reads the new policy.
    pub fn set_strategy(&mut self, strategy: Strategy, replication_factor: Option<usize>) {
        self.strategy = strategy;
        self.hash_ring = match strategy {
            Strategy::Consistent => Some(HashRing::new(&self.nodes, replication_factor)),
            Strategy::Full => None,
        };
        tracing::info!(%strategy, replication_factor, "configured replication strategy");
    }

    /// Write a measurement to its replica set, skipping dead nodes, then run
    /// the anomaly check exactly once.
    pub fn store_measurement(&mut self, key: &str, value: &str) -> Result<(), storage::Error> {
        match self.strategy {
            Strategy::Full => {
                for node in &self.nodes {
                    if node.is_alive() {
                        node.write(key, value)?;
                    }
                }
            }
            Strategy::Consistent => {
                if let Some(ring) = &self.hash_ring {
                    for node in ring.responsible_nodes(key) {
                        if node.is_alive() {
                            node.write(key, value)?;
                        }
                    }
                }
            }
        }

        self.alert_manager.check(key, value);
        Ok(())
    }

    /// Read a measurement. Under `full` the first live node holding the key
    /// (in id order) serves it; under `consistent` only the first live
    /// replica in walk order is consulted.
    pub fn retrieve_measurement(&self, key: &str) -> Result<Option<Retrieved>, storage::Error> {
        match self.strategy {
            Strategy::Full => {
                for node in &self.nodes {
                    if !node.is_alive() {
                        continue;
                    }
                    if let Some(value) = node.read(key)? {
                        return Ok(Some(Retrieved {
                            value,
                            source_node_id: node.node_id(),
                        }));
                    }
                }
            }
            Strategy::Consistent => {
                if let Some(node) = self.hash_ring.as_ref().and_then(|ring| ring.primary_live(key)) {
                    if let Some(value) = node.read(key)? {
                        return Ok(Some(Retrieved {
                            value,
                            source_node_id: node.node_id(),
                        }));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Delete a measurement from every node. Dead nodes drop the delete, so
    /// it does not replay on their recovery.
    pub fn delete_measurement(&mut self, key: &str) -> Result<(), storage::Error> {
        for node in &self.nodes {
            node.delete(key)?;
        }
        Ok(())
    }

    /// True iff any live node holds the key.
    pub fn measurement_exists(&self, key: &str) -> Result<bool, storage::Error> {
        for node in &self.nodes {
            if node.is_alive() && node.key_exists(key)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Simulate failure of a node. Under `consistent` its measurements are
    /// re-homed onto the next live successor with hints recorded, before
    /// this call returns. Failing an already-dead node is a no-op.
    pub fn fail_node(&mut self, node_id: u32) -> Result<(), storage::Error> {
        let Some(node) = self.nodes.get(node_id as usize).cloned() else {
            tracing::warn!(node_id, "fail_node on unknown node");
            return Ok(());
        };
        if !node.is_alive() {
            return Ok(());
        }

        node.fail();
        tracing::info!(node_id, "node marked failed");

        if self.strategy == Strategy::Consistent {
            if let Some(ring) = &mut self.hash_ring {
                ring.redistribute(&node)?;
            }
        }
        Ok(())
    }

    /// Recover a failed node. Under `full` the node synchronizes with its
    /// live peers; under `consistent` pending hints are drained onto it.
    /// Both complete before this call returns, and repeating the call is a
    /// no-op.
    pub fn recover_node(&mut self, node_id: u32) -> Result<(), storage::Error> {
        let Some(node) = self.nodes.get(node_id as usize).cloned() else {
            tracing::warn!(node_id, "recover_node on unknown node");
            return Ok(());
        };

        node.recover(&self.nodes, self.strategy == Strategy::Full)?;
        tracing::info!(node_id, strategy = %self.strategy, "node recovered");

        if self.strategy == Strategy::Consistent {
            if let Some(ring) = &mut self.hash_ring {
                ring.recover_node(&node)?;
            }
        }
        Ok(())
    }

    /// Status of every node, in id order.
    pub fn storage_status(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(|node| status_of(node)).collect()
    }

    /// The replica set for `key` under `consistent`, rendered as node
    /// statuses in walk order; None when consistent hashing is not active.
    pub fn responsible_nodes(&self, key: &str) -> Option<Vec<NodeStatus>> {
        if self.strategy != Strategy::Consistent {
            return None;
        }
        let ring = self.hash_ring.as_ref()?;
        Some(
            ring.responsible_nodes(key)
                .iter()
                .map(|node| status_of(node))
                .collect(),
        )
    }

    pub fn set_threshold(&mut self, sensor_id: &str, threshold: f64) {
        self.alert_manager.set_threshold(sensor_id, threshold);
    }

    pub fn alerts(&self) -> &[Alert] {
        self.alert_manager.alerts()
    }
}

fn status_of(node: &StorageNode) -> NodeStatus {
    NodeStatus {
        node_id: node.node_id(),
        status: if node.is_alive() {
            NodeHealth::Alive
        } else {
            NodeHealth::Dead
        },
        port: node.port(),
    }
}
