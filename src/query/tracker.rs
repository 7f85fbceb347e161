//! Partition tracker
//!
//! Owns the status table of one logical query or scan. Every partition is
//! in exactly one [`PartitionState`]:
//!
//! ```text
//!            assign                 done signal
//! Pending ─────────────▶ InFlight ─────────────▶ Done
//!    ▲                    │   │
//!    │  retryable failure │   │ fatal failure
//!    └────────────────────┘   ▼
//!    ◀──────────────────── Errored
//!         partition_error
//! ```
//!
//! `Done` is terminal. Rounds are numbered; a mutation carrying a round
//! number that is no longer current is ignored, so a worker that outlives
//! its round (aborted, timed out, cancelled) cannot touch the table.

use crate::cluster::{Cluster, Node};
use crate::command::Transport;
use crate::config::ReplicaPolicy;
use crate::error::{ClientError, Result};
use crate::record::Digest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    /// Waiting to be assigned in the next round
    Pending,
    /// Assigned to a node in the current round
    InFlight,
    /// Every record delivered
    Done,
    /// The serving node failed with a non-retryable error
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStatus {
    pub id: u16,
    pub state: PartitionState,
    /// Node serving the partition in the current or last round
    pub node: Option<String>,
    /// Times the partition was sent back for another round
    pub retries: u32,
    /// Last digest delivered; the next round resumes after it
    pub resume_after: Option<Digest>,
}

impl PartitionStatus {
    fn new(id: u16) -> Self {
        Self {
            id,
            state: PartitionState::Pending,
            node: None,
            retries: 0,
            resume_after: None,
        }
    }

    fn owned_by(&self, node: &str) -> bool {
        self.state == PartitionState::InFlight && self.node.as_deref() == Some(node)
    }
}

/// Partition and resume point sent to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCursor {
    pub id: u16,
    pub resume_after: Option<Digest>,
}

/// Subset of a namespace's partitions to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFilter {
    begin: u16,
    count: Option<u16>,
}

impl PartitionFilter {
    /// Every partition of the namespace.
    pub fn all() -> Self {
        Self {
            begin: 0,
            count: None,
        }
    }

    pub fn by_id(id: u16) -> Self {
        Self {
            begin: id,
            count: Some(1),
        }
    }

    pub fn by_range(begin: u16, count: u16) -> Self {
        Self {
            begin,
            count: Some(count),
        }
    }

    fn resolve(&self, partition_count: u16) -> Result<(u16, u16)> {
        let count = self
            .count
            .unwrap_or_else(|| partition_count.saturating_sub(self.begin));
        let end = u32::from(self.begin) + u32::from(count);
        if count == 0 || end > u32::from(partition_count) {
            return Err(ClientError::Config(format!(
                "partition range [{}, {}) outside 0..{}",
                self.begin, end, partition_count
            )));
        }
        Ok((self.begin, count))
    }
}

impl Default for PartitionFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Partitions assigned to one node for one round.
pub struct NodePartitions<C> {
    pub node: Arc<Node<C>>,
    pub round: u64,
    pub partitions: Vec<PartitionCursor>,
}

impl<C> NodePartitions<C> {
    pub fn partition_ids(&self) -> Vec<u16> {
        self.partitions.iter().map(|p| p.id).collect()
    }
}

impl<C> std::fmt::Debug for NodePartitions<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePartitions")
            .field("node", &self.node.name())
            .field("round", &self.round)
            .field("partitions", &self.partition_ids())
            .finish()
    }
}

struct TrackerState {
    statuses: Vec<PartitionStatus>,
    /// Current round number; bumped whenever a round is opened or closed
    round: u64,
}

pub struct PartitionTracker {
    begin: u16,
    state: Mutex<TrackerState>,
    iteration: AtomicU32,
}

impl PartitionTracker {
    /// Track every partition of a namespace with `partition_count` partitions.
    pub fn new(partition_count: u16) -> Self {
        let statuses = (0..partition_count).map(PartitionStatus::new).collect();
        Self {
            begin: 0,
            state: Mutex::new(TrackerState { statuses, round: 0 }),
            iteration: AtomicU32::new(0),
        }
    }

    /// Track the partitions selected by `filter`.
    pub fn with_filter(partition_count: u16, filter: PartitionFilter) -> Result<Self> {
        let (begin, count) = filter.resolve(partition_count)?;
        let statuses = (begin..begin + count).map(PartitionStatus::new).collect();
        Ok(Self {
            begin,
            state: Mutex::new(TrackerState { statuses, round: 0 }),
            iteration: AtomicU32::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn index(&self, partition: u16) -> Option<usize> {
        partition.checked_sub(self.begin).map(usize::from)
    }

    /// Retry rounds started so far.
    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::Acquire)
    }

    /// Start a retry round. Returns the new iteration.
    pub fn next_round(&self) -> u32 {
        self.iteration.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn len(&self) -> usize {
        self.lock().statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self, partition: u16) -> Option<PartitionStatus> {
        let idx = self.index(partition)?;
        self.lock().statuses.get(idx).cloned()
    }

    pub fn statuses(&self) -> Vec<PartitionStatus> {
        self.lock().statuses.clone()
    }

    pub fn count(&self, state: PartitionState) -> usize {
        self.lock()
            .statuses
            .iter()
            .filter(|s| s.state == state)
            .count()
    }

    /// True iff every tracked partition is done.
    pub fn is_complete(&self) -> bool {
        self.lock()
            .statuses
            .iter()
            .all(|s| s.state == PartitionState::Done)
    }

    /// Group every pending partition by the node that should serve it and
    /// mark them in flight. Fails without touching the table when a
    /// partition has no eligible owner.
    pub fn assign_partitions_to_nodes<T: Transport>(
        &self,
        cluster: &Cluster<T>,
        namespace: &str,
        replica: ReplicaPolicy,
    ) -> Result<Vec<NodePartitions<T::Conn>>> {
        let map = cluster.partition_map(namespace)?;
        let nodes: HashMap<String, Arc<Node<T::Conn>>> = cluster
            .nodes()
            .into_iter()
            .filter(|n| n.is_active())
            .map(|n| (n.name().to_string(), n))
            .collect();
        let racks = &cluster.policy().rack_ids;

        let mut state = self.lock();
        let mut picks = Vec::new();
        for (idx, status) in state.statuses.iter().enumerate() {
            if status.state != PartitionState::Pending {
                continue;
            }
            let owner = map
                .select_owner(
                    status.id,
                    replica,
                    status.retries,
                    |name| nodes.contains_key(name),
                    |name| {
                        nodes
                            .get(name)
                            .and_then(|n| n.rack_id())
                            .map(|rack| racks.contains(&rack))
                            .unwrap_or(false)
                    },
                )
                .ok_or_else(|| ClientError::NoAvailableNode {
                    namespace: namespace.to_string(),
                    partition: status.id,
                })?;
            picks.push((idx, owner.to_string()));
        }

        if picks.is_empty() {
            return Ok(Vec::new());
        }

        state.round += 1;
        let round = state.round;
        let mut groups: Vec<NodePartitions<T::Conn>> = Vec::new();
        let mut by_node: HashMap<String, usize> = HashMap::new();
        for (idx, owner) in picks {
            let status = &mut state.statuses[idx];
            status.state = PartitionState::InFlight;
            status.node = Some(owner.clone());
            let cursor = PartitionCursor {
                id: status.id,
                resume_after: status.resume_after,
            };

            let slot = match by_node.get(&owner) {
                Some(slot) => *slot,
                None => {
                    groups.push(NodePartitions {
                        node: Arc::clone(&nodes[&owner]),
                        round,
                        partitions: Vec::new(),
                    });
                    by_node.insert(owner, groups.len() - 1);
                    groups.len() - 1
                }
            };
            groups[slot].partitions.push(cursor);
        }
        Ok(groups)
    }

    /// Whether a record for `partition` from `node` belongs to the current round.
    pub fn accepts(&self, round: u64, node: &str, partition: u16) -> bool {
        let Some(idx) = self.index(partition) else {
            return false;
        };
        let state = self.lock();
        state.round == round
            && state
                .statuses
                .get(idx)
                .map(|s| s.owned_by(node))
                .unwrap_or(false)
    }

    /// Advance the resume point of a partition after a record was delivered.
    pub fn record_received(&self, round: u64, node: &str, partition: u16, digest: Digest) -> bool {
        self.update(round, node, partition, |status| {
            status.resume_after = Some(digest);
        })
    }

    /// Mark a partition done. A second done signal for a partition that is
    /// already done is ignored. Returns whether the status changed.
    pub fn partition_done(&self, round: u64, node: &str, partition: u16) -> bool {
        self.update(round, node, partition, |status| {
            status.state = PartitionState::Done;
        })
    }

    /// Send a partition the node does not own back for the next round.
    pub fn partition_unavailable(&self, round: u64, node: &str, partition: u16) -> bool {
        self.update(round, node, partition, |status| {
            status.state = PartitionState::Pending;
            status.retries += 1;
        })
    }

    fn update<F>(&self, round: u64, node: &str, partition: u16, f: F) -> bool
    where
        F: FnOnce(&mut PartitionStatus),
    {
        let Some(idx) = self.index(partition) else {
            return false;
        };
        let mut state = self.lock();
        if state.round != round {
            return false;
        }
        match state.statuses.get_mut(idx) {
            Some(status) if status.owned_by(node) => {
                f(status);
                true
            }
            _ => false,
        }
    }

    /// A node failed its command. Its unfinished partitions go back to
    /// pending when `retryable`, otherwise they are marked errored.
    /// Partitions it already finished stay done.
    pub fn node_failed(&self, round: u64, node: &str, partitions: &[PartitionCursor], retryable: bool) {
        let mut state = self.lock();
        if state.round != round {
            return;
        }
        for cursor in partitions {
            let Some(idx) = self.index(cursor.id) else {
                continue;
            };
            if let Some(status) = state.statuses.get_mut(idx) {
                if !status.owned_by(node) {
                    continue;
                }
                if retryable {
                    status.state = PartitionState::Pending;
                    status.retries += 1;
                } else {
                    status.state = PartitionState::Errored;
                }
            }
        }
    }

    /// Close the current round. Partitions still in flight (their node
    /// finished without a done signal) go back to pending. Returns how
    /// many were sent back.
    pub fn end_round(&self) -> usize {
        let mut state = self.lock();
        state.round += 1;
        let mut requeued = 0;
        for status in state.statuses.iter_mut() {
            if status.state == PartitionState::InFlight {
                status.state = PartitionState::Pending;
                status.retries += 1;
                requeued += 1;
            }
        }
        requeued
    }

    /// Abandon the current round after a failure. Completed partitions
    /// are kept; in-flight and errored partitions become pending so a later
    /// run only queries what is left.
    pub fn partition_error(&self) {
        let mut state = self.lock();
        state.round += 1;
        for status in state.statuses.iter_mut() {
            if matches!(
                status.state,
                PartitionState::InFlight | PartitionState::Errored
            ) {
                status.state = PartitionState::Pending;
            }
        }
    }
}

impl std::fmt::Debug for PartitionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionTracker")
            .field("partitions", &self.len())
            .field("done", &self.count(PartitionState::Done))
            .field("iteration", &self.iteration())
            .finish()
    }
}
