//! Partition ownership for one namespace.
//!
//! Topology discovery publishes, for every partition, the ordered list of
//! nodes holding it: master first, then replicas. The partition tracker
//! asks this map which node should serve a partition for a given replica
//! policy and retry count.

use crate::config::ReplicaPolicy;

/// Default number of partitions per namespace
pub const PARTITIONS: u16 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    namespace: String,
    /// owners[partition] = node names, master first
    owners: Vec<Vec<String>>,
}

impl PartitionMap {
    pub fn new(namespace: impl Into<String>, owners: Vec<Vec<String>>) -> Self {
        Self {
            namespace: namespace.into(),
            owners,
        }
    }

    /// Spread `partition_count` partitions over `nodes`, master of partition
    /// `p` being `nodes[p % n]` and its replicas the following nodes.
    pub fn round_robin(
        namespace: impl Into<String>,
        partition_count: u16,
        nodes: &[&str],
        replication: usize,
    ) -> Self {
        let replication = replication.clamp(1, nodes.len().max(1));
        let owners = (0..usize::from(partition_count))
            .map(|p| {
                if nodes.is_empty() {
                    return Vec::new();
                }
                (0..replication)
                    .map(|r| nodes[(p + r) % nodes.len()].to_string())
                    .collect()
            })
            .collect();
        Self::new(namespace, owners)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn partition_count(&self) -> u16 {
        self.owners.len() as u16
    }

    /// Owners of a partition, master first. Empty for unknown partitions.
    pub fn owners(&self, partition: u16) -> &[String] {
        self.owners
            .get(usize::from(partition))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replace the owner list of one partition (migrations).
    pub fn set_owners(&mut self, partition: u16, owners: Vec<String>) {
        if let Some(slot) = self.owners.get_mut(usize::from(partition)) {
            *slot = owners;
        }
    }

    /// Pick the node that should serve `partition`.
    ///
    /// `attempt` is the partition's retry count; `Sequence` rotates through
    /// the owner list with it so a retried partition moves to the next
    /// replica. Owners rejected by `eligible` are skipped.
    pub fn select_owner<E, R>(
        &self,
        partition: u16,
        replica: ReplicaPolicy,
        attempt: u32,
        eligible: E,
        on_preferred_rack: R,
    ) -> Option<&str>
    where
        E: Fn(&str) -> bool,
        R: Fn(&str) -> bool,
    {
        let owners = self.owners(partition);
        if owners.is_empty() {
            return None;
        }

        match replica {
            ReplicaPolicy::Master => {
                let master = owners[0].as_str();
                eligible(master).then_some(master)
            }
            ReplicaPolicy::Sequence => Self::sequence(owners, attempt, &eligible),
            ReplicaPolicy::PreferRack => owners
                .iter()
                .map(String::as_str)
                .find(|name| eligible(name) && on_preferred_rack(name))
                .or_else(|| Self::sequence(owners, attempt, &eligible)),
        }
    }

    fn sequence<'a, E>(owners: &'a [String], attempt: u32, eligible: &E) -> Option<&'a str>
    where
        E: Fn(&str) -> bool,
    {
        let start = attempt as usize % owners.len();
        (0..owners.len())
            .map(|i| owners[(start + i) % owners.len()].as_str())
            .find(|name| eligible(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any(_: &str) -> bool {
        true
    }

    fn none(_: &str) -> bool {
        false
    }

    #[test]
    fn test_round_robin_layout() {
        let map = PartitionMap::round_robin("test", 6, &["A", "B", "C"], 2);
        assert_eq!(map.partition_count(), 6);
        assert_eq!(map.owners(0), ["A", "B"]);
        assert_eq!(map.owners(4), ["B", "C"]);
        assert_eq!(map.owners(5), ["C", "A"]);
        assert!(map.owners(6).is_empty());
    }

    #[test]
    fn test_master_policy() {
        let map = PartitionMap::round_robin("test", 3, &["A", "B", "C"], 2);
        assert_eq!(map.select_owner(1, ReplicaPolicy::Master, 5, any, none), Some("B"));
        assert_eq!(
            map.select_owner(1, ReplicaPolicy::Master, 0, |n| n != "B", none),
            None
        );
    }

    #[test]
    fn test_sequence_rotates_on_retry() {
        let map = PartitionMap::round_robin("test", 3, &["A", "B", "C"], 3);
        assert_eq!(map.select_owner(0, ReplicaPolicy::Sequence, 0, any, none), Some("A"));
        assert_eq!(map.select_owner(0, ReplicaPolicy::Sequence, 1, any, none), Some("B"));
        assert_eq!(map.select_owner(0, ReplicaPolicy::Sequence, 3, any, none), Some("A"));
        // Ineligible owners are skipped.
        assert_eq!(
            map.select_owner(0, ReplicaPolicy::Sequence, 0, |n| n == "C", none),
            Some("C")
        );
        assert_eq!(map.select_owner(0, ReplicaPolicy::Sequence, 0, none, none), None);
    }

    #[test]
    fn test_prefer_rack() {
        let map = PartitionMap::round_robin("test", 3, &["A", "B", "C"], 3);
        assert_eq!(
            map.select_owner(0, ReplicaPolicy::PreferRack, 0, any, |n| n == "C"),
            Some("C")
        );
        assert_eq!(
            map.select_owner(0, ReplicaPolicy::PreferRack, 1, any, none),
            Some("B")
        );
    }

    #[test]
    fn test_set_owners() {
        let mut map = PartitionMap::round_robin("test", 2, &["A"], 1);
        map.set_owners(1, vec![]);
        assert_eq!(map.select_owner(1, ReplicaPolicy::Sequence, 0, any, none), None);
    }
}
