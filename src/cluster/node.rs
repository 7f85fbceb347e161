//! Cluster node state.
//!
//! A `Node` is created by the cluster when topology discovery reports it
//! and is shared by reference with the dispatcher and the executors. It
//! owns the node's health counters and its connection pool.

use crate::cluster::health::NodeHealth;
use crate::cluster::pool::ConnectionPool;
use crate::config::ClientPolicy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Admin command dialects a node understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Unified partition-aware `query-show` for both scans and queries
    pub partition_query: bool,
    /// Separate `scan-show` / `query-show` commands
    pub query_show: bool,
}

impl NodeCapabilities {
    /// Current servers
    pub fn modern() -> Self {
        Self {
            partition_query: true,
            query_show: true,
        }
    }

    /// Servers that only speak the job monitor syntax
    pub fn legacy() -> Self {
        Self::default()
    }
}

/// Description of a node as reported by topology discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub address: String,
    pub rack_id: Option<u32>,
    pub capabilities: NodeCapabilities,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            rack_id: None,
            capabilities: NodeCapabilities::modern(),
        }
    }

    pub fn with_rack(mut self, rack_id: u32) -> Self {
        self.rack_id = Some(rack_id);
        self
    }

    pub fn with_capabilities(mut self, capabilities: NodeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

pub struct Node<C> {
    name: String,
    address: String,
    rack_id: Option<u32>,
    capabilities: NodeCapabilities,
    health: NodeHealth,
    pool: ConnectionPool<C>,
    active: AtomicBool,
}

impl<C: Send> Node<C> {
    pub fn new(spec: NodeSpec, policy: &ClientPolicy) -> Self {
        let pool = ConnectionPool::new(
            spec.name.clone(),
            policy.min_conns_per_node,
            policy.max_conns_per_node,
            policy.max_command_action,
            policy.max_commands_in_queue,
        );
        Self {
            name: spec.name,
            address: spec.address,
            rack_id: spec.rack_id,
            capabilities: spec.capabilities,
            health: NodeHealth::new(policy.max_error_rate),
            pool,
            active: AtomicBool::new(true),
        }
    }

    /// Mark the node as removed from the topology and drop its idle connections.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.pool.close();
    }
}

impl<C> Node<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn rack_id(&self) -> Option<u32> {
        self.rack_id
    }

    pub fn capabilities(&self) -> NodeCapabilities {
        self.capabilities
    }

    pub fn supports_partition_query(&self) -> bool {
        self.capabilities.partition_query
    }

    pub fn supports_query_show(&self) -> bool {
        self.capabilities.query_show
    }

    pub fn health(&self) -> &NodeHealth {
        &self.health
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl<C> std::fmt::Debug for Node<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("rack_id", &self.rack_id)
            .field("capabilities", &self.capabilities)
            .field("health", &self.health)
            .finish()
    }
}

impl<C> std::fmt::Display for Node<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation() {
        let policy = ClientPolicy::default().with_conns_per_node(1, 8);
        let node: Node<()> = Node::new(NodeSpec::new("A", "10.0.0.1:3000").with_rack(2), &policy);
        assert_eq!(node.name(), "A");
        assert_eq!(node.address(), "10.0.0.1:3000");
        assert_eq!(node.rack_id(), Some(2));
        assert!(node.supports_partition_query());
        assert!(node.is_active());
        assert_eq!(node.pool().max(), 8);
        assert_eq!(node.health().max_error_rate(), 100);
        assert_eq!(node.to_string(), "A 10.0.0.1:3000");
    }

    #[test]
    fn test_deactivate() {
        let node: Node<()> = Node::new(
            NodeSpec::new("B", "10.0.0.2:3000").with_capabilities(NodeCapabilities::legacy()),
            &ClientPolicy::default(),
        );
        assert!(!node.supports_query_show());
        node.deactivate();
        assert!(!node.is_active());
    }
}
