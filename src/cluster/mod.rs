//! Cluster view of the client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   Cluster: nodes, partition maps, tending   │
//! └─────────────────────────────────────────────┘
//!          │                         │
//!          ▼                         ▼
//! ┌──────────────────┐   ┌─────────────────────┐
//! │ Node             │   │ PartitionMap        │
//! │  NodeHealth      │   │  owners per         │
//! │  ConnectionPool  │   │  partition          │
//! └──────────────────┘   └─────────────────────┘
//!          │
//!          ▼
//! ┌─────────────────────────────────────────────┐
//! │   Dispatcher ──▶ Transport (sockets, wire)  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Topology discovery is external: callers register nodes and publish
//! partition maps. The tend pass resets error-rate windows, trims idle
//! connections and keeps every pool at its minimum size.

mod health;
mod node;
mod partition_map;
mod pool;

pub use health::NodeHealth;
pub use node::{Node, NodeCapabilities, NodeSpec};
pub use partition_map::{PartitionMap, PARTITIONS};
pub use pool::{ConnectionPool, PooledConnection};

use crate::command::{Dispatcher, Transport};
use crate::config::{ClientPolicy, InfoPolicy, QueryPolicy};
use crate::error::{ClientError, Result};
use crate::observability::ClientMetrics;
use crate::query::{PartitionExecutor, PartitionFilter, PartitionTracker, RecordSet, Statement};
use crate::task::ExecuteTask;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Cluster<T: Transport> {
    policy: ClientPolicy,
    dispatcher: Dispatcher<T>,
    nodes: RwLock<Vec<Arc<Node<T::Conn>>>>,
    partition_maps: RwLock<HashMap<String, Arc<PartitionMap>>>,
    tend_count: AtomicU64,
    tending: AtomicBool,
    metrics: Arc<ClientMetrics>,
    shutdown: CancellationToken,
}

impl<T: Transport> Cluster<T> {
    pub fn new(policy: ClientPolicy, transport: T) -> Result<Arc<Self>> {
        policy.validate()?;
        let metrics = Arc::new(ClientMetrics::new());
        let dispatcher = Dispatcher::new(Arc::new(transport), policy.timeout(), Arc::clone(&metrics));
        Ok(Arc::new(Self {
            policy,
            dispatcher,
            nodes: RwLock::new(Vec::new()),
            partition_maps: RwLock::new(HashMap::new()),
            tend_count: AtomicU64::new(0),
            tending: AtomicBool::new(false),
            metrics,
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn policy(&self) -> &ClientPolicy {
        &self.policy
    }

    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Register a node and open its minimum connections. A node that cannot
    /// be reached yet is still registered; the tend pass keeps retrying.
    pub async fn add_node(&self, spec: NodeSpec) -> Result<Arc<Node<T::Conn>>> {
        let node = Arc::new(Node::new(spec, &self.policy));
        {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            if nodes.iter().any(|n| n.name() == node.name()) {
                return Err(ClientError::InvalidNode(format!(
                    "node {} already registered",
                    node.name()
                )));
            }
            nodes.push(Arc::clone(&node));
        }
        info!("Added node {}", node);

        let dispatcher = &self.dispatcher;
        let target: &Node<T::Conn> = &node;
        match node.pool().fill_to_min(move || dispatcher.connect(target)).await {
            Ok(opened) if opened > 0 => debug!("Opened {} connections to {}", opened, node.name()),
            Ok(_) => {}
            Err(e) => warn!("Could not warm connections to {}: {}", node.name(), e),
        }
        Ok(node)
    }

    /// Remove a node from the topology. Its in-flight commands finish but
    /// no new command is sent to it.
    pub fn remove_node(&self, name: &str) -> Option<Arc<Node<T::Conn>>> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let idx = nodes.iter().position(|n| n.name() == name)?;
        let node = nodes.remove(idx);
        node.deactivate();
        info!("Removed node {}", node);
        Some(node)
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node<T::Conn>>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|n| n.name() == name)
            .cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node<T::Conn>>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Active nodes, failing when there are none.
    pub fn validate_nodes(&self) -> Result<Vec<Arc<Node<T::Conn>>>> {
        let nodes: Vec<_> = self.nodes().into_iter().filter(|n| n.is_active()).collect();
        if nodes.is_empty() {
            return Err(ClientError::ClusterEmpty);
        }
        Ok(nodes)
    }

    /// Publish the partition ownership of a namespace.
    pub fn set_partition_map(&self, map: PartitionMap) {
        debug!(
            "Partition map for '{}': {} partitions",
            map.namespace(),
            map.partition_count()
        );
        self.partition_maps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(map.namespace().to_string(), Arc::new(map));
    }

    pub fn partition_map(&self, namespace: &str) -> Result<Arc<PartitionMap>> {
        self.partition_maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(namespace)
            .cloned()
            .ok_or_else(|| ClientError::InvalidNamespace(namespace.to_string()))
    }

    pub fn tend_count(&self) -> u64 {
        self.tend_count.load(Ordering::Acquire)
    }

    /// Run one maintenance pass. Returns `false` without doing anything
    /// when another pass is still running.
    pub async fn tend(&self) -> bool {
        if self
            .tending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Tend already running, skipping");
            return false;
        }
        let _running = TendGuard(&self.tending);

        let count = self.tend_count.fetch_add(1, Ordering::AcqRel) + 1;
        let mut open = 0;
        for node in self.nodes() {
            if node.health().on_tend(count, self.policy.error_rate_window) {
                debug!("Reset error count of {}", node.name());
            }
            if let Some(max_idle) = self.policy.max_socket_idle() {
                let trimmed = node.pool().trim_idle(max_idle);
                if trimmed > 0 {
                    debug!("Closed {} idle connections to {}", trimmed, node.name());
                }
            }
            let dispatcher = &self.dispatcher;
            let target: &Node<T::Conn> = &node;
            if let Err(e) = node.pool().fill_to_min(move || dispatcher.connect(target)).await {
                warn!("Could not refill connections to {}: {}", node.name(), e);
            }
            open += node.pool().open();
        }

        self.metrics.open_connections.set(open as u64);
        self.metrics.tends.inc();
        true
    }

    /// Run [`Cluster::tend`] every `tend_interval` until [`Cluster::close`].
    /// Ticks missed while a pass runs long are skipped.
    pub fn spawn_tend(self: &Arc<Self>) -> JoinHandle<()> {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cluster.policy.tend_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cluster.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        cluster.tend().await;
                    }
                }
            }
            debug!("Tend loop stopped");
        })
    }

    /// Stop tending, drop every node and close its pool. Operations started
    /// afterwards find no node to talk to.
    pub fn close(&self) {
        self.shutdown.cancel();
        let nodes: Vec<_> = self
            .nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let mut closed = 0;
        for node in nodes {
            closed += node.pool().idle();
            node.deactivate();
        }
        self.metrics.open_connections.set(0);
        info!("Cluster closed ({} idle connections dropped)", closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Query or scan every partition of the statement's namespace.
    pub fn query(self: &Arc<Self>, policy: &QueryPolicy, statement: Statement) -> Result<RecordSet> {
        self.query_filtered(policy, statement, PartitionFilter::all())
    }

    /// Query or scan the partitions selected by `filter`.
    pub fn query_filtered(
        self: &Arc<Self>,
        policy: &QueryPolicy,
        statement: Statement,
        filter: PartitionFilter,
    ) -> Result<RecordSet> {
        let map = self.partition_map(&statement.namespace)?;
        let tracker = PartitionTracker::with_filter(map.partition_count(), filter)?;
        Ok(self.query_with_tracker(policy, statement, Arc::new(tracker)))
    }

    /// Run a statement against an existing tracker. Partitions the tracker
    /// already holds as done are skipped and unfinished ones resume after
    /// their last delivered record.
    pub fn query_with_tracker(
        self: &Arc<Self>,
        policy: &QueryPolicy,
        statement: Statement,
        tracker: Arc<PartitionTracker>,
    ) -> RecordSet {
        PartitionExecutor::new(Arc::clone(self), policy.clone(), statement, tracker).execute()
    }

    /// Handle on a background job started with `task_id`.
    pub fn execute_task(self: &Arc<Self>, statement: &Statement, task_id: u64, policy: InfoPolicy) -> ExecuteTask<T> {
        ExecuteTask::new(Arc::clone(self), statement, task_id, policy)
    }
}

struct TendGuard<'a>(&'a AtomicBool);

impl Drop for TendGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T: Transport> std::fmt::Debug for Cluster<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.nodes().len())
            .field("tend_count", &self.tend_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
