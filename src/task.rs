//! Background job status polling.
//!
//! A statement executed as a background job runs on every node under one
//! task id. [`ExecuteTask`] asks each node for the job's status in the
//! admin dialect that node understands and folds the answers into a
//! cluster-wide status.

use crate::cluster::Cluster;
use crate::command::{AdminDialect, TaskModule, Transport};
use crate::config::InfoPolicy;
use crate::error::{ClientError, Result};
use crate::query::Statement;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default delay between two status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// A node does not know the job (not started yet, or already forgotten)
    NotFound,
    InProgress,
    Complete,
}

pub struct ExecuteTask<T: Transport> {
    cluster: Arc<Cluster<T>>,
    task_id: u64,
    module: TaskModule,
    policy: InfoPolicy,
    stop: CancellationToken,
}

impl<T: Transport> ExecuteTask<T> {
    pub fn new(cluster: Arc<Cluster<T>>, statement: &Statement, task_id: u64, policy: InfoPolicy) -> Self {
        Self {
            cluster,
            task_id,
            module: statement.module(),
            policy,
            stop: CancellationToken::new(),
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn module(&self) -> TaskModule {
        self.module
    }

    /// Ask every node for the job's status.
    ///
    /// The job is complete only when every node says so. The first node
    /// reporting not found or in progress decides the answer; an error
    /// from any node fails the whole poll.
    pub async fn query_status(&self) -> Result<TaskStatus> {
        let nodes = self.cluster.validate_nodes()?;
        for node in nodes {
            let dialect = AdminDialect::for_capabilities(node.capabilities());
            let command = dialect.status_command(self.module, self.task_id);
            let response = self
                .cluster
                .dispatcher()
                .admin(&node, &command, self.policy.timeout())
                .await?;
            let status = dialect.parse_status(&command, &response)?;
            debug!("Task {} on {}: {:?}", self.task_id, node.name(), status);
            if status != TaskStatus::Complete {
                return Ok(status);
            }
        }
        Ok(TaskStatus::Complete)
    }

    /// Wait for the job to finish, polling every second, bounded by the
    /// info policy timeout (0 = no bound).
    pub async fn wait(&self) -> Result<()> {
        let timeout = self.policy.timeout().unwrap_or(Duration::ZERO);
        self.wait_with(DEFAULT_POLL_INTERVAL, timeout).await
    }

    /// Poll every `interval` until the job is complete.
    ///
    /// With a zero `timeout` the wait is unbounded and a job no node knows
    /// is treated as finished. With a bound, a job still unknown when the
    /// bound runs out is treated as finished; one still running is a
    /// [`ClientError::Timeout`].
    pub async fn wait_with(&self, interval: Duration, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Err(ClientError::Cancelled),
                _ = ticker.tick() => {}
            }

            let status = self.query_status().await?;
            if status == TaskStatus::Complete || (status == TaskStatus::NotFound && timeout.is_zero()) {
                info!("Task {} complete", self.task_id);
                return Ok(());
            }

            if !timeout.is_zero() && Instant::now() + interval > deadline {
                if status == TaskStatus::NotFound {
                    debug!("Task {} never seen before the deadline, assuming done", self.task_id);
                    return Ok(());
                }
                return Err(ClientError::Timeout { timeout, iteration: 0 });
            }
        }
    }

    /// Abandon any wait in progress on this task.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl<T: Transport> std::fmt::Debug for ExecuteTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteTask")
            .field("task_id", &self.task_id)
            .field("module", &self.module)
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}
