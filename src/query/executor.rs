//! Partitioned query executor
//!
//! Runs a statement over every partition the tracker still has pending,
//! one round at a time. A round asks the tracker to group pending
//! partitions by node, then runs one worker per node, at most
//! `max_concurrent_nodes` at once. Partitions that fail retryably are sent
//! to the next round under a fresh task id; a non-retryable failure ends
//! the operation after the round's other workers have finished.

use crate::cluster::Cluster;
use crate::command::{PartitionRequest, RecordSink, Transport};
use crate::config::{QueryPolicy, ResultOrdering};
use crate::error::{ClientError, Result};
use crate::observability::ClientMetrics;
use crate::query::record_set::RecordSet;
use crate::query::statement::{next_task_id, Statement};
use crate::query::tracker::{NodePartitions, PartitionState, PartitionTracker};
use crate::record::KeyRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type RecordSender = mpsc::Sender<Result<KeyRecord>>;
type RecordBuffer = Arc<Mutex<BTreeMap<u16, BufferedPartition>>>;

/// One partition's output held back until the round ends. Neither its
/// records nor its done signal reach the tracker before they are sent.
struct BufferedPartition {
    node: String,
    records: Vec<KeyRecord>,
    done: bool,
}

pub struct PartitionExecutor<T: Transport> {
    cluster: Arc<Cluster<T>>,
    policy: QueryPolicy,
    statement: Arc<Statement>,
    tracker: Arc<PartitionTracker>,
}

/// How a round ended when it was not interrupted.
#[derive(Debug, Default)]
struct RoundOutcome {
    /// First non-retryable node error
    fatal: Option<ClientError>,
    /// Nodes that failed retryably
    retried_nodes: usize,
}

impl<T: Transport> PartitionExecutor<T> {
    pub fn new(
        cluster: Arc<Cluster<T>>,
        policy: QueryPolicy,
        statement: Statement,
        tracker: Arc<PartitionTracker>,
    ) -> Self {
        Self {
            cluster,
            policy,
            statement: Arc::new(statement),
            tracker,
        }
    }

    /// Start the operation in the background and return its record stream.
    pub fn execute(self) -> RecordSet {
        let (tx, rx) = mpsc::channel(self.policy.record_queue_size.max(1));
        let cancel = CancellationToken::new();
        let tracker = Arc::clone(&self.tracker);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = self.run(&tx, &token).await {
                debug!("Query on namespace '{}' ended: {}", self.statement.namespace, e);
                // The consumer may already be gone.
                let _ = tx.send(Err(e)).await;
            }
        });
        RecordSet::new(rx, cancel, tracker, task)
    }

    async fn run(&self, tx: &RecordSender, cancel: &CancellationToken) -> Result<()> {
        let deadline = self.policy.total_timeout().map(|t| Instant::now() + t);
        let mut task_id = self.statement.prepare_task_id();

        loop {
            if cancel.is_cancelled() {
                self.tracker.partition_error();
                return Err(ClientError::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.tracker.partition_error();
                return Err(self.timeout_error());
            }

            let assignments = self.tracker.assign_partitions_to_nodes(
                &*self.cluster,
                &self.statement.namespace,
                self.policy.replica,
            )?;
            if assignments.is_empty() {
                break;
            }

            self.cluster.metrics().rounds.inc();
            debug!(
                "Round {} (task {}): {} nodes, {} partitions",
                self.tracker.iteration(),
                task_id,
                assignments.len(),
                assignments.iter().map(|a| a.partitions.len()).sum::<usize>()
            );

            let outcome = match self.run_round(assignments, task_id, tx, cancel, deadline).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.tracker.partition_error();
                    return Err(e);
                }
            };

            if let Some(e) = outcome.fatal {
                self.tracker.partition_error();
                return Err(ClientError::partial_failure(
                    "query",
                    self.tracker.iteration(),
                    e,
                ));
            }

            let requeued = self.tracker.end_round();
            if self.tracker.is_complete() {
                break;
            }

            info!(
                "Retrying {} partitions ({} nodes failed, {} unfinished)",
                self.tracker.count(PartitionState::Pending),
                outcome.retried_nodes,
                requeued
            );
            self.pause_before_retry(cancel, deadline).await?;
            self.tracker.next_round();
            self.cluster.metrics().retry_rounds.inc();
            task_id = next_task_id(task_id);
        }

        debug!(
            "Query on namespace '{}' complete after {} retries",
            self.statement.namespace,
            self.tracker.iteration()
        );
        Ok(())
    }

    async fn run_round(
        &self,
        assignments: Vec<NodePartitions<T::Conn>>,
        task_id: u64,
        tx: &RecordSender,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<RoundOutcome> {
        let round_cancel = cancel.child_token();
        let permits = Arc::new(Semaphore::new(self.policy.concurrency(assignments.len())));
        let round = assignments.first().map(|a| a.round).unwrap_or_default();
        let buffer: Option<RecordBuffer> = (self.policy.ordering == ResultOrdering::Ordered)
            .then(|| Arc::new(Mutex::new(BTreeMap::new())));

        let mut workers = JoinSet::new();
        for assignment in assignments {
            let request = PartitionRequest {
                namespace: self.statement.namespace.clone(),
                set_name: self.statement.set_name.clone(),
                filter: self.statement.filter.clone(),
                bin_names: self.statement.bin_names.clone(),
                task_id,
                partitions: assignment.partitions.clone(),
            };
            let output = match &buffer {
                Some(buffer) => Output::Buffer(Arc::clone(buffer)),
                None => Output::Stream(tx.clone()),
            };
            let mut sink = WorkerSink {
                tracker: Arc::clone(&self.tracker),
                metrics: Arc::clone(self.cluster.metrics()),
                node: assignment.node.name().to_string(),
                round: assignment.round,
                output,
                cancel: round_cancel.clone(),
            };
            let cluster = Arc::clone(&self.cluster);
            let permits = Arc::clone(&permits);
            let socket_timeout = self.policy.socket_timeout();

            workers.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) if !sink.cancel.is_cancelled() => {
                        cluster
                            .dispatcher()
                            .query_partitions(&assignment.node, &request, &mut sink, socket_timeout)
                            .await
                    }
                    _ => Err(ClientError::Cancelled),
                };
                (assignment, result)
            });
        }

        let mut outcome = RoundOutcome::default();
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    round_cancel.cancel();
                    workers.abort_all();
                    return Err(ClientError::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    round_cancel.cancel();
                    workers.abort_all();
                    return Err(self.timeout_error());
                }
                joined = workers.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let (assignment, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!("Query worker failed: {}", e);
                    outcome
                        .fatal
                        .get_or_insert_with(|| ClientError::Internal(format!("query worker failed: {}", e)));
                    continue;
                }
            };

            let node = assignment.node.name();
            match result {
                Ok(()) => {}
                Err(ClientError::Cancelled) => {
                    round_cancel.cancel();
                    workers.abort_all();
                    return Err(ClientError::Cancelled);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Node {} failed, partitions will be retried: {}", node, e);
                    outcome.retried_nodes += 1;
                    self.tracker
                        .node_failed(assignment.round, node, &assignment.partitions, true);
                }
                Err(e) => {
                    warn!("Node {} failed: {}", node, e);
                    self.tracker
                        .node_failed(assignment.round, node, &assignment.partitions, false);
                    outcome.fatal.get_or_insert(e);
                }
            }
        }

        if let Some(buffer) = buffer {
            self.flush_ordered(round, &buffer, tx, cancel).await?;
        }
        Ok(outcome)
    }

    /// Deliver a round's buffered records sorted by partition then digest,
    /// advancing the tracker only as records go out. Partitions whose node
    /// failed during the round are dropped and fetched again next round.
    async fn flush_ordered(
        &self,
        round: u64,
        buffer: &RecordBuffer,
        tx: &RecordSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let partitions = std::mem::take(&mut *buffer.lock().unwrap_or_else(|e| e.into_inner()));
        for (partition, buffered) in partitions {
            if !self.tracker.accepts(round, &buffered.node, partition) {
                continue;
            }
            let mut records = buffered.records;
            records.sort_by(|a, b| a.digest().cmp(b.digest()));
            let mut sent = 0;
            for record in records {
                let digest = *record.digest();
                let delivered = tokio::select! {
                    _ = cancel.cancelled() => Err(ClientError::Cancelled),
                    result = tx.send(Ok(record)) => result.map_err(|_| ClientError::Cancelled),
                };
                if let Err(e) = delivered {
                    self.cluster.metrics().records.inc_by(sent);
                    return Err(e);
                }
                self.tracker
                    .record_received(round, &buffered.node, partition, digest);
                sent += 1;
            }
            self.cluster.metrics().records.inc_by(sent);
            if buffered.done {
                self.tracker.partition_done(round, &buffered.node, partition);
            }
        }
        Ok(())
    }

    async fn pause_before_retry(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let pause = self.policy.sleep_between_retries();
        if pause.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                self.tracker.partition_error();
                Err(ClientError::Cancelled)
            }
            _ = sleep_until(deadline) => {
                self.tracker.partition_error();
                Err(self.timeout_error())
            }
            _ = tokio::time::sleep(pause) => Ok(()),
        }
    }

    fn timeout_error(&self) -> ClientError {
        ClientError::Timeout {
            timeout: self.policy.total_timeout().unwrap_or(Duration::ZERO),
            iteration: self.tracker.iteration(),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

enum Output {
    Stream(RecordSender),
    Buffer(RecordBuffer),
}

/// Receives one node's stream for one round.
struct WorkerSink {
    tracker: Arc<PartitionTracker>,
    metrics: Arc<ClientMetrics>,
    node: String,
    round: u64,
    output: Output,
    cancel: CancellationToken,
}

fn hold<F>(buffer: &RecordBuffer, node: &str, partition: u16, f: F)
where
    F: FnOnce(&mut BufferedPartition),
{
    let mut partitions = buffer.lock().unwrap_or_else(|e| e.into_inner());
    let entry = partitions
        .entry(partition)
        .or_insert_with(|| BufferedPartition {
            node: node.to_string(),
            records: Vec::new(),
            done: false,
        });
    f(entry);
}

#[async_trait]
impl RecordSink for WorkerSink {
    async fn record(&mut self, partition: u16, record: KeyRecord) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        // Records for partitions this node no longer serves are duplicates.
        if !self.tracker.accepts(self.round, &self.node, partition) {
            return Ok(());
        }
        let digest = *record.digest();

        let tx = match &self.output {
            Output::Stream(tx) => tx,
            Output::Buffer(buffer) => {
                hold(buffer, &self.node, partition, |held| held.records.push(record));
                return Ok(());
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
            sent = tx.send(Ok(record)) => {
                if sent.is_err() {
                    self.cancel.cancel();
                    return Err(ClientError::Cancelled);
                }
            }
        }

        if !self.cancel.is_cancelled() {
            self.tracker
                .record_received(self.round, &self.node, partition, digest);
        }
        self.metrics.records.inc();
        Ok(())
    }

    fn partition_done(&mut self, partition: u16) {
        if self.cancel.is_cancelled() {
            return;
        }
        match &self.output {
            Output::Stream(_) => {
                self.tracker.partition_done(self.round, &self.node, partition);
            }
            Output::Buffer(buffer) => hold(buffer, &self.node, partition, |held| held.done = true),
        }
    }

    fn partition_unavailable(&mut self, partition: u16) {
        if !self.cancel.is_cancelled() {
            debug!("Partition {} unavailable on {}", partition, self.node);
            self.tracker
                .partition_unavailable(self.round, &self.node, partition);
        }
    }
}
