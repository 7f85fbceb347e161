//! Command dispatch.
//!
//! The wire encoding and the sockets live behind the [`Transport`] trait.
//! The [`Dispatcher`] wraps every command sent through it with the
//! cluster's policies: backoff checks before the command, pooled
//! connection checkout, timeouts, and error accounting afterwards.

pub mod info;

pub use info::{AdminDialect, TaskModule};

use crate::cluster::{Node, PooledConnection};
use crate::error::{ClientError, Result};
use crate::observability::ClientMetrics;
use crate::query::{Filter, PartitionCursor};
use crate::record::KeyRecord;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A partition query sent to one node for one round.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionRequest {
    pub namespace: String,
    pub set_name: Option<String>,
    pub filter: Option<Filter>,
    pub bin_names: Vec<String>,
    pub task_id: u64,
    pub partitions: Vec<PartitionCursor>,
}

impl PartitionRequest {
    pub fn partition_ids(&self) -> Vec<u16> {
        self.partitions.iter().map(|p| p.id).collect()
    }
}

/// Receives the decoded stream of a partition query.
#[async_trait]
pub trait RecordSink: Send {
    /// Deliver one record of `partition`. An error aborts the command.
    async fn record(&mut self, partition: u16, record: KeyRecord) -> Result<()>;

    /// The node has sent every record of `partition`.
    fn partition_done(&mut self, partition: u16);

    /// The node does not own `partition`; it has to be queried elsewhere.
    fn partition_unavailable(&mut self, partition: u16);
}

/// Socket-level collaborator: connects to nodes, encodes requests and
/// decodes responses.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Open a connection to a node.
    async fn connect(&self, node: &str, address: &str) -> Result<Self::Conn>;

    /// Send an admin text command and return the text response.
    async fn admin(&self, conn: &mut Self::Conn, command: &str) -> Result<String>;

    /// Run a partition query, streaming records and per-partition
    /// completion into `sink`.
    async fn query_partitions(
        &self,
        conn: &mut Self::Conn,
        request: &PartitionRequest,
        sink: &mut dyn RecordSink,
    ) -> Result<()>;
}

async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ClientError::Timeout {
                timeout,
                iteration: 0,
            })?,
        None => fut.await,
    }
}

pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    connect_timeout: Duration,
    metrics: Arc<ClientMetrics>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: Arc<T>, connect_timeout: Duration, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            transport,
            connect_timeout,
            metrics,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Open a new connection to `node`, bounded by the connect timeout.
    pub async fn connect(&self, node: &Node<T::Conn>) -> Result<T::Conn> {
        let timeout = (!self.connect_timeout.is_zero()).then_some(self.connect_timeout);
        with_timeout(timeout, self.transport.connect(node.name(), node.address())).await
    }

    async fn checkout<'n>(
        &self,
        node: &'n Node<T::Conn>,
        wait: Option<Duration>,
    ) -> Result<PooledConnection<'n, T::Conn>> {
        if !node.is_active() {
            return Err(ClientError::InvalidNode(format!(
                "node {} is no longer in the cluster",
                node.name()
            )));
        }
        if let Err(e) = node.health().validate(node.name()) {
            self.metrics.backoff_rejections.inc();
            return Err(e);
        }

        match node.pool().acquire(move || self.connect(node), wait).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                if matches!(e, ClientError::CommandRejected { .. }) {
                    self.metrics.pool_rejections.inc();
                } else if e.counts_toward_error_rate() {
                    node.health().record_error(node.name());
                }
                self.metrics.command_errors.inc();
                Err(e)
            }
        }
    }

    fn finish<R>(&self, node: &Node<T::Conn>, conn: PooledConnection<'_, T::Conn>, result: &Result<R>) {
        match result {
            Ok(_) => conn.release(),
            Err(e) => {
                self.metrics.command_errors.inc();
                if e.counts_toward_error_rate() {
                    node.health().record_error(node.name());
                }
                // A cancelled stream leaves unread data on the socket.
                if e.closes_connection() || matches!(e, ClientError::Cancelled) {
                    debug!("Closing connection to {} after error: {}", node.name(), e);
                    conn.discard();
                } else {
                    conn.release();
                }
            }
        }
    }

    /// Send one admin command to `node`.
    pub async fn admin(
        &self,
        node: &Node<T::Conn>,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let mut conn = self.checkout(node, timeout).await?;
        self.metrics.commands.inc();
        let result = with_timeout(timeout, self.transport.admin(conn.get_mut(), command)).await;
        self.finish(node, conn, &result);
        result
    }

    /// Run one partition query on `node`. `socket_timeout` bounds the gap
    /// between two reads from the node, not the whole stream; time the sink
    /// spends handing a record to the consumer is not counted.
    pub async fn query_partitions(
        &self,
        node: &Node<T::Conn>,
        request: &PartitionRequest,
        sink: &mut dyn RecordSink,
        socket_timeout: Option<Duration>,
    ) -> Result<()> {
        let mut conn = self.checkout(node, socket_timeout).await?;
        self.metrics.commands.inc();
        let clock = ReadClock::new();
        let mut watched = WatchedSink { inner: sink, clock: &clock };
        let query = self
            .transport
            .query_partitions(conn.get_mut(), request, &mut watched);
        let result = match socket_timeout {
            Some(timeout) => read_with_idle_timeout(query, &clock, timeout).await,
            None => query.await,
        };
        self.finish(node, conn, &result);
        result
    }
}

async fn read_with_idle_timeout<F>(query: F, clock: &ReadClock, timeout: Duration) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(query);
    let mut idle_deadline = clock.last_read() + timeout;
    loop {
        tokio::select! {
            result = &mut query => return result,
            _ = tokio::time::sleep_until(idle_deadline) => {
                let now = Instant::now();
                if clock.is_delivering() {
                    idle_deadline = now + timeout;
                    continue;
                }
                idle_deadline = clock.last_read() + timeout;
                if idle_deadline <= now {
                    return Err(ClientError::Timeout { timeout, iteration: 0 });
                }
            }
        }
    }
}

/// Last moment the node was heard from during a streaming command.
struct ReadClock {
    last_read: Mutex<Instant>,
    delivering: AtomicBool,
}

impl ReadClock {
    fn new() -> Self {
        Self {
            last_read: Mutex::new(Instant::now()),
            delivering: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.last_read.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last_read(&self) -> Instant {
        *self.last_read.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_delivering(&self) -> bool {
        self.delivering.load(Ordering::Acquire)
    }
}

/// Forwards to the caller's sink and marks every read on the clock.
struct WatchedSink<'a> {
    inner: &'a mut dyn RecordSink,
    clock: &'a ReadClock,
}

#[async_trait]
impl<'a> RecordSink for WatchedSink<'a> {
    async fn record(&mut self, partition: u16, record: KeyRecord) -> Result<()> {
        self.clock.touch();
        self.clock.delivering.store(true, Ordering::Release);
        let delivered = self.inner.record(partition, record).await;
        self.clock.delivering.store(false, Ordering::Release);
        self.clock.touch();
        delivered
    }

    fn partition_done(&mut self, partition: u16) {
        self.clock.touch();
        self.inner.partition_done(partition);
    }

    fn partition_unavailable(&mut self, partition: u16) {
        self.clock.touch();
        self.inner.partition_unavailable(partition);
    }
}
