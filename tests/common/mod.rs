//! Scripted in-memory transport shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use kvscatter::command::{PartitionRequest, RecordSink, Transport};
use kvscatter::record::{Digest, Key, KeyRecord, Record, Value};
use kvscatter::{ClientError, ClientPolicy, Cluster, NodeSpec, PartitionMap, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NS: &str = "test";

type ErrorFactory = Arc<dyn Fn(&str) -> ClientError + Send + Sync>;

/// Fail the next query command sent to a node.
#[derive(Clone)]
pub struct FailurePlan {
    /// Partitions completed before failing
    pub after_partitions: usize,
    /// Records of the next partition delivered before failing
    pub records_before_error: usize,
    make_error: ErrorFactory,
}

impl FailurePlan {
    pub fn new<F>(after_partitions: usize, make_error: F) -> Self
    where
        F: Fn(&str) -> ClientError + Send + Sync + 'static,
    {
        Self {
            after_partitions,
            records_before_error: 0,
            make_error: Arc::new(make_error),
        }
    }

    pub fn with_records_before_error(mut self, records: usize) -> Self {
        self.records_before_error = records;
        self
    }
}

pub fn connection_error(node: &str) -> ClientError {
    ClientError::Connection {
        node: node.to_string(),
        message: "connection reset".to_string(),
    }
}

#[derive(Default)]
struct MockState {
    data: Mutex<HashMap<u16, Vec<KeyRecord>>>,
    failures: Mutex<HashMap<String, VecDeque<FailurePlan>>>,
    unavailable: Mutex<HashSet<(String, u16)>>,
    connect_failures: Mutex<HashSet<String>>,
    admin_responses: Mutex<HashMap<String, VecDeque<String>>>,
    requests: Mutex<Vec<(String, PartitionRequest)>>,
    admin_log: Mutex<Vec<(String, String)>>,
    delay: Mutex<Option<Duration>>,
    node_delays: Mutex<HashMap<String, Duration>>,
    record_delay: Mutex<Option<Duration>>,
    duplicate_done: Mutex<bool>,
    connects: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Debug)]
pub struct MockConn {
    pub node: String,
    pub id: usize,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Record of `partition` whose digest sorts by `index` within the partition.
pub fn record(partition: u16, index: u8) -> KeyRecord {
    let mut bytes = [0u8; 20];
    bytes[..2].copy_from_slice(&partition.to_le_bytes());
    bytes[2] = index;
    let key = Key::new(NS, Some("users".to_string()), Digest::new(bytes));
    let mut bins = BTreeMap::new();
    bins.insert("p".to_string(), Value::Integer(i64::from(partition)));
    bins.insert("i".to_string(), Value::Integer(i64::from(index)));
    KeyRecord::new(key, Record::new(bins))
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give every partition in `0..partitions` `per_partition` records.
    pub fn fill(&self, partitions: u16, per_partition: u8) {
        let mut data = self.state.data.lock().unwrap();
        for p in 0..partitions {
            data.insert(p, (0..per_partition).map(|i| record(p, i)).collect());
        }
    }

    pub fn fail_next_query(&self, node: &str, plan: FailurePlan) {
        self.state
            .failures
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .push_back(plan);
    }

    /// The node reports `partition` as not owned, once.
    pub fn unavailable_once(&self, node: &str, partition: u16) {
        self.state
            .unavailable
            .lock()
            .unwrap()
            .insert((node.to_string(), partition));
    }

    pub fn refuse_connections(&self, node: &str, refuse: bool) {
        let mut failing = self.state.connect_failures.lock().unwrap();
        if refuse {
            failing.insert(node.to_string());
        } else {
            failing.remove(node);
        }
    }

    /// Queue admin responses for a node. The last one repeats.
    pub fn admin_responses(&self, node: &str, responses: &[&str]) {
        self.state.admin_responses.lock().unwrap().insert(
            node.to_string(),
            responses.iter().map(|r| r.to_string()).collect(),
        );
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = Some(delay);
    }

    /// Delay before one node starts answering a query.
    pub fn set_node_delay(&self, node: &str, delay: Duration) {
        self.state
            .node_delays
            .lock()
            .unwrap()
            .insert(node.to_string(), delay);
    }

    /// Pause before each record is streamed.
    pub fn set_record_delay(&self, delay: Duration) {
        *self.state.record_delay.lock().unwrap() = Some(delay);
    }

    /// Every partition done signal is sent twice.
    pub fn duplicate_done(&self, duplicate: bool) {
        *self.state.duplicate_done.lock().unwrap() = duplicate;
    }

    pub fn requests(&self) -> Vec<(String, PartitionRequest)> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn admin_log(&self) -> Vec<(String, String)> {
        self.state.admin_log.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::Acquire)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Conn = MockConn;

    async fn connect(&self, node: &str, _address: &str) -> Result<MockConn> {
        if self.state.connect_failures.lock().unwrap().contains(node) {
            return Err(connection_error(node));
        }
        let id = self.state.connects.fetch_add(1, Ordering::AcqRel);
        Ok(MockConn {
            node: node.to_string(),
            id,
        })
    }

    async fn admin(&self, conn: &mut MockConn, command: &str) -> Result<String> {
        self.state
            .admin_log
            .lock()
            .unwrap()
            .push((conn.node.clone(), command.to_string()));
        let mut responses = self.state.admin_responses.lock().unwrap();
        let queue = responses.entry(conn.node.clone()).or_default();
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(response.unwrap_or_else(|| "ERROR:2:not found".to_string()))
    }

    async fn query_partitions(
        &self,
        conn: &mut MockConn,
        request: &PartitionRequest,
        sink: &mut dyn RecordSink,
    ) -> Result<()> {
        let node = conn.node.clone();
        self.state
            .requests
            .lock()
            .unwrap()
            .push((node.clone(), request.clone()));

        let now = self.state.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::AcqRel);
        let _in_flight = InFlight(&self.state.in_flight);

        let delay = *self.state.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let node_delay = self.state.node_delays.lock().unwrap().get(&node).copied();
        if let Some(delay) = node_delay {
            tokio::time::sleep(delay).await;
        }
        let record_delay = *self.state.record_delay.lock().unwrap();

        let failure = self
            .state
            .failures
            .lock()
            .unwrap()
            .get_mut(&node)
            .and_then(VecDeque::pop_front);
        let duplicate_done = *self.state.duplicate_done.lock().unwrap();

        for (i, cursor) in request.partitions.iter().enumerate() {
            let unavailable = self
                .state
                .unavailable
                .lock()
                .unwrap()
                .remove(&(node.clone(), cursor.id));
            if unavailable {
                sink.partition_unavailable(cursor.id);
                continue;
            }

            let records: Vec<KeyRecord> = self
                .state
                .data
                .lock()
                .unwrap()
                .get(&cursor.id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|r| cursor.resume_after.map_or(true, |after| *r.digest() > after))
                .collect();

            if let Some(plan) = failure.as_ref().filter(|f| f.after_partitions == i) {
                for record in records.into_iter().take(plan.records_before_error) {
                    sink.record(cursor.id, record).await?;
                }
                return Err((plan.make_error)(&node));
            }

            for record in records {
                if let Some(delay) = record_delay {
                    tokio::time::sleep(delay).await;
                }
                sink.record(cursor.id, record).await?;
            }
            sink.partition_done(cursor.id);
            if duplicate_done {
                sink.partition_done(cursor.id);
            }
        }
        Ok(())
    }
}

/// Cluster of `nodes` holding `partitions` partitions of [`NS`], spread
/// round robin without replicas.
pub async fn cluster(
    transport: &MockTransport,
    nodes: &[&str],
    partitions: u16,
    policy: ClientPolicy,
) -> Arc<Cluster<MockTransport>> {
    let cluster = Cluster::new(policy, transport.clone()).expect("valid policy");
    for (i, name) in nodes.iter().enumerate() {
        cluster
            .add_node(NodeSpec::new(*name, format!("127.0.0.1:{}", 3000 + i)))
            .await
            .expect("add node");
    }
    cluster.set_partition_map(PartitionMap::round_robin(NS, partitions, nodes, 1));
    cluster
}
