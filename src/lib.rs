pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod observability;
pub mod query;
pub mod record;
pub mod task;

pub use cluster::{Cluster, Node, NodeCapabilities, NodeSpec, PartitionMap};
pub use command::{PartitionRequest, RecordSink, Transport};
pub use config::{
    ClientConfig, ClientPolicy, InfoPolicy, MaxCommandAction, QueryPolicy, ReplicaPolicy,
    ResultOrdering,
};
pub use error::{ClientError, ResultCode, Result};
pub use query::{Filter, PartitionFilter, PartitionTracker, RecordSet, Statement};
pub use record::{Digest, Key, KeyRecord, Record, Value};
pub use task::{ExecuteTask, TaskStatus};
