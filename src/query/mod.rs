//! Partitioned queries and scans.

mod executor;
mod record_set;
mod statement;
mod tracker;

pub use executor::PartitionExecutor;
pub use record_set::RecordSet;
pub use statement::{next_task_id, random_task_id, Filter, Statement};
pub use tracker::{
    NodePartitions, PartitionCursor, PartitionFilter, PartitionState, PartitionStatus,
    PartitionTracker,
};
