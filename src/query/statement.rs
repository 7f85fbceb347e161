//! Query statement.

use crate::command::TaskModule;
use crate::record::Value;
use serde::{Deserialize, Serialize};

/// Secondary index filter. A statement with a filter is a query; without
/// one it is a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Equal { bin: String, value: Value },
    Range { bin: String, begin: i64, end: i64 },
}

impl Filter {
    pub fn equal(bin: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equal {
            bin: bin.into(),
            value: value.into(),
        }
    }

    /// Inclusive integer range.
    pub fn range(bin: impl Into<String>, begin: i64, end: i64) -> Self {
        Self::Range {
            bin: bin.into(),
            begin,
            end,
        }
    }

    pub fn bin_name(&self) -> &str {
        match self {
            Self::Equal { bin, .. } | Self::Range { bin, .. } => bin,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub namespace: String,
    pub set_name: Option<String>,
    /// Bins to return (empty = all)
    pub bin_names: Vec<String>,
    pub filter: Option<Filter>,
    /// Caller-chosen task id for the first round
    pub task_id: Option<u64>,
}

impl Statement {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_set(mut self, set_name: impl Into<String>) -> Self {
        self.set_name = Some(set_name.into());
        self
    }

    pub fn with_bins<I, S>(mut self, bins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bin_names = bins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_task_id(mut self, task_id: u64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn is_scan(&self) -> bool {
        self.filter.is_none()
    }

    /// Server module that runs this statement as a background job.
    pub fn module(&self) -> TaskModule {
        if self.is_scan() {
            TaskModule::Scan
        } else {
            TaskModule::Query
        }
    }

    /// Task id for the first round: the caller's id if set, else a random one.
    pub fn prepare_task_id(&self) -> u64 {
        match self.task_id {
            Some(id) if id != 0 => id,
            _ => random_task_id(),
        }
    }
}

/// Random non-zero task id.
pub fn random_task_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/// Fresh task id for a retry round. Never equal to `previous`, so the
/// server cannot mistake the retry for the still-running previous round.
pub fn next_task_id(previous: u64) -> u64 {
    loop {
        let id = random_task_id();
        if id != previous {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_vs_query() {
        let scan = Statement::new("test").with_set("users");
        assert!(scan.is_scan());
        assert_eq!(scan.module(), TaskModule::Scan);

        let query = Statement::new("test").with_filter(Filter::range("age", 18, 30));
        assert!(!query.is_scan());
        assert_eq!(query.module(), TaskModule::Query);
        assert_eq!(query.filter.as_ref().map(Filter::bin_name), Some("age"));
    }

    #[test]
    fn test_task_ids() {
        let fixed = Statement::new("test").with_task_id(99);
        assert_eq!(fixed.prepare_task_id(), 99);
        assert_eq!(fixed.prepare_task_id(), 99);

        let zero = Statement::new("test").with_task_id(0);
        assert_ne!(zero.prepare_task_id(), 0);

        assert_ne!(next_task_id(99), 99);
    }

    #[test]
    fn test_with_bins() {
        let stmt = Statement::new("test").with_bins(["a", "b"]);
        assert_eq!(stmt.bin_names, vec!["a".to_string(), "b".to_string()]);
    }
}
