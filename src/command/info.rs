//! Admin (info) text protocol for job status.
//!
//! Three generations of status commands exist. A node's capabilities
//! decide which one it is sent:
//!
//! ```text
//! query-show:trid=<id>                        partition-aware servers
//! <scan|query>-show:trid=<id>                 servers with per-module show
//! jobs:module=<scan|query>;cmd=get-job;trid=<id>   job monitor (oldest)
//! ```
//!
//! Failures come back as `ERROR:<code>[:message]`; successes embed
//! `status=<value>:` where a value starting with `done` (any case) means
//! the job has finished.

use crate::cluster::NodeCapabilities;
use crate::error::{ClientError, Result};
use crate::task::TaskStatus;

/// Error code for "no such job"
pub const JOB_NOT_FOUND: u32 = 2;

/// Kind of background job, which names the server module that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskModule {
    Scan,
    Query,
}

impl TaskModule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Query => "query",
        }
    }
}

/// Status command flavor understood by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminDialect {
    /// `query-show` covering scans and queries
    PartitionQueryShow,
    /// `scan-show` / `query-show`
    ModuleShow,
    /// `jobs:` job monitor
    JobMonitor,
}

impl AdminDialect {
    /// Best dialect a node supports.
    pub fn for_capabilities(capabilities: NodeCapabilities) -> Self {
        if capabilities.partition_query {
            Self::PartitionQueryShow
        } else if capabilities.query_show {
            Self::ModuleShow
        } else {
            Self::JobMonitor
        }
    }

    pub fn status_command(&self, module: TaskModule, task_id: u64) -> String {
        match self {
            Self::PartitionQueryShow => format!("query-show:trid={}", task_id),
            Self::ModuleShow => format!("{}-show:trid={}", module.as_str(), task_id),
            Self::JobMonitor => format!(
                "jobs:module={};cmd=get-job;trid={}",
                module.as_str(),
                task_id
            ),
        }
    }

    /// Partition-aware servers drop a job listing as soon as the job ends,
    /// so "not found" from them means finished. Older servers might not
    /// have started the job yet.
    pub fn not_found_means_complete(&self) -> bool {
        matches!(self, Self::PartitionQueryShow)
    }

    /// Interpret a status response.
    pub fn parse_status(&self, command: &str, response: &str) -> Result<TaskStatus> {
        if let Some(code) = error_code(response) {
            if code == Some(JOB_NOT_FOUND) {
                return Ok(if self.not_found_means_complete() {
                    TaskStatus::Complete
                } else {
                    TaskStatus::NotFound
                });
            }
            return Err(command_failed(command, response));
        }

        let status = status_value(response).ok_or_else(|| command_failed(command, response))?;
        if starts_with_ignore_case(status, "done") {
            Ok(TaskStatus::Complete)
        } else {
            Ok(TaskStatus::InProgress)
        }
    }
}

/// `Some(code)` when the response is an `ERROR:` response; the inner value
/// is `None` when the code is missing or not numeric.
fn error_code(response: &str) -> Option<Option<u32>> {
    let rest = response.strip_prefix("ERROR:")?;
    let code = rest.split(':').next().unwrap_or_default().trim();
    Some(code.parse().ok())
}

fn status_value(response: &str) -> Option<&str> {
    const FIND: &str = "status=";
    let begin = response.find(FIND)? + FIND.len();
    let rest = &response[begin..];
    let end = rest.find(':').unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

fn command_failed(command: &str, response: &str) -> ClientError {
    ClientError::Protocol(format!("{} failed: {}", command, response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_selection() {
        assert_eq!(
            AdminDialect::for_capabilities(NodeCapabilities::modern()),
            AdminDialect::PartitionQueryShow
        );
        assert_eq!(
            AdminDialect::for_capabilities(NodeCapabilities {
                partition_query: false,
                query_show: true,
            }),
            AdminDialect::ModuleShow
        );
        assert_eq!(
            AdminDialect::for_capabilities(NodeCapabilities::legacy()),
            AdminDialect::JobMonitor
        );
    }

    #[test]
    fn test_status_commands() {
        assert_eq!(
            AdminDialect::PartitionQueryShow.status_command(TaskModule::Scan, 42),
            "query-show:trid=42"
        );
        assert_eq!(
            AdminDialect::ModuleShow.status_command(TaskModule::Scan, 42),
            "scan-show:trid=42"
        );
        assert_eq!(
            AdminDialect::ModuleShow.status_command(TaskModule::Query, 42),
            "query-show:trid=42"
        );
        assert_eq!(
            AdminDialect::JobMonitor.status_command(TaskModule::Query, 7),
            "jobs:module=query;cmd=get-job;trid=7"
        );
    }

    #[test]
    fn test_parse_done() {
        let dialect = AdminDialect::PartitionQueryShow;
        assert_eq!(
            dialect.parse_status("c", "trid=1:status=done(ok):recs=10").unwrap(),
            TaskStatus::Complete
        );
        assert_eq!(
            dialect.parse_status("c", "trid=1:status=DONE:").unwrap(),
            TaskStatus::Complete
        );
        assert_eq!(
            dialect.parse_status("c", "trid=1:status=active(ok):").unwrap(),
            TaskStatus::InProgress
        );
        assert_eq!(
            dialect.parse_status("c", "module=scan;status=in-progress").unwrap(),
            TaskStatus::InProgress
        );
    }

    #[test]
    fn test_parse_not_found_depends_on_dialect() {
        assert_eq!(
            AdminDialect::PartitionQueryShow
                .parse_status("c", "ERROR:2:not found")
                .unwrap(),
            TaskStatus::Complete
        );
        assert_eq!(
            AdminDialect::JobMonitor.parse_status("c", "ERROR:2").unwrap(),
            TaskStatus::NotFound
        );
        assert_eq!(
            AdminDialect::ModuleShow.parse_status("c", "ERROR:2:").unwrap(),
            TaskStatus::NotFound
        );
    }

    #[test]
    fn test_parse_failures() {
        let dialect = AdminDialect::PartitionQueryShow;
        let err = dialect.parse_status("query-show:trid=9", "ERROR:4:bad").unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ref m) if m.starts_with("query-show:trid=9 failed")));
        assert!(dialect.parse_status("c", "ERROR:22").is_err());
        assert!(dialect.parse_status("c", "ERROR:").is_err());
        assert!(dialect.parse_status("c", "trid=1:recs=3").is_err());
    }
}
