//! Client configuration
//!
//! Policies consumed by the cluster, the partition executor and the job
//! poller, plus the TOML file surface they are loaded from.

use crate::error::{ClientError, Result};
use crate::observability::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What to do when a node's connection pool is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxCommandAction {
    /// Wait until a connection is returned to the pool.
    #[default]
    Block,
    /// Queue the command up to `max_commands_in_queue`, rejecting beyond that.
    Delay,
    /// Reject the command immediately.
    Reject,
}

/// Which owner of a partition receives the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicy {
    /// Always the master owner.
    Master,
    /// Master first, then walk the replica list on each retry of the partition.
    #[default]
    Sequence,
    /// Prefer an owner on one of `ClientPolicy::rack_ids`, else behave like `Sequence`.
    PreferRack,
}

/// Order in which records reach the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultOrdering {
    /// Records are forwarded as they arrive from any node.
    #[default]
    Unordered,
    /// Records are buffered per round and emitted by (partition, digest).
    Ordered,
}

/// Cluster-wide policy. Shared by all nodes, read-only once the cluster
/// is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPolicy {
    /// Connection establishment timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Errors allowed per node per window before backoff (0 disables the limit)
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: u32,
    /// Number of tend iterations in one error-rate window
    #[serde(default = "default_error_rate_window")]
    pub error_rate_window: u32,
    /// Interval between tend passes in milliseconds
    #[serde(default = "default_tend_interval_ms")]
    pub tend_interval_ms: u64,
    /// Connections opened eagerly per node
    #[serde(default)]
    pub min_conns_per_node: usize,
    /// Hard ceiling of connections per node
    #[serde(default = "default_max_conns_per_node")]
    pub max_conns_per_node: usize,
    /// Idle time after which a pooled connection is retired (0 = never)
    #[serde(default = "default_max_socket_idle_ms")]
    pub max_socket_idle_ms: u64,
    /// Behavior when a node's pool is exhausted
    #[serde(default)]
    pub max_command_action: MaxCommandAction,
    /// Delay queue depth per node for `MaxCommandAction::Delay` (0 = unbounded)
    #[serde(default)]
    pub max_commands_in_queue: usize,
    /// Racks preferred by `ReplicaPolicy::PreferRack`
    #[serde(default)]
    pub rack_ids: Vec<u32>,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_error_rate() -> u32 {
    100
}

fn default_error_rate_window() -> u32 {
    1
}

fn default_tend_interval_ms() -> u64 {
    1000
}

fn default_max_conns_per_node() -> usize {
    100
}

fn default_max_socket_idle_ms() -> u64 {
    55_000
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_error_rate: default_max_error_rate(),
            error_rate_window: default_error_rate_window(),
            tend_interval_ms: default_tend_interval_ms(),
            min_conns_per_node: 0,
            max_conns_per_node: default_max_conns_per_node(),
            max_socket_idle_ms: default_max_socket_idle_ms(),
            max_command_action: MaxCommandAction::Block,
            max_commands_in_queue: 0,
            rack_ids: Vec::new(),
        }
    }
}

impl ClientPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn tend_interval(&self) -> Duration {
        Duration::from_millis(self.tend_interval_ms)
    }

    /// Idle duration after which connections are retired, if reaping is enabled.
    pub fn max_socket_idle(&self) -> Option<Duration> {
        (self.max_socket_idle_ms > 0).then(|| Duration::from_millis(self.max_socket_idle_ms))
    }

    /// Set the error budget and its window length in tend cycles
    pub fn with_error_rate(mut self, max_error_rate: u32, window: u32) -> Self {
        self.max_error_rate = max_error_rate;
        self.error_rate_window = window;
        self
    }

    /// Set the per-node connection bounds
    pub fn with_conns_per_node(mut self, min: usize, max: usize) -> Self {
        self.min_conns_per_node = min;
        self.max_conns_per_node = max;
        self
    }

    /// Set the pool exhaustion behavior
    pub fn with_max_command_action(mut self, action: MaxCommandAction, queue: usize) -> Self {
        self.max_command_action = action;
        self.max_commands_in_queue = queue;
        self
    }

    pub fn with_tend_interval(mut self, interval: Duration) -> Self {
        self.tend_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_socket_idle(mut self, idle: Duration) -> Self {
        self.max_socket_idle_ms = idle.as_millis() as u64;
        self
    }

    pub fn with_rack_ids(mut self, rack_ids: Vec<u32>) -> Self {
        self.rack_ids = rack_ids;
        self
    }

    /// Reject combinations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.max_conns_per_node == 0 {
            return Err(ClientError::Config(
                "max_conns_per_node must be greater than zero".to_string(),
            ));
        }
        if self.min_conns_per_node > self.max_conns_per_node {
            return Err(ClientError::Config(format!(
                "min_conns_per_node ({}) exceeds max_conns_per_node ({})",
                self.min_conns_per_node, self.max_conns_per_node
            )));
        }
        if self.error_rate_window == 0 {
            return Err(ClientError::Config(
                "error_rate_window must be at least one tend iteration".to_string(),
            ));
        }
        Ok(())
    }
}

/// Policy for partitioned queries and scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPolicy {
    /// Nodes queried in parallel per round (0 = all nodes in the round)
    #[serde(default)]
    pub max_concurrent_nodes: usize,
    /// Delay before a retry round in milliseconds
    #[serde(default)]
    pub sleep_between_retries_ms: u64,
    /// Per-node command timeout in milliseconds (0 = none)
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// Deadline for the whole operation in milliseconds (0 = none)
    #[serde(default)]
    pub total_timeout_ms: u64,
    #[serde(default)]
    pub replica: ReplicaPolicy,
    /// Records buffered between the executor and the consumer
    #[serde(default = "default_record_queue_size")]
    pub record_queue_size: usize,
    #[serde(default)]
    pub ordering: ResultOrdering,
}

fn default_socket_timeout_ms() -> u64 {
    30_000
}

fn default_record_queue_size() -> usize {
    5000
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 0,
            sleep_between_retries_ms: 0,
            socket_timeout_ms: default_socket_timeout_ms(),
            total_timeout_ms: 0,
            replica: ReplicaPolicy::Sequence,
            record_queue_size: default_record_queue_size(),
            ordering: ResultOrdering::Unordered,
        }
    }
}

impl QueryPolicy {
    pub fn sleep_between_retries(&self) -> Duration {
        Duration::from_millis(self.sleep_between_retries_ms)
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        (self.socket_timeout_ms > 0).then(|| Duration::from_millis(self.socket_timeout_ms))
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        (self.total_timeout_ms > 0).then(|| Duration::from_millis(self.total_timeout_ms))
    }

    /// Nodes to query at once for a round covering `nodes_in_round` nodes.
    pub fn concurrency(&self, nodes_in_round: usize) -> usize {
        if self.max_concurrent_nodes == 0 || self.max_concurrent_nodes >= nodes_in_round {
            nodes_in_round
        } else {
            self.max_concurrent_nodes
        }
    }

    pub fn with_max_concurrent_nodes(mut self, nodes: usize) -> Self {
        self.max_concurrent_nodes = nodes;
        self
    }

    pub fn with_sleep_between_retries(mut self, sleep: Duration) -> Self {
        self.sleep_between_retries_ms = sleep.as_millis() as u64;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_replica(mut self, replica: ReplicaPolicy) -> Self {
        self.replica = replica;
        self
    }

    pub fn with_ordering(mut self, ordering: ResultOrdering) -> Self {
        self.ordering = ordering;
        self
    }
}

/// Policy for admin (info) commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoPolicy {
    /// Admin command timeout in milliseconds (0 = none)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for InfoPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl InfoPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Logging section of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format: text or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientPolicy,
    #[serde(default)]
    pub query: QueryPolicy,
    #[serde(default)]
    pub info: InfoPolicy,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ClientConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(content)?;
        config.client.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Logging settings, rejecting unknown levels or formats.
    pub fn log_config(&self) -> Result<LogConfig> {
        let level = LogConfig::parse_level(&self.logging.level).ok_or_else(|| {
            ClientError::Config(format!("invalid log level '{}'", self.logging.level))
        })?;
        let format = crate::observability::LogFormat::parse(&self.logging.format).ok_or_else(
            || ClientError::Config(format!("invalid log format '{}'", self.logging.format)),
        )?;
        Ok(LogConfig { level, format })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = ClientPolicy::default();
        assert_eq!(policy.max_error_rate, 100);
        assert_eq!(policy.error_rate_window, 1);
        assert_eq!(policy.tend_interval(), Duration::from_secs(1));
        assert_eq!(policy.max_command_action, MaxCommandAction::Block);
        assert!(policy.validate().is_ok());

        let query = QueryPolicy::default();
        assert_eq!(query.total_timeout(), None);
        assert_eq!(query.socket_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(query.replica, ReplicaPolicy::Sequence);
    }

    #[test]
    fn test_concurrency_ceiling() {
        let policy = QueryPolicy::default();
        assert_eq!(policy.concurrency(3), 3);

        let policy = policy.with_max_concurrent_nodes(2);
        assert_eq!(policy.concurrency(3), 2);
        assert_eq!(policy.concurrency(1), 1);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let policy = ClientPolicy::default().with_conns_per_node(10, 5);
        assert!(matches!(policy.validate(), Err(ClientError::Config(_))));

        let policy = ClientPolicy::default().with_error_rate(5, 0);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            [client]
            max_error_rate = 5
            max_command_action = "delay"
            max_commands_in_queue = 16

            [query]
            max_concurrent_nodes = 4
            replica = "prefer_rack"
            ordering = "ordered"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.client.max_error_rate, 5);
        assert_eq!(config.client.max_conns_per_node, 100);
        assert_eq!(config.client.max_command_action, MaxCommandAction::Delay);
        assert_eq!(config.query.max_concurrent_nodes, 4);
        assert_eq!(config.query.replica, ReplicaPolicy::PreferRack);
        assert_eq!(config.query.ordering, ResultOrdering::Ordered);
        assert_eq!(config.info.timeout_ms, 1000);
        assert_eq!(config.log_config().unwrap().level, tracing::Level::DEBUG);
    }

    #[test]
    fn test_parse_empty_toml_uses_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config.client.max_socket_idle(), Some(Duration::from_secs(55)));
        assert_eq!(config.query.record_queue_size, 5000);
    }

    #[test]
    fn test_invalid_log_level() {
        let config = ClientConfig::from_toml_str("[logging]\nlevel = \"loud\"\n").unwrap();
        assert!(config.log_config().is_err());
    }
}
