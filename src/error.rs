use std::time::Duration;
use thiserror::Error;

/// Result codes a server can attach to a failed data command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// The node no longer owns (or does not yet own) the partition.
    PartitionUnavailable,
    /// The node's storage device cannot keep up with the write load.
    DeviceOverload,
    /// Any other server-side failure.
    Other(i32),
}

impl ResultCode {
    pub const PARTITION_UNAVAILABLE: i32 = 11;
    pub const DEVICE_OVERLOAD: i32 = 18;

    /// Map a numeric wire code to a result code.
    pub fn from_code(code: i32) -> Self {
        match code {
            Self::PARTITION_UNAVAILABLE => Self::PartitionUnavailable,
            Self::DEVICE_OVERLOAD => Self::DeviceOverload,
            other => Self::Other(other),
        }
    }

    /// Numeric wire code.
    pub fn code(&self) -> i32 {
        match self {
            Self::PartitionUnavailable => Self::PARTITION_UNAVAILABLE,
            Self::DeviceOverload => Self::DEVICE_OVERLOAD,
            Self::Other(code) => *code,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PartitionUnavailable => write!(f, "partition unavailable"),
            Self::DeviceOverload => write!(f, "device overload"),
            Self::Other(code) => write!(f, "server error {}", code),
        }
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout after {timeout:?} (iterations: {iteration})")]
    Timeout { timeout: Duration, iteration: u32 },

    #[error("Node {node} is in backoff: error rate exceeded")]
    Backoff { node: String },

    #[error("Command rejected by node {node}: {reason}")]
    CommandRejected { node: String, reason: String },

    #[error("No available node for namespace '{namespace}' partition {partition}")]
    NoAvailableNode { namespace: String, partition: u16 },

    #[error("{operation} failed: {source} (iterations: {iteration})")]
    PartialFailure {
        operation: String,
        iteration: u32,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection to node {node} failed: {message}")]
    Connection { node: String, message: String },

    #[error("Node {node} returned {code}")]
    Server { node: String, code: ResultCode },

    #[error("Cluster is empty")]
    ClusterEmpty,

    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Invalid node: {0}")]
    InvalidNode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ClientError {
    /// Errors after which the underlying connection must not be reused.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Errors that count against a node's error-rate budget.
    pub fn counts_toward_error_rate(&self) -> bool {
        self.closes_connection()
            || matches!(
                self,
                Self::Server {
                    code: ResultCode::DeviceOverload,
                    ..
                }
            )
    }

    /// Errors that fail a node for the current round but leave the
    /// partitions it owned eligible for the next one.
    pub fn is_retryable(&self) -> bool {
        self.closes_connection()
            || matches!(
                self,
                Self::Backoff { .. }
                    | Self::CommandRejected { .. }
                    | Self::Server {
                        code: ResultCode::PartitionUnavailable | ResultCode::DeviceOverload,
                        ..
                    }
            )
    }

    /// The innermost wrapped error.
    pub fn root_cause(&self) -> &ClientError {
        match self {
            Self::PartialFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Wrap a per-node failure so the original error stays reachable as
    /// the source and the retry round count is attached.
    pub fn partial_failure(operation: &str, iteration: u32, cause: ClientError) -> Self {
        Self::PartialFailure {
            operation: operation.to_string(),
            iteration,
            source: Box::new(cause),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(ResultCode::from_code(11), ResultCode::PartitionUnavailable);
        assert_eq!(ResultCode::from_code(18), ResultCode::DeviceOverload);
        assert_eq!(ResultCode::from_code(4), ResultCode::Other(4));
        assert_eq!(ResultCode::Other(4).code(), 4);
    }

    #[test]
    fn test_classification() {
        let conn = ClientError::Connection {
            node: "A".to_string(),
            message: "reset".to_string(),
        };
        assert!(conn.closes_connection());
        assert!(conn.counts_toward_error_rate());
        assert!(conn.is_retryable());

        let overload = ClientError::Server {
            node: "A".to_string(),
            code: ResultCode::DeviceOverload,
        };
        assert!(!overload.closes_connection());
        assert!(overload.counts_toward_error_rate());

        let backoff = ClientError::Backoff {
            node: "A".to_string(),
        };
        assert!(backoff.is_retryable());
        assert!(!backoff.counts_toward_error_rate());

        let protocol = ClientError::Protocol("bad".to_string());
        assert!(!protocol.is_retryable());
    }

    #[test]
    fn test_partial_failure_keeps_cause() {
        let cause = ClientError::Server {
            node: "B".to_string(),
            code: ResultCode::Other(4),
        };
        let err = ClientError::partial_failure("query", 3, cause);
        assert!(err.to_string().starts_with("query failed:"));
        assert!(err.to_string().contains("iterations: 3"));
        assert!(err.source().is_some());
        assert!(matches!(
            err.root_cause(),
            ClientError::Server {
                code: ResultCode::Other(4),
                ..
            }
        ));
    }
}
