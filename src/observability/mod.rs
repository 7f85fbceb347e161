//! Observability module
//!
//! This module provides:
//! - Logging setup with text or JSON output
//! - Client metrics with Prometheus export

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use metrics::{ClientMetrics, Counter, Gauge, MetricsSnapshot};
