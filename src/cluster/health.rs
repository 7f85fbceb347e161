//! Per-node error-rate tracking and backoff.
//!
//! Every node counts the errors that closed a connection (and device
//! overload responses) inside a window of tend iterations. Once the count
//! reaches the configured maximum, commands to the node fail fast with
//! `Backoff` until the tend loop rolls the window over.

use crate::error::{ClientError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

#[derive(Debug)]
pub struct NodeHealth {
    error_count: AtomicU32,
    /// 0 disables the limit
    max_error_rate: AtomicU32,
}

impl NodeHealth {
    pub fn new(max_error_rate: u32) -> Self {
        Self {
            error_count: AtomicU32::new(0),
            max_error_rate: AtomicU32::new(max_error_rate),
        }
    }

    /// Errors counted in the current window.
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn max_error_rate(&self) -> u32 {
        self.max_error_rate.load(Ordering::Relaxed)
    }

    /// Adjust the error budget. Only the maintenance path calls this.
    pub fn set_max_error_rate(&self, max_error_rate: u32) {
        self.max_error_rate.store(max_error_rate, Ordering::Relaxed);
    }

    pub fn in_backoff(&self) -> bool {
        let max = self.max_error_rate();
        max > 0 && self.error_count() >= max
    }

    /// Fail fast if the node has used up its error budget for this window.
    pub fn validate(&self, node: &str) -> Result<()> {
        if self.in_backoff() {
            return Err(ClientError::Backoff {
                node: node.to_string(),
            });
        }
        Ok(())
    }

    /// Count one error against the window. Returns the new count.
    pub fn record_error(&self, node: &str) -> u32 {
        let count = self.error_count.fetch_add(1, Ordering::AcqRel) + 1;
        let max = self.max_error_rate();
        if max > 0 && count == max {
            warn!(
                "Node {} reached its error budget ({} errors), backing off until the window rolls over",
                node, count
            );
        }
        count
    }

    /// Reset the window. Returns the count it held.
    pub fn reset(&self) -> u32 {
        self.error_count.swap(0, Ordering::AcqRel)
    }

    /// Called once per tend iteration; resets the counter when `tend_count`
    /// lands on a window boundary. Returns whether a reset happened.
    pub fn on_tend(&self, tend_count: u64, window: u32) -> bool {
        if window == 0 || tend_count % u64::from(window) != 0 {
            return false;
        }
        self.reset();
        true
    }
}
