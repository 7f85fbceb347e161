//! Consumer side of a partitioned query.

use crate::error::Result;
use crate::query::PartitionTracker;
use crate::record::KeyRecord;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Stream of records produced by a running query.
///
/// Records arrive in the order nodes deliver them unless the query asked
/// for ordered results. A failed query yields its error once, after the
/// records already delivered, and then ends. Closing or dropping the set
/// cancels the query.
pub struct RecordSet {
    rx: mpsc::Receiver<Result<KeyRecord>>,
    cancel: CancellationToken,
    tracker: Arc<PartitionTracker>,
    task: Option<JoinHandle<()>>,
    finished: bool,
}

impl RecordSet {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<KeyRecord>>,
        cancel: CancellationToken,
        tracker: Arc<PartitionTracker>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            cancel,
            tracker,
            task: Some(task),
            finished: false,
        }
    }

    /// Next record, the query's error, or `None` once the query is over.
    pub async fn next(&mut self) -> Option<Result<KeyRecord>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(record)) => Some(Ok(record)),
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Drain every record, failing on the first error.
    pub async fn collect_all(mut self) -> Result<Vec<KeyRecord>> {
        let mut records = Vec::new();
        while let Some(item) = self.next().await {
            records.push(item?);
        }
        Ok(records)
    }

    /// Wait until the query has stopped and every tracker update is in.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Stop the query. Buffered records are discarded.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        self.finished = true;
    }

    pub fn is_closed(&self) -> bool {
        self.finished
    }

    /// Token that cancels the query from elsewhere. The set then yields
    /// [`ClientError::Cancelled`](crate::ClientError::Cancelled).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Partition progress of this query. Pass it to a new query to resume.
    pub fn tracker(&self) -> &Arc<PartitionTracker> {
        &self.tracker
    }
}

impl Drop for RecordSet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for RecordSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSet")
            .field("finished", &self.finished)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("tracker", &self.tracker)
            .finish()
    }
}
