//! Recovery Scanner
//!
//! The queue does not survive a restart; the store does. On startup every
//! order still NEW or PROCESSING is put back in the queue.

use crate::queue::{ReconciliationQueue, SubmitOutcome};
use crate::store::LedgerStore;
use crate::types::ReconciliationTask;
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Summary of one recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub submitted: usize,
    pub already_queued: usize,
}

pub struct RecoveryScanner {
    store: Arc<dyn LedgerStore>,
    queue: ReconciliationQueue,
    endpoint: String,
}

impl RecoveryScanner {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        queue: ReconciliationQueue,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            endpoint: endpoint.into(),
        }
    }

    /// Re-submit all non-terminal orders, waiting for queue capacity
    pub async fn run(&self) -> Result<RecoveryReport> {
        let orders = self.store.list_non_terminal_orders().await?;
        let mut report = RecoveryReport {
            scanned: orders.len(),
            ..Default::default()
        };

        for order in orders {
            let task = ReconciliationTask::new(order.number, order.user_id, self.endpoint.clone());
            match self.queue.submit_wait(task).await? {
                SubmitOutcome::Queued => report.submitted += 1,
                SubmitOutcome::AlreadyQueued => report.already_queued += 1,
            }
        }

        info!(
            scanned = report.scanned,
            submitted = report.submitted,
            already_queued = report.already_queued,
            "Recovery scan complete"
        );
        Ok(report)
    }
}
