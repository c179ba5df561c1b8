//! Bounded reconciliation queue
//!
//! One tokio mpsc channel shared by all workers, plus a set of order numbers
//! that have an outstanding task. A number stays in the set from submission
//! until the worker pool releases it, including while a re-enqueue delay is
//! pending, so at most one task per order exists at any time.

use crate::config::BackpressurePolicy;
use crate::metrics::Metrics;
use crate::types::{OrderNumber, ReconciliationTask};
use crate::{Error, Result};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of a successful submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Task placed in the queue
    Queued,
    /// A task for this order is already outstanding; nothing added
    AlreadyQueued,
}

#[derive(Clone)]
pub struct ReconciliationQueue {
    sender: mpsc::Sender<ReconciliationTask>,
    receiver: Arc<Mutex<mpsc::Receiver<ReconciliationTask>>>,
    in_flight: Arc<DashSet<OrderNumber>>,
    policy: BackpressurePolicy,
    shutdown: CancellationToken,
    metrics: Metrics,
}

impl ReconciliationQueue {
    pub fn new(
        capacity: usize,
        policy: BackpressurePolicy,
        shutdown: CancellationToken,
        metrics: Metrics,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            in_flight: Arc::new(DashSet::new()),
            policy,
            shutdown,
            metrics,
        }
    }

    /// Submit under the configured backpressure policy
    pub async fn submit(&self, task: ReconciliationTask) -> Result<SubmitOutcome> {
        self.submit_with(task, self.policy).await
    }

    /// Submit, waiting for capacity regardless of policy
    pub async fn submit_wait(&self, task: ReconciliationTask) -> Result<SubmitOutcome> {
        self.submit_with(task, BackpressurePolicy::Block).await
    }

    async fn submit_with(
        &self,
        task: ReconciliationTask,
        policy: BackpressurePolicy,
    ) -> Result<SubmitOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(Error::QueueClosed);
        }

        let order = task.order.clone();
        if !self.in_flight.insert(order.clone()) {
            debug!(order = %order, "Order already queued");
            return Ok(SubmitOutcome::AlreadyQueued);
        }

        match self.push(task, policy).await {
            Ok(()) => {
                self.metrics.orders_submitted.inc();
                Ok(SubmitOutcome::Queued)
            }
            Err(err) => {
                self.release(&order);
                Err(err)
            }
        }
    }

    /// Enqueue without touching the in-flight set
    async fn push(&self, task: ReconciliationTask, policy: BackpressurePolicy) -> Result<()> {
        match policy {
            BackpressurePolicy::Reject => match self.sender.try_send(task) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(task)) => {
                    return Err(Error::QueueFull(task.order));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(Error::QueueClosed),
            },
            BackpressurePolicy::Block => {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(Error::QueueClosed),
                    sent = self.sender.send(task) => sent.map_err(|_| Error::QueueClosed)?,
                }
            }
        }

        self.metrics.queue_depth.inc();
        Ok(())
    }

    /// Next task, or `None` once shutdown is signalled
    pub async fn recv(&self) -> Option<ReconciliationTask> {
        let task = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            task = async { self.receiver.lock().await.recv().await } => task,
        };

        if task.is_some() {
            self.metrics.queue_depth.dec();
        }
        task
    }

    /// Final disposition reached; the order may be submitted again
    pub fn release(&self, order: &OrderNumber) {
        self.in_flight.remove(order);
    }

    /// Put `task` back after `delay`. The order stays marked in flight while
    /// the timer runs; shutdown abandons the timer.
    pub fn requeue_after(&self, task: ReconciliationTask, delay: Duration) {
        self.metrics.tasks_requeued.inc();
        let queue = self.clone();

        tokio::spawn(async move {
            let order = task.order.clone();

            tokio::select! {
                _ = queue.shutdown.cancelled() => {
                    queue.release(&order);
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = queue.push(task, BackpressurePolicy::Block).await {
                        warn!(order = %order, error = %e, "Re-enqueue abandoned");
                        queue.release(&order);
                    }
                }
            }
        });
    }

    pub fn is_in_flight(&self, order: &OrderNumber) -> bool {
        self.in_flight.contains(order)
    }

    /// Tasks currently waiting in the channel
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
