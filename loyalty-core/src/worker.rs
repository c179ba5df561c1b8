//! Reconciliation Worker Pool
//!
//! N workers drain one bounded queue. Each task is driven to a final
//! disposition: resolved, re-enqueued after an outer delay, or dropped.

use crate::backoff::BackoffPolicy;
use crate::client::AccrualClient;
use crate::config::PipelineConfig;
use crate::ledger::LedgerUpdater;
use crate::metrics::Metrics;
use crate::queue::ReconciliationQueue;
use crate::types::ReconciliationTask;
use crate::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle to the running workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Start `config.workers` workers (at least one)
    pub fn spawn(
        config: &PipelineConfig,
        queue: ReconciliationQueue,
        client: AccrualClient,
        ledger: LedgerUpdater,
        metrics: Metrics,
        shutdown: CancellationToken,
    ) -> Self {
        let count = config.workers.max(1);
        let mut handles = Vec::with_capacity(count);

        for id in 0..count {
            let worker = Worker {
                id,
                queue: queue.clone(),
                client: client.clone(),
                ledger: ledger.clone(),
                requeue: config.requeue.clone(),
                metrics: metrics.clone(),
                shutdown: shutdown.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        info!(workers = count, "Worker pool started");
        Self { handles, shutdown }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop taking tasks, abandon polling and wait for every worker.
    /// A ledger write already in progress completes first.
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker terminated abnormally");
            }
        }

        info!("Worker pool stopped");
    }
}

struct Worker {
    id: usize,
    queue: ReconciliationQueue,
    client: AccrualClient,
    ledger: LedgerUpdater,
    requeue: BackoffPolicy,
    metrics: Metrics,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");

        while let Some(task) = self.queue.recv().await {
            self.process(task).await;
        }

        debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, task: ReconciliationTask) {
        let order = task.order.clone();

        match self.ledger.begin_processing(&order).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(worker = self.id, order = %order, "Order already terminal, skipping");
                self.queue.release(&order);
                return;
            }
            Err(e) => return self.dispose(task, e),
        }

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!(worker = self.id, order = %order, "Polling abandoned on shutdown");
                self.queue.release(&order);
                return;
            }
            result = self.client.query(&order, &task.endpoint) => result,
        };

        let result = match result {
            Ok(result) => result,
            Err(e) => return self.dispose(task, e),
        };

        match self.ledger.resolve(&order, &result).await {
            Ok(_) => self.queue.release(&order),
            Err(e) => self.dispose(task, e),
        }
    }

    fn dispose(&self, task: ReconciliationTask, err: Error) {
        match err {
            Error::RetryBudgetExhausted { .. } | Error::Storage(_) => {
                let base = self.requeue.base_delay(task.attempt);
                let mut delay = self.requeue.jittered(base, rand::random::<f64>());
                // Upstream asked for a longer pause than the outer schedule gives
                if let Error::RetryBudgetExhausted {
                    retry_after: Some(hint),
                    ..
                } = &err
                {
                    delay = delay.max(*hint);
                }

                warn!(
                    worker = self.id,
                    order = %task.order,
                    attempt = task.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Re-enqueueing order"
                );
                self.queue.requeue_after(task.next_attempt(), delay);
            }
            _ => {
                error!(
                    worker = self.id,
                    order = %task.order,
                    error = %err,
                    "Dropping reconciliation task"
                );
                self.metrics.tasks_dropped.inc();
                self.queue.release(&task.order);
            }
        }
    }
}
