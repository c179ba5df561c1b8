//! Loyalty service facade
//!
//! Entry point for the request path: order upload, withdrawals and the
//! read-side queries. Everything slow happens behind the queue.

use crate::ledger::LedgerUpdater;
use crate::queue::ReconciliationQueue;
use crate::store::{InsertOutcome, LedgerStore};
use crate::types::{Order, OrderNumber, Points, ReconciliationTask, UserBalance, UserId, Withdrawal};
use crate::validation::{parse_order_number, OrderValidator, ValidatedOrder};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of an order upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitReceipt {
    /// New order stored and queued for reconciliation
    Accepted(OrderNumber),
    /// Same user uploaded this number before
    AlreadyUploaded(OrderNumber),
}

#[derive(Clone)]
pub struct LoyaltyService {
    store: Arc<dyn LedgerStore>,
    validator: OrderValidator,
    ledger: LedgerUpdater,
    queue: ReconciliationQueue,
    endpoint: String,
}

impl LoyaltyService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ledger: LedgerUpdater,
        queue: ReconciliationQueue,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            validator: OrderValidator::new(store.clone()),
            store,
            ledger,
            queue,
            endpoint: endpoint.into(),
        }
    }

    /// Validate, persist and enqueue an order.
    ///
    /// A stored order survives a `QueueFull` error; uploading it again (or a
    /// restart) puts it back in the queue.
    pub async fn submit_order(&self, user: UserId, raw: &str) -> Result<SubmitReceipt> {
        let number = match self.validator.validate(raw, user).await? {
            ValidatedOrder::Fresh(number) => number,
            ValidatedOrder::Resubmitted(number) => {
                self.resume(&number, user).await?;
                return Ok(SubmitReceipt::AlreadyUploaded(number));
            }
        };

        match self.store.insert_order(&number, user, Utc::now()).await? {
            InsertOutcome::Created => {
                info!(user = %user, order = %number, "Order uploaded");
                self.enqueue(&number, user).await?;
                Ok(SubmitReceipt::Accepted(number))
            }
            // Lost an insert race
            InsertOutcome::Existing(owner) if owner == user => {
                self.resume(&number, user).await?;
                Ok(SubmitReceipt::AlreadyUploaded(number))
            }
            InsertOutcome::Existing(_) => Err(Error::OrderConflict(number)),
        }
    }

    /// Re-enqueue a re-submitted order unless it is already terminal
    async fn resume(&self, number: &OrderNumber, user: UserId) -> Result<()> {
        match self.store.load_order(number).await? {
            Some(order) if !order.status.is_terminal() => self.enqueue(number, user).await,
            Some(_) => Ok(()),
            None => Err(Error::OrderNotFound(number.clone())),
        }
    }

    async fn enqueue(&self, number: &OrderNumber, user: UserId) -> Result<()> {
        let task = ReconciliationTask::new(number.clone(), user, self.endpoint.clone());
        let outcome = self.queue.submit(task).await?;
        debug!(order = %number, outcome = ?outcome, "Reconciliation task submitted");
        Ok(())
    }

    /// Spend `sum` points against one of the user's orders
    pub async fn withdraw(&self, user: UserId, raw_order: &str, sum: Points) -> Result<Withdrawal> {
        let number = parse_order_number(raw_order)?;
        self.ledger.debit(user, &number, sum).await
    }

    pub async fn balance(&self, user: UserId) -> Result<UserBalance> {
        self.store.balance(user).await
    }

    /// Newest first
    pub async fn orders(&self, user: UserId) -> Result<Vec<Order>> {
        self.store.list_user_orders(user).await
    }

    /// Newest first
    pub async fn withdrawals(&self, user: UserId) -> Result<Vec<Withdrawal>> {
        self.store.list_withdrawals(user).await
    }

    pub fn queue(&self) -> &ReconciliationQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressurePolicy;
    use crate::metrics::Metrics;
    use crate::store::MemoryStore;
    use crate::types::OrderStatus;
    use tokio_util::sync::CancellationToken;

    fn service(capacity: usize) -> (LoyaltyService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::new().unwrap();
        let queue = ReconciliationQueue::new(
            capacity,
            BackpressurePolicy::Reject,
            CancellationToken::new(),
            metrics.clone(),
        );
        let ledger = LedgerUpdater::new(store.clone(), metrics);
        (
            LoyaltyService::new(store.clone(), ledger, queue, "http://accrual"),
            store,
        )
    }

    #[tokio::test]
    async fn test_submit_flow() {
        let (service, store) = service(8);
        let alice = UserId::generate();
        let bob = UserId::generate();

        let receipt = service.submit_order(alice, "79927398713\n").await.unwrap();
        assert!(matches!(receipt, SubmitReceipt::Accepted(_)));
        assert_eq!(service.queue().depth(), 1);

        let again = service.submit_order(alice, "79927398713").await.unwrap();
        assert!(matches!(again, SubmitReceipt::AlreadyUploaded(_)));
        assert_eq!(service.queue().depth(), 1);

        assert!(matches!(
            service.submit_order(bob, "79927398713").await,
            Err(Error::OrderConflict(_))
        ));
        assert!(matches!(
            service.submit_order(bob, "79927398710").await,
            Err(Error::InvalidOrderFormat(_))
        ));

        let orders = service.orders(alice).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::New);
        assert!(store.list_user_orders(bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_full_keeps_order_for_retry() {
        let (service, store) = service(1);
        let user = UserId::generate();

        service.submit_order(user, "79927398713").await.unwrap();
        let result = service.submit_order(user, "12345678903").await;
        assert!(matches!(result, Err(Error::QueueFull(_))));

        // Persisted as NEW, picked up by recovery or a later upload
        let number = OrderNumber::parse("12345678903").unwrap();
        assert_eq!(
            store.load_order(&number).await.unwrap().unwrap().status,
            OrderStatus::New
        );
    }

    #[tokio::test]
    async fn test_withdraw_validates_order_number() {
        let (service, _) = service(8);
        let result = service
            .withdraw(UserId::generate(), "12345", Points::from_whole(1))
            .await;
        assert!(matches!(result, Err(Error::InvalidOrderFormat(_))));
    }
}
