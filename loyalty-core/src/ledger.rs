//! Ledger Updater
//!
//! Sole writer of order status and user balances. The transition rule lives
//! in [`plan_resolution`]; stores execute it atomically.

use crate::metrics::Metrics;
use crate::store::{LedgerStore, ResolveOutcome};
use crate::types::{Order, OrderNumber, OrderStatus, Points, TerminalResult, UserId, Withdrawal};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a store must do to apply a terminal result to an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Order already terminal: change nothing
    AlreadyTerminal(OrderStatus),
    /// Set INVALID, credit nothing
    MarkInvalid,
    /// Set PROCESSED, store the accrual and credit the owner by this amount
    Credit(Points),
}

/// Decide the transition for `order` given `result`
pub fn plan_resolution(order: &Order, result: &TerminalResult) -> Resolution {
    if order.status.is_terminal() {
        return Resolution::AlreadyTerminal(order.status);
    }

    match result {
        TerminalResult::Invalid => Resolution::MarkInvalid,
        TerminalResult::Processed { accrual } => Resolution::Credit(*accrual),
    }
}

#[derive(Clone)]
pub struct LedgerUpdater {
    store: Arc<dyn LedgerStore>,
    metrics: Metrics,
}

impl LedgerUpdater {
    pub fn new(store: Arc<dyn LedgerStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// NEW → PROCESSING when a worker takes the task.
    ///
    /// Returns `false` when the order is already terminal and needs no polling.
    pub async fn begin_processing(&self, order: &OrderNumber) -> Result<bool> {
        if self.store.mark_processing(order).await? {
            debug!(order = %order, "Order moved to PROCESSING");
            return Ok(true);
        }

        match self.store.load_order(order).await? {
            Some(stored) => Ok(!stored.status.is_terminal()),
            None => Err(Error::OrderNotFound(order.clone())),
        }
    }

    /// Apply a terminal result exactly once
    pub async fn resolve(&self, order: &OrderNumber, result: &TerminalResult) -> Result<ResolveOutcome> {
        let outcome = self.store.resolve_order(order, result).await?;

        match outcome {
            ResolveOutcome::Applied { status, credited } => {
                self.metrics.record_resolution(status.as_str(), credited.minor());
                info!(
                    order = %order,
                    status = %status,
                    credited = %credited,
                    "Order resolved"
                );
            }
            ResolveOutcome::AlreadyTerminal(status) => {
                warn!(
                    order = %order,
                    status = %status,
                    "Order already terminal, result ignored"
                );
            }
        }

        Ok(outcome)
    }

    /// Debit `sum` from `user` against one of the user's own orders
    pub async fn debit(&self, user: UserId, order: &OrderNumber, sum: Points) -> Result<Withdrawal> {
        if !sum.is_positive() {
            return Err(Error::InvalidAmount(format!(
                "withdrawal sum must be positive, got {}",
                sum
            )));
        }

        match self.store.find_order_owner(order).await? {
            Some(owner) if owner == user => {}
            _ => return Err(Error::OrderNotFound(order.clone())),
        }

        match self.store.debit_balance(user, order, sum, Utc::now()).await {
            Ok(withdrawal) => {
                self.metrics.withdrawals.inc();
                info!(user = %user, order = %order, sum = %sum, "Withdrawal processed");
                Ok(withdrawal)
            }
            Err(err @ Error::InsufficientFunds { .. }) => {
                debug!(user = %user, order = %order, error = %err, "Withdrawal rejected");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}
