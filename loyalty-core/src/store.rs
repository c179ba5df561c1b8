//! Storage abstraction for orders, balances and withdrawals
//!
//! The pipeline needs exactly the operations of [`LedgerStore`]. Every
//! mutating operation is atomic: implementations either run it inside one
//! database transaction (see the Postgres store in the service crate) or
//! under one lock ([`MemoryStore`]).

use crate::ledger::{plan_resolution, Resolution};
use crate::types::{
    Order, OrderNumber, OrderStatus, Points, TerminalResult, UserBalance, UserId, Withdrawal,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Result of an insert-if-absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A NEW order row was created
    Created,
    /// The number already existed; carries its owner
    Existing(UserId),
}

/// Result of applying a terminal result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Status written (and balance credited when PROCESSED)
    Applied {
        status: OrderStatus,
        credited: Points,
    },
    /// Order was already terminal; nothing changed
    AlreadyTerminal(OrderStatus),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Owner of `number`, if stored
    async fn find_order_owner(&self, number: &OrderNumber) -> Result<Option<UserId>>;

    /// Insert a NEW order unless the number exists (race-safe)
    async fn insert_order(
        &self,
        number: &OrderNumber,
        user: UserId,
        uploaded_at: DateTime<Utc>,
    ) -> Result<InsertOutcome>;

    async fn load_order(&self, number: &OrderNumber) -> Result<Option<Order>>;

    /// NEW → PROCESSING. Returns `false` if the order was not NEW.
    async fn mark_processing(&self, number: &OrderNumber) -> Result<bool>;

    /// Reload, check terminality, write status and credit owner in one transaction.
    /// The transition itself is decided by [`plan_resolution`].
    async fn resolve_order(
        &self,
        number: &OrderNumber,
        result: &TerminalResult,
    ) -> Result<ResolveOutcome>;

    /// Orders in NEW or PROCESSING, oldest first
    async fn list_non_terminal_orders(&self) -> Result<Vec<Order>>;

    /// Debit `sum` and record the withdrawal atomically.
    /// Fails with `InsufficientFunds` without changing anything.
    async fn debit_balance(
        &self,
        user: UserId,
        order: &OrderNumber,
        sum: Points,
        processed_at: DateTime<Utc>,
    ) -> Result<Withdrawal>;

    async fn balance(&self, user: UserId) -> Result<UserBalance>;

    /// User's orders, newest first
    async fn list_user_orders(&self, user: UserId) -> Result<Vec<Order>>;

    /// User's withdrawals, newest first
    async fn list_withdrawals(&self, user: UserId) -> Result<Vec<Withdrawal>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    orders: HashMap<OrderNumber, Order>,
    balances: HashMap<UserId, UserBalance>,
    withdrawals: Vec<Withdrawal>,
}

/// In-memory store. One mutex guards all tables, so every operation is
/// serializable with respect to every other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an order in an arbitrary state (restart simulations, fixtures)
    pub fn put_order(&self, order: Order) {
        self.state.lock().orders.insert(order.number.clone(), order);
    }

    /// Seed a balance (fixtures)
    pub fn put_balance(&self, user: UserId, balance: UserBalance) {
        self.state.lock().balances.insert(user, balance);
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find_order_owner(&self, number: &OrderNumber) -> Result<Option<UserId>> {
        Ok(self.state.lock().orders.get(number).map(|o| o.user_id))
    }

    async fn insert_order(
        &self,
        number: &OrderNumber,
        user: UserId,
        uploaded_at: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let mut state = self.state.lock();
        if let Some(existing) = state.orders.get(number) {
            return Ok(InsertOutcome::Existing(existing.user_id));
        }
        state
            .orders
            .insert(number.clone(), Order::new(number.clone(), user, uploaded_at));
        Ok(InsertOutcome::Created)
    }

    async fn load_order(&self, number: &OrderNumber) -> Result<Option<Order>> {
        Ok(self.state.lock().orders.get(number).cloned())
    }

    async fn mark_processing(&self, number: &OrderNumber) -> Result<bool> {
        let mut state = self.state.lock();
        match state.orders.get_mut(number) {
            Some(order) if order.status == OrderStatus::New => {
                order.status = OrderStatus::Processing;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::OrderNotFound(number.clone())),
        }
    }

    async fn resolve_order(
        &self,
        number: &OrderNumber,
        result: &TerminalResult,
    ) -> Result<ResolveOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let order = state
            .orders
            .get_mut(number)
            .ok_or_else(|| Error::OrderNotFound(number.clone()))?;

        match plan_resolution(order, result) {
            Resolution::AlreadyTerminal(status) => Ok(ResolveOutcome::AlreadyTerminal(status)),
            Resolution::MarkInvalid => {
                order.status = OrderStatus::Invalid;
                Ok(ResolveOutcome::Applied {
                    status: OrderStatus::Invalid,
                    credited: Points::ZERO,
                })
            }
            Resolution::Credit(amount) => {
                let balance = state.balances.entry(order.user_id).or_default();
                let current = balance.current.checked_add(amount).ok_or_else(|| {
                    Error::InvalidAmount(format!("balance overflow crediting {}", amount))
                })?;

                balance.current = current;
                order.status = OrderStatus::Processed;
                order.accrual = Some(amount);
                Ok(ResolveOutcome::Applied {
                    status: OrderStatus::Processed,
                    credited: amount,
                })
            }
        }
    }

    async fn list_non_terminal_orders(&self) -> Result<Vec<Order>> {
        let state = self.state.lock();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        Ok(orders)
    }

    async fn debit_balance(
        &self,
        user: UserId,
        order: &OrderNumber,
        sum: Points,
        processed_at: DateTime<Utc>,
    ) -> Result<Withdrawal> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let balance = state.balances.entry(user).or_default();
        if balance.current < sum {
            return Err(Error::InsufficientFunds {
                required: sum,
                available: balance.current,
            });
        }

        balance.current = balance.current - sum;
        balance.withdrawn = balance.withdrawn + sum;

        let withdrawal = Withdrawal {
            user_id: user,
            order: order.clone(),
            sum,
            processed_at,
        };
        state.withdrawals.push(withdrawal.clone());
        Ok(withdrawal)
    }

    async fn balance(&self, user: UserId) -> Result<UserBalance> {
        Ok(self
            .state
            .lock()
            .balances
            .get(&user)
            .copied()
            .unwrap_or_default())
    }

    async fn list_user_orders(&self, user: UserId) -> Result<Vec<Order>> {
        let state = self.state.lock();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.user_id == user)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(orders)
    }

    async fn list_withdrawals(&self, user: UserId) -> Result<Vec<Withdrawal>> {
        let state = self.state.lock();
        let mut withdrawals: Vec<Withdrawal> = state
            .withdrawals
            .iter()
            .filter(|w| w.user_id == user)
            .cloned()
            .collect();
        withdrawals.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(withdrawals)
    }
}
