//! Loyalty Core
//!
//! Asynchronous order-accrual reconciliation for a loyalty-points ledger.
//!
//! # Architecture
//!
//! - **Order Validator**: Luhn check plus ownership lookup
//! - **Accrual Client**: one external lookup per attempt, pure backoff policy around it
//! - **Worker Pool**: N workers over one bounded queue, one task per order at a time
//! - **Ledger Updater**: the only writer of order status and user balance
//! - **Recovery Scanner**: re-queues non-terminal orders on startup
//!
//! # Invariants
//!
//! - An order is credited at most once: terminal orders are never mutated
//! - `current = Σ(accruals) − Σ(withdrawals)` and `current >= 0` for every user
//! - Durability lives in the store; the queue may be lost at any time

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod queue;
pub mod recovery;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;
pub mod worker;

// Re-exports
pub use backoff::BackoffPolicy;
pub use client::{AccrualClient, AccrualResponse, AccrualSource, HttpAccrualSource, QueryError};
pub use config::{BackpressurePolicy, PipelineConfig};
pub use error::{Error, Result};
pub use ledger::LedgerUpdater;
pub use metrics::Metrics;
pub use queue::{ReconciliationQueue, SubmitOutcome};
pub use recovery::{RecoveryReport, RecoveryScanner};
pub use service::{LoyaltyService, SubmitReceipt};
pub use store::{InsertOutcome, LedgerStore, MemoryStore, ResolveOutcome};
pub use types::{
    Order, OrderNumber, OrderStatus, Points, ReconciliationTask, TerminalResult, UserBalance,
    UserId, Withdrawal,
};
pub use validation::OrderValidator;
pub use worker::WorkerPool;
