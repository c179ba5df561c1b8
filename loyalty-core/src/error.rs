//! Error types for the reconciliation pipeline

use crate::types::{OrderNumber, Points};
use std::time::Duration;
use thiserror::Error;

/// Result type for loyalty operations
pub type Result<T> = std::result::Result<T, Error>;

/// Loyalty errors
#[derive(Error, Debug)]
pub enum Error {
    /// Order number is empty, not digits, or fails the Luhn check
    #[error("Invalid order format: {0}")]
    InvalidOrderFormat(String),

    /// Order number already belongs to another user
    #[error("Order {0} was uploaded by another user")]
    OrderConflict(OrderNumber),

    /// Order number is unknown (or not owned by the requester)
    #[error("Order not found: {0}")]
    OrderNotFound(OrderNumber),

    /// Non-positive, negative or out-of-range amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Withdrawal larger than the current balance
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Requested sum
        required: Points,
        /// Balance at the time of the attempt
        available: Points,
    },

    /// Reconciliation queue is at capacity; retry later
    #[error("Reconciliation queue is full, order {0} not queued")]
    QueueFull(OrderNumber),

    /// Reconciliation queue was shut down
    #[error("Reconciliation queue closed")]
    QueueClosed,

    /// Accrual service gave no terminal answer within the backoff budget
    #[error("Retry budget exhausted for order {order} after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted {
        /// Order being reconciled
        order: OrderNumber,
        /// Attempts made within the budget
        attempts: u32,
        /// Last retryable failure
        last_error: String,
        /// Server-requested wait carried by the last failure, if any
        retry_after: Option<Duration>,
    },

    /// Unrecoverable misconfiguration (bad endpoint, rejected request)
    #[error("Fatal configuration error: {0}")]
    FatalConfiguration(String),

    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QueueFull(_) | Error::RetryBudgetExhausted { .. } | Error::Storage(_)
        )
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Internal(format!("metrics: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let order = OrderNumber::parse("12345678903").unwrap();

        assert!(Error::QueueFull(order.clone()).is_retryable());
        assert!(Error::RetryBudgetExhausted {
            order: order.clone(),
            attempts: 3,
            last_error: "503".to_string(),
            retry_after: None,
        }
        .is_retryable());

        assert!(!Error::FatalConfiguration("bad url".to_string()).is_retryable());
        assert!(!Error::OrderConflict(order).is_retryable());
        assert!(!Error::InsufficientFunds {
            required: Points::from_whole(10),
            available: Points::ZERO,
        }
        .is_retryable());
    }
}
