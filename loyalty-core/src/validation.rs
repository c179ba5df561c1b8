//! Order number validation
//!
//! Two checks, in order: the Luhn checksum (pure) and the ownership lookup
//! (one store read, no writes). Inserting the order is the caller's job.

use crate::store::LedgerStore;
use crate::types::{OrderNumber, UserId};
use crate::{Error, Result};
use std::sync::Arc;

const MIN_DIGITS: usize = 2;
const MAX_DIGITS: usize = 32;

/// Luhn checksum over a string of ASCII digits.
///
/// Returns `false` for empty input or any non-digit character.
pub fn luhn_valid(digits: &str) -> bool {
    if digits.is_empty() {
        return false;
    }

    let mut sum = 0u32;
    for (i, byte) in digits.bytes().rev().enumerate() {
        if !byte.is_ascii_digit() {
            return false;
        }
        let mut digit = u32::from(byte - b'0');
        if i % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
    }

    sum % 10 == 0
}

/// Trim, length-check and checksum raw input
pub fn parse_order_number(raw: &str) -> Result<OrderNumber> {
    let digits = raw.trim();

    if digits.is_empty() {
        return Err(Error::InvalidOrderFormat("empty order number".to_string()));
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidOrderFormat(format!(
            "'{}' contains non-digit characters",
            digits
        )));
    }
    if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
        return Err(Error::InvalidOrderFormat(format!(
            "'{}' must have {} to {} digits",
            digits, MIN_DIGITS, MAX_DIGITS
        )));
    }
    if !luhn_valid(digits) {
        return Err(Error::InvalidOrderFormat(format!(
            "'{}' fails the checksum",
            digits
        )));
    }

    Ok(OrderNumber(digits.to_string()))
}

/// Outcome of a successful validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedOrder {
    /// Unknown number; the caller should insert it
    Fresh(OrderNumber),
    /// Already stored for the same user (idempotent re-submission)
    Resubmitted(OrderNumber),
}

impl ValidatedOrder {
    pub fn number(&self) -> &OrderNumber {
        match self {
            ValidatedOrder::Fresh(number) | ValidatedOrder::Resubmitted(number) => number,
        }
    }
}

/// Checksum plus ownership check
#[derive(Clone)]
pub struct OrderValidator {
    store: Arc<dyn LedgerStore>,
}

impl OrderValidator {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Validate `raw` on behalf of `user`
    pub async fn validate(&self, raw: &str, user: UserId) -> Result<ValidatedOrder> {
        let number = parse_order_number(raw)?;

        match self.store.find_order_owner(&number).await? {
            None => Ok(ValidatedOrder::Fresh(number)),
            Some(owner) if owner == user => Ok(ValidatedOrder::Resubmitted(number)),
            Some(_) => Err(Error::OrderConflict(number)),
        }
    }
}
