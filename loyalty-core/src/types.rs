//! Core types for the loyalty ledger
//!
//! Money is never a float here: every amount is [`Points`], a count of
//! hundredths. Order numbers keep their textual form so leading zeros survive.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// User identifier (subject of the session token)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Wrap an existing UUID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order number that already passed the Luhn check.
///
/// Construct through [`OrderNumber::parse`] (or
/// [`crate::validation::parse_order_number`]); the inner string is always a
/// trimmed run of ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct OrderNumber(pub(crate) String);

impl OrderNumber {
    /// Parse and checksum-validate raw input
    pub fn parse(raw: &str) -> Result<Self> {
        crate::validation::parse_order_number(raw)
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for OrderNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        OrderNumber::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl FromStr for OrderNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of an order.
///
/// ```text
/// NEW ──► PROCESSING ──► PROCESSED
///   │          │
///   └──────────┴───────► INVALID
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Persisted, not yet picked up by a worker
    New,
    /// A worker is polling the accrual service
    Processing,
    /// Rejected by the accrual service (terminal)
    Invalid,
    /// Accrual credited (terminal)
    Processed,
}

impl OrderStatus {
    /// Storage / wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    /// No transition is allowed out of a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }
}

impl FromStr for OrderStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(Error::Internal(format!("unknown order status '{}'", other))),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-point loyalty amount in hundredths of a point.
///
/// Serialized as a JSON number (`500.5`), parsed from any JSON number or
/// numeric string, rounded half away from zero to two places.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Points(i64);

impl Points {
    /// Zero points
    pub const ZERO: Points = Points(0);

    /// From a count of hundredths
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// From whole points
    pub const fn from_whole(whole: i64) -> Self {
        Self(whole * 100)
    }

    /// Count of hundredths
    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Convert an exact decimal amount. Negative or out-of-range amounts are rejected.
    pub fn from_decimal(amount: Decimal) -> Result<Self> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(Error::InvalidAmount(format!("negative amount {}", amount)));
        }
        let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        (rounded * Decimal::ONE_HUNDRED)
            .to_i64()
            .map(Points)
            .ok_or_else(|| Error::InvalidAmount(format!("amount {} out of range", amount)))
    }

    /// Exact decimal value
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, 2)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Points) -> Option<Points> {
        self.0.checked_add(other.0).map(Points)
    }

    pub fn checked_sub(self, other: Points) -> Option<Points> {
        self.0.checked_sub(other.0).map(Points)
    }
}

impl Add for Points {
    type Output = Points;

    fn add(self, rhs: Points) -> Points {
        Points(self.0 + rhs.0)
    }
}

impl Sub for Points {
    type Output = Points;

    fn sub(self, rhs: Points) -> Points {
        Points(self.0 - rhs.0)
    }
}

impl std::iter::Sum for Points {
    fn sum<I: Iterator<Item = Points>>(iter: I) -> Points {
        iter.fold(Points::ZERO, Add::add)
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl Serialize for Points {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        // Display only; arithmetic never leaves the integer domain.
        serializer.serialize_f64(self.to_decimal().to_f64().unwrap_or_default())
    }
}

impl<'de> Deserialize<'de> for Points {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let amount = <Decimal as Deserialize>::deserialize(deserializer)?;
        Points::from_decimal(amount).map_err(serde::de::Error::custom)
    }
}

/// Persisted order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub number: OrderNumber,
    pub user_id: UserId,
    pub status: OrderStatus,
    /// Present only once the order is PROCESSED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Points>,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// Freshly submitted order
    pub fn new(number: OrderNumber, user_id: UserId, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            number,
            user_id,
            status: OrderStatus::New,
            accrual: None,
            uploaded_at,
        }
    }
}

/// Balance snapshot for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalance {
    /// Credited minus withdrawn
    pub current: Points,
    /// Total ever withdrawn
    pub withdrawn: Points,
}

/// Completed withdrawal (immutable)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Withdrawal {
    #[serde(skip_serializing)]
    pub user_id: UserId,
    pub order: OrderNumber,
    pub sum: Points,
    pub processed_at: DateTime<Utc>,
}

/// Terminal verdict from the accrual service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalResult {
    /// Order accepted; credit the owner
    Processed { accrual: Points },
    /// Order rejected; nothing to credit
    Invalid,
}

impl TerminalResult {
    /// Status the order ends up in
    pub fn status(&self) -> OrderStatus {
        match self {
            TerminalResult::Processed { .. } => OrderStatus::Processed,
            TerminalResult::Invalid => OrderStatus::Invalid,
        }
    }
}

/// Unit of reconciliation work. Lives only in the queue and in a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationTask {
    pub order: OrderNumber,
    pub user_id: UserId,
    /// Base URL of the accrual service
    pub endpoint: String,
    /// Number of times the task was re-enqueued after an exhausted budget
    pub attempt: u32,
}

impl ReconciliationTask {
    pub fn new(order: OrderNumber, user_id: UserId, endpoint: impl Into<String>) -> Self {
        Self {
            order,
            user_id,
            endpoint: endpoint.into(),
            attempt: 0,
        }
    }

    /// Same task, one outer attempt later
    pub fn next_attempt(mut self) -> Self {
        self.attempt = self.attempt.saturating_add(1);
        self
    }
}
