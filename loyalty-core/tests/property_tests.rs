//! Property-based tests for validation and ledger invariants
//!
//! - Luhn: a computed check digit always validates, any single-digit
//!   substitution is rejected
//! - Conservation: current == Σ(accruals) − Σ(withdrawals), current >= 0
//! - Exactly-once credit: redelivering a terminal result never changes a balance

use chrono::Utc;
use loyalty_core::{
    validation::luhn_valid, Error, LedgerStore, LedgerUpdater, MemoryStore, Metrics, OrderNumber,
    Points, TerminalResult, UserId,
};
use proptest::prelude::*;
use std::sync::Arc;

/// Append the digit that makes `payload` Luhn-valid
fn with_check_digit(payload: &str) -> String {
    (0..10)
        .map(|d| format!("{}{}", payload, d))
        .find(|candidate| luhn_valid(candidate))
        .unwrap()
}

/// Distinct valid order number per index
fn order_number(index: usize) -> OrderNumber {
    OrderNumber::parse(&with_check_digit(&format!("{}", 100_000 + index))).unwrap()
}

/// Strategy for accruals and withdrawal sums (hundredths)
fn amount_strategy() -> impl Strategy<Value = i64> {
    0i64..100_000
}

#[derive(Debug, Clone)]
enum Op {
    Credit(i64),
    Debit(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        amount_strategy().prop_map(Op::Credit),
        (1i64..150_000).prop_map(Op::Debit),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: a computed check digit always validates
    #[test]
    fn prop_check_digit_validates(payload in "[0-9]{1,31}") {
        let number = with_check_digit(&payload);
        prop_assert!(luhn_valid(&number));
        let parsed = OrderNumber::parse(&number).unwrap();
        prop_assert_eq!(parsed.as_str(), number.as_str());
    }

    /// Property: changing any single digit breaks the checksum
    #[test]
    fn prop_single_digit_error_detected(
        payload in "[0-9]{1,31}",
        position in any::<prop::sample::Index>(),
        delta in 1u8..10,
    ) {
        let valid = with_check_digit(&payload);
        let mut bytes = valid.clone().into_bytes();
        let i = position.index(bytes.len());
        bytes[i] = b'0' + (bytes[i] - b'0' + delta) % 10;
        let mutated = String::from_utf8(bytes).unwrap();

        prop_assert!(!luhn_valid(&mutated));
        prop_assert!(matches!(OrderNumber::parse(&mutated), Err(Error::InvalidOrderFormat(_))));
    }

    /// Property: non-digit input is never accepted
    #[test]
    fn prop_non_digits_rejected(raw in "[0-9]{0,5}[a-zA-Z.,-][0-9]{0,5}") {
        prop_assert!(OrderNumber::parse(&raw).is_err());
    }

    /// Property: balance equals credits minus withdrawals and never goes negative
    #[test]
    fn prop_balance_conservation(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let ledger = LedgerUpdater::new(store.clone(), Metrics::new().unwrap());
            let user = UserId::generate();

            let mut credited = 0i64;
            let mut withdrawn = 0i64;
            let mut orders = 0usize;

            // Debits need an order owned by the user
            let anchor = order_number(usize::MAX / 2);
            store.insert_order(&anchor, user, Utc::now()).await.unwrap();

            for op in ops {
                match op {
                    Op::Credit(minor) => {
                        let number = order_number(orders);
                        orders += 1;
                        store.insert_order(&number, user, Utc::now()).await.unwrap();
                        ledger
                            .resolve(&number, &TerminalResult::Processed { accrual: Points::from_minor(minor) })
                            .await
                            .unwrap();
                        credited += minor;
                    }
                    Op::Debit(minor) => {
                        let before = store.balance(user).await.unwrap();
                        match ledger.debit(user, &anchor, Points::from_minor(minor)).await {
                            Ok(_) => withdrawn += minor,
                            Err(Error::InsufficientFunds { .. }) => {
                                prop_assert_eq!(store.balance(user).await.unwrap(), before);
                            }
                            Err(e) => prop_assert!(false, "unexpected error {}", e),
                        }
                    }
                }

                let balance = store.balance(user).await.unwrap();
                prop_assert!(balance.current.minor() >= 0);
                prop_assert_eq!(balance.current.minor(), credited - withdrawn);
                prop_assert_eq!(balance.withdrawn.minor(), withdrawn);
            }

            let history: i64 = store
                .list_withdrawals(user)
                .await
                .unwrap()
                .iter()
                .map(|w| w.sum.minor())
                .sum();
            prop_assert_eq!(history, withdrawn);
            Ok(())
        })?;
    }

    /// Property: redelivering a terminal result never credits twice
    #[test]
    fn prop_credit_at_most_once(accrual in amount_strategy(), redeliveries in 1usize..5) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let ledger = LedgerUpdater::new(store.clone(), Metrics::new().unwrap());
            let user = UserId::generate();
            let number = order_number(0);
            store.insert_order(&number, user, Utc::now()).await.unwrap();

            let result = TerminalResult::Processed { accrual: Points::from_minor(accrual) };
            for _ in 0..=redeliveries {
                ledger.resolve(&number, &result).await.unwrap();
            }
            // A late INVALID cannot flip a PROCESSED order either
            ledger.resolve(&number, &TerminalResult::Invalid).await.unwrap();

            prop_assert_eq!(store.balance(user).await.unwrap().current.minor(), accrual);
            let order = store.load_order(&number).await.unwrap().unwrap();
            prop_assert_eq!(order.accrual, Some(Points::from_minor(accrual)));
            Ok(())
        })?;
    }
}
