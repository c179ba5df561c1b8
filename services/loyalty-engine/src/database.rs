//! Postgres-backed ledger store
//!
//! Every mutating operation runs in one transaction; the order row (or the
//! balance row for debits) is locked with `SELECT ... FOR UPDATE` first.

use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loyalty_core::ledger::{plan_resolution, Resolution};
use loyalty_core::store::{InsertOutcome, LedgerStore, ResolveOutcome};
use loyalty_core::{
    Error, Order, OrderNumber, OrderStatus, Points, Result, TerminalResult, UserBalance, UserId,
    Withdrawal,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

fn db_err(err: sqlx::Error) -> Error {
    Error::Storage(err.to_string())
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let number: String = row.try_get("number").map_err(db_err)?;
    let user_id: Uuid = row.try_get("user_id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let accrual: Option<i64> = row.try_get("accrual_minor").map_err(db_err)?;
    let uploaded_at: DateTime<Utc> = row.try_get("uploaded_at").map_err(db_err)?;

    Ok(Order {
        number: OrderNumber::parse(&number)
            .map_err(|e| Error::Storage(format!("corrupt order row: {}", e)))?,
        user_id: UserId::new(user_id),
        status: status.parse()?,
        accrual: accrual.map(Points::from_minor),
        uploaded_at,
    })
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(db_err)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("migration failed: {}", e)))?;

        info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn find_order_owner(&self, number: &OrderNumber) -> Result<Option<UserId>> {
        let owner: Option<Uuid> = sqlx::query_scalar("SELECT user_id FROM orders WHERE number = $1")
            .bind(number.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(owner.map(UserId::new))
    }

    async fn insert_order(
        &self,
        number: &OrderNumber,
        user: UserId,
        uploaded_at: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO orders (number, user_id, status, uploaded_at)
            VALUES ($1, $2, 'NEW', $3)
            ON CONFLICT (number) DO NOTHING
            RETURNING user_id
            "#,
        )
        .bind(number.as_str())
        .bind(user.as_uuid())
        .bind(uploaded_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if inserted.is_some() {
            return Ok(InsertOutcome::Created);
        }

        match self.find_order_owner(number).await? {
            Some(owner) => Ok(InsertOutcome::Existing(owner)),
            None => Err(Error::Storage(format!(
                "order {} conflicted on insert but is missing",
                number
            ))),
        }
    }

    async fn load_order(&self, number: &OrderNumber) -> Result<Option<Order>> {
        let row = sqlx::query(
            "SELECT number, user_id, status, accrual_minor, uploaded_at FROM orders WHERE number = $1",
        )
        .bind(number.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(order_from_row).transpose()
    }

    async fn mark_processing(&self, number: &OrderNumber) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE orders SET status = 'PROCESSING' WHERE number = $1 AND status = 'NEW'",
        )
        .bind(number.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }

        match self.find_order_owner(number).await? {
            Some(_) => Ok(false),
            None => Err(Error::OrderNotFound(number.clone())),
        }
    }

    async fn resolve_order(
        &self,
        number: &OrderNumber,
        result: &TerminalResult,
    ) -> Result<ResolveOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT number, user_id, status, accrual_minor, uploaded_at
            FROM orders
            WHERE number = $1
            FOR UPDATE
            "#,
        )
        .bind(number.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let order = match row {
            Some(row) => order_from_row(&row)?,
            None => return Err(Error::OrderNotFound(number.clone())),
        };

        let outcome = match plan_resolution(&order, result) {
            Resolution::AlreadyTerminal(status) => ResolveOutcome::AlreadyTerminal(status),
            Resolution::MarkInvalid => {
                sqlx::query("UPDATE orders SET status = 'INVALID' WHERE number = $1")
                    .bind(number.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;

                ResolveOutcome::Applied {
                    status: OrderStatus::Invalid,
                    credited: Points::ZERO,
                }
            }
            Resolution::Credit(amount) => {
                sqlx::query(
                    "UPDATE orders SET status = 'PROCESSED', accrual_minor = $2 WHERE number = $1",
                )
                .bind(number.as_str())
                .bind(amount.minor())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                sqlx::query(
                    r#"
                    INSERT INTO balances (user_id, current_minor, withdrawn_minor)
                    VALUES ($1, $2, 0)
                    ON CONFLICT (user_id)
                    DO UPDATE SET current_minor = balances.current_minor + EXCLUDED.current_minor
                    "#,
                )
                .bind(order.user_id.as_uuid())
                .bind(amount.minor())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                ResolveOutcome::Applied {
                    status: OrderStatus::Processed,
                    credited: amount,
                }
            }
        };

        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    async fn list_non_terminal_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT number, user_id, status, accrual_minor, uploaded_at
            FROM orders
            WHERE status IN ('NEW', 'PROCESSING')
            ORDER BY uploaded_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(order_from_row).collect()
    }

    async fn debit_balance(
        &self,
        user: UserId,
        order: &OrderNumber,
        sum: Points,
        processed_at: DateTime<Utc>,
    ) -> Result<Withdrawal> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("INSERT INTO balances (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let current: i64 =
            sqlx::query_scalar("SELECT current_minor FROM balances WHERE user_id = $1 FOR UPDATE")
                .bind(user.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

        let available = Points::from_minor(current);
        if available < sum {
            tx.rollback().await.map_err(db_err)?;
            return Err(Error::InsufficientFunds {
                required: sum,
                available,
            });
        }

        sqlx::query(
            r#"
            UPDATE balances
            SET current_minor = current_minor - $2,
                withdrawn_minor = withdrawn_minor + $2
            WHERE user_id = $1
            "#,
        )
        .bind(user.as_uuid())
        .bind(sum.minor())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO withdrawals (user_id, order_number, sum_minor, processed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user.as_uuid())
        .bind(order.as_str())
        .bind(sum.minor())
        .bind(processed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(Withdrawal {
            user_id: user,
            order: order.clone(),
            sum,
            processed_at,
        })
    }

    async fn balance(&self, user: UserId) -> Result<UserBalance> {
        let row = sqlx::query(
            "SELECT current_minor, withdrawn_minor FROM balances WHERE user_id = $1",
        )
        .bind(user.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(UserBalance {
                current: Points::from_minor(row.try_get("current_minor").map_err(db_err)?),
                withdrawn: Points::from_minor(row.try_get("withdrawn_minor").map_err(db_err)?),
            }),
            None => Ok(UserBalance::default()),
        }
    }

    async fn list_user_orders(&self, user: UserId) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT number, user_id, status, accrual_minor, uploaded_at
            FROM orders
            WHERE user_id = $1
            ORDER BY uploaded_at DESC
            "#,
        )
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(order_from_row).collect()
    }

    async fn list_withdrawals(&self, user: UserId) -> Result<Vec<Withdrawal>> {
        let rows = sqlx::query(
            r#"
            SELECT order_number, sum_minor, processed_at
            FROM withdrawals
            WHERE user_id = $1
            ORDER BY processed_at DESC, id DESC
            "#,
        )
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let order: String = row.try_get("order_number").map_err(db_err)?;
                Ok(Withdrawal {
                    user_id: user,
                    order: OrderNumber::parse(&order)
                        .map_err(|e| Error::Storage(format!("corrupt withdrawal row: {}", e)))?,
                    sum: Points::from_minor(row.try_get("sum_minor").map_err(db_err)?),
                    processed_at: row.try_get("processed_at").map_err(db_err)?,
                })
            })
            .collect()
    }
}
