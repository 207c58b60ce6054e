//! PostgreSQL order store.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashSet;
use tracing::{debug, info};

use super::OrderStore;
use crate::domain::{
    DailyCounters, Order, OrderKind, OrderSide, OrderStatus, TrackingScopeEntry, Variety,
};
use crate::error::{Result, StewardError};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_order(row: &PgRow) -> Result<Order> {
        let parse = |field: &str, value: String| {
            value.parse().map_err(|_| {
                StewardError::Internal(format!("unexpected {} value: {}", field, value))
            })
        };

        let side = match row.get::<String, _>("side").as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => {
                return Err(StewardError::Internal(format!(
                    "unexpected side value: {}",
                    other
                )))
            }
        };
        let kind = match row.get::<String, _>("kind").as_str() {
            "MARKET" => OrderKind::Market,
            "LIMIT" => OrderKind::Limit,
            other => {
                return Err(StewardError::Internal(format!(
                    "unexpected kind value: {}",
                    other
                )))
            }
        };
        let variety = match row.get::<String, _>("variety").as_str() {
            "immediate" => Variety::Immediate,
            "after_hours" => Variety::AfterHours,
            other => {
                return Err(StewardError::Internal(format!(
                    "unexpected variety value: {}",
                    other
                )))
            }
        };
        let status: OrderStatus = parse("status", row.get::<String, _>("status"))?;

        Ok(Order {
            id: Some(row.get::<i64, _>("id")),
            client_order_id: row.get("client_order_id"),
            symbol: row.get("symbol"),
            side,
            requested_qty: row.get("requested_qty"),
            requested_price: row.get::<Option<Decimal>, _>("requested_price"),
            kind,
            variety,
            broker_order_id: row.get("broker_order_id"),
            status,
            retry_count: row.get::<i32, _>("retry_count") as u32,
            first_failed_at: row.get("first_failed_at"),
            last_retry_attempt: row.get("last_retry_attempt"),
            reason: row.get("reason"),
            execution_price: row.get::<Option<Decimal>, _>("execution_price"),
            execution_qty: row.get("execution_qty"),
            execution_time: row.get("execution_time"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn is_active_unique_violation(err: &sqlx::Error) -> bool {
        matches!(
            err,
            sqlx::Error::Database(db)
                if db.constraint() == Some("idx_orders_one_active_per_symbol")
        )
    }

    const ORDER_COLUMNS: &'static str = "id, client_order_id, symbol, side, requested_qty, \
         requested_price, kind, variety, broker_order_id, status, retry_count, first_failed_at, \
         last_retry_attempt, reason, execution_price, execution_qty, execution_time, created_at, \
         updated_at";
}

#[async_trait::async_trait]
impl OrderStore for PostgresStore {
    async fn insert(&self, order: &Order) -> Result<Order> {
        let row = sqlx::query(
            r#"
            INSERT INTO orders (
                client_order_id, symbol, side, requested_qty, requested_price, kind, variety,
                broker_order_id, status, retry_count, first_failed_at, last_retry_attempt,
                reason, execution_price, execution_qty, execution_time, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING id
            "#,
        )
        .bind(&order.client_order_id)
        .bind(&order.symbol)
        .bind(order.side.to_string())
        .bind(order.requested_qty)
        .bind(order.requested_price)
        .bind(order.kind.to_string())
        .bind(order.variety.to_string())
        .bind(&order.broker_order_id)
        .bind(order.status.as_str())
        .bind(order.retry_count as i32)
        .bind(order.first_failed_at)
        .bind(order.last_retry_attempt)
        .bind(&order.reason)
        .bind(order.execution_price)
        .bind(order.execution_qty)
        .bind(order.execution_time)
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if Self::is_active_unique_violation(&e) {
                StewardError::DuplicateOrderDetected(format!(
                    "an active order already exists for {}",
                    order.symbol
                ))
            } else {
                StewardError::Database(e)
            }
        })?;

        let mut inserted = order.clone();
        inserted.id = Some(row.get("id"));
        debug!(
            "Inserted order {} for {} ({})",
            inserted.id.unwrap_or_default(),
            inserted.symbol,
            inserted.status
        );
        Ok(inserted)
    }

    async fn update(&self, order: &Order, expected: OrderStatus) -> Result<()> {
        let id = order
            .id
            .ok_or_else(|| StewardError::Internal("cannot update an unsaved order".to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE orders SET
                broker_order_id = $3,
                status = $4,
                requested_qty = $5,
                requested_price = $6,
                retry_count = $7,
                first_failed_at = $8,
                last_retry_attempt = $9,
                reason = $10,
                execution_price = $11,
                execution_qty = $12,
                execution_time = $13,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(&order.broker_order_id)
        .bind(order.status.as_str())
        .bind(order.requested_qty)
        .bind(order.requested_price)
        .bind(order.retry_count as i32)
        .bind(order.first_failed_at)
        .bind(order.last_retry_attempt)
        .bind(&order.reason)
        .bind(order.execution_price)
        .bind(order.execution_qty)
        .bind(order.execution_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let found: Option<String> =
                sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;

            return match found {
                Some(found) => Err(StewardError::StaleWrite {
                    order_id: id.to_string(),
                    expected: expected.to_string(),
                    found,
                }),
                None => Err(StewardError::OrderNotFound(id.to_string())),
            };
        }

        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            Self::ORDER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn get_active_by_symbol(&self, symbol: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE symbol = $1 AND status IN ('pending', 'ongoing', 'failed')",
            Self::ORDER_COLUMNS
        ))
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn list_non_terminal(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE status IN ('pending', 'ongoing', 'failed') ORDER BY created_at",
            Self::ORDER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_order).collect()
    }

    async fn list_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders \
             WHERE status IN ('pending', 'ongoing', 'failed') AND created_at < $1 \
             ORDER BY created_at",
            Self::ORDER_COLUMNS
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_order).collect()
    }

    async fn list_by_symbol(&self, symbol: &str) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE symbol = $1 ORDER BY created_at",
            Self::ORDER_COLUMNS
        ))
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_order).collect()
    }

    async fn known_broker_order_ids(&self) -> Result<HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT broker_order_id FROM orders WHERE broker_order_id IS NOT NULL \
             UNION \
             SELECT broker_order_id FROM orders_archive WHERE broker_order_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    // ==================== Tracking scope ====================

    async fn get_scope(&self, symbol: &str) -> Result<Option<TrackingScopeEntry>> {
        let row = sqlx::query(
            "SELECT symbol, system_tracked_qty, pre_existing_qty, last_reconciled_at \
             FROM tracking_scope WHERE symbol = $1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TrackingScopeEntry {
            symbol: r.get("symbol"),
            system_tracked_qty: r.get("system_tracked_qty"),
            pre_existing_qty: r.get("pre_existing_qty"),
            last_reconciled_at: r.get("last_reconciled_at"),
        }))
    }

    async fn list_scope(&self) -> Result<Vec<TrackingScopeEntry>> {
        let rows = sqlx::query(
            "SELECT symbol, system_tracked_qty, pre_existing_qty, last_reconciled_at \
             FROM tracking_scope ORDER BY symbol",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| TrackingScopeEntry {
                symbol: r.get("symbol"),
                system_tracked_qty: r.get("system_tracked_qty"),
                pre_existing_qty: r.get("pre_existing_qty"),
                last_reconciled_at: r.get("last_reconciled_at"),
            })
            .collect())
    }

    async fn upsert_scope(&self, entry: &TrackingScopeEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracking_scope (symbol, system_tracked_qty, pre_existing_qty, last_reconciled_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (symbol) DO UPDATE SET
                system_tracked_qty = EXCLUDED.system_tracked_qty,
                last_reconciled_at = EXCLUDED.last_reconciled_at
            "#,
        )
        .bind(&entry.symbol)
        .bind(entry.system_tracked_qty)
        .bind(entry.pre_existing_qty)
        .bind(entry.last_reconciled_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_scope(&self, symbol: &str) -> Result<()> {
        sqlx::query("DELETE FROM tracking_scope WHERE symbol = $1")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== EOD support ====================

    async fn daily_counters(&self, since: DateTime<Utc>) -> Result<DailyCounters> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE created_at >= $1) AS placed,
                COUNT(*) FILTER (WHERE execution_time >= $1) AS executed,
                COUNT(*) FILTER (WHERE status = 'failed' AND updated_at >= $1) AS rejected,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending
            FROM orders
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(DailyCounters {
            placed: row.get::<i64, _>("placed") as u64,
            executed: row.get::<i64, _>("executed") as u64,
            rejected: row.get::<i64, _>("rejected") as u64,
            pending: row.get::<i64, _>("pending") as u64,
        })
    }

    async fn archive_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM orders
                WHERE status IN ('cancelled', 'closed') AND updated_at < $1
                RETURNING *
            )
            INSERT INTO orders_archive SELECT *, NOW() FROM moved
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        let archived = result.rows_affected();
        if archived > 0 {
            info!("Archived {} terminal orders", archived);
        }
        Ok(archived)
    }
}
