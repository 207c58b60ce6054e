//! Order store: the single source of truth for orders and tracking scope.
//!
//! Every component receives the store as an injected `Arc<dyn OrderStore>`;
//! there is no module-level shared state. All mutations of existing orders
//! carry the status the caller previously read, so a verifier update and a
//! retry-engine update racing on the same order cannot silently overwrite
//! each other: the loser gets `StaleWrite` and must re-read.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::domain::{DailyCounters, Order, OrderStatus, TrackingScopeEntry};
use crate::error::Result;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new order and assign its id. Refuses a second non-terminal
    /// order for the same symbol with `DuplicateOrderDetected`.
    async fn insert(&self, order: &Order) -> Result<Order>;

    /// Persist an updated order. `expected` is the status the caller read
    /// before deciding on this write; a mismatch fails with `StaleWrite`.
    async fn update(&self, order: &Order, expected: OrderStatus) -> Result<()>;

    async fn get(&self, id: i64) -> Result<Option<Order>>;

    /// The non-terminal order for a symbol, if any
    async fn get_active_by_symbol(&self, symbol: &str) -> Result<Option<Order>>;

    async fn list_non_terminal(&self) -> Result<Vec<Order>>;

    /// Non-terminal orders created before `older_than`
    async fn list_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Order>>;

    async fn list_by_symbol(&self, symbol: &str) -> Result<Vec<Order>>;

    /// Every broker order id this store has ever recorded; used to classify
    /// broker-side orders as system vs manual
    async fn known_broker_order_ids(&self) -> Result<HashSet<String>>;

    // ==================== Tracking scope ====================

    async fn get_scope(&self, symbol: &str) -> Result<Option<TrackingScopeEntry>>;

    async fn list_scope(&self) -> Result<Vec<TrackingScopeEntry>>;

    async fn upsert_scope(&self, entry: &TrackingScopeEntry) -> Result<()>;

    async fn delete_scope(&self, symbol: &str) -> Result<()>;

    // ==================== EOD support ====================

    /// Counters over orders created or resolved since `since`
    async fn daily_counters(&self, since: DateTime<Utc>) -> Result<DailyCounters>;

    /// Move terminal orders older than `older_than` into the archive;
    /// returns the number archived
    async fn archive_terminal(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
