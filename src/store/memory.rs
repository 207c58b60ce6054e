//! In-memory order store.
//!
//! Backs dry-run mode and the test suite with the same conditional-write
//! semantics as the PostgreSQL store: updates carry the status the caller
//! previously read and fail with `StaleWrite` on a mismatch.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use super::OrderStore;
use crate::domain::{DailyCounters, Order, OrderStatus, TrackingScopeEntry};
use crate::error::{Result, StewardError};

#[derive(Default)]
struct Inner {
    orders: HashMap<i64, Order>,
    archive: Vec<Order>,
    scope: HashMap<String, TrackingScopeEntry>,
    next_id: i64,
}

/// In-memory storage adapter
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of archived orders (test observability)
    pub async fn archived_count(&self) -> usize {
        self.inner.read().await.archive.len()
    }
}

#[async_trait::async_trait]
impl OrderStore for MemoryStore {
    async fn insert(&self, order: &Order) -> Result<Order> {
        let mut inner = self.inner.write().await;

        if order.status.is_active() {
            let duplicate = inner
                .orders
                .values()
                .any(|o| o.symbol == order.symbol && o.status.is_active());
            if duplicate {
                return Err(StewardError::DuplicateOrderDetected(format!(
                    "an active order already exists for {}",
                    order.symbol
                )));
            }
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let mut inserted = order.clone();
        inserted.id = Some(id);
        inner.orders.insert(id, inserted.clone());
        debug!(
            "Inserted order {} for {} ({})",
            id, inserted.symbol, inserted.status
        );
        Ok(inserted)
    }

    async fn update(&self, order: &Order, expected: OrderStatus) -> Result<()> {
        let id = order
            .id
            .ok_or_else(|| StewardError::Internal("cannot update an unsaved order".to_string()))?;

        let mut inner = self.inner.write().await;
        let current = inner
            .orders
            .get_mut(&id)
            .ok_or_else(|| StewardError::OrderNotFound(id.to_string()))?;

        if current.status != expected {
            return Err(StewardError::StaleWrite {
                order_id: id.to_string(),
                expected: expected.to_string(),
                found: current.status.to_string(),
            });
        }

        let mut updated = order.clone();
        updated.updated_at = Utc::now();
        *current = updated;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<Order>> {
        Ok(self.inner.read().await.orders.get(&id).cloned())
    }

    async fn get_active_by_symbol(&self, symbol: &str) -> Result<Option<Order>> {
        Ok(self
            .inner
            .read()
            .await
            .orders
            .values()
            .find(|o| o.symbol == symbol && o.status.is_active())
            .cloned())
    }

    async fn list_non_terminal(&self) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .inner
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn list_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .inner
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.status.is_active() && o.created_at < older_than)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn list_by_symbol(&self, symbol: &str) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .inner
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn known_broker_order_ids(&self) -> Result<HashSet<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .orders
            .values()
            .chain(inner.archive.iter())
            .filter_map(|o| o.broker_order_id.clone())
            .collect())
    }

    // ==================== Tracking scope ====================

    async fn get_scope(&self, symbol: &str) -> Result<Option<TrackingScopeEntry>> {
        Ok(self.inner.read().await.scope.get(symbol).cloned())
    }

    async fn list_scope(&self) -> Result<Vec<TrackingScopeEntry>> {
        let mut entries: Vec<TrackingScopeEntry> =
            self.inner.read().await.scope.values().cloned().collect();
        entries.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(entries)
    }

    async fn upsert_scope(&self, entry: &TrackingScopeEntry) -> Result<()> {
        use std::collections::hash_map::Entry;

        let mut inner = self.inner.write().await;
        match inner.scope.entry(entry.symbol.clone()) {
            Entry::Occupied(mut existing) => {
                // pre_existing_qty stays frozen at scope-creation time
                let existing = existing.get_mut();
                existing.system_tracked_qty = entry.system_tracked_qty;
                existing.last_reconciled_at = entry.last_reconciled_at;
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }
        Ok(())
    }

    async fn delete_scope(&self, symbol: &str) -> Result<()> {
        self.inner.write().await.scope.remove(symbol);
        Ok(())
    }

    // ==================== EOD support ====================

    async fn daily_counters(&self, since: DateTime<Utc>) -> Result<DailyCounters> {
        let inner = self.inner.read().await;
        let mut counters = DailyCounters::default();

        for order in inner.orders.values() {
            if order.created_at >= since {
                counters.placed += 1;
            }
            if order.execution_time.map_or(false, |t| t >= since) {
                counters.executed += 1;
            }
            if order.status == OrderStatus::Failed && order.updated_at >= since {
                counters.rejected += 1;
            }
            if order.status == OrderStatus::Pending {
                counters.pending += 1;
            }
        }

        Ok(counters)
    }

    async fn archive_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;

        let to_archive: Vec<i64> = inner
            .orders
            .iter()
            .filter(|(_, o)| o.status.is_terminal() && o.updated_at < older_than)
            .map(|(id, _)| *id)
            .collect();

        for id in &to_archive {
            if let Some(order) = inner.orders.remove(id) {
                inner.archive.push(order);
            }
        }

        Ok(to_archive.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderRequest, OrderSide};
    use chrono::Duration;

    fn pending_order(symbol: &str) -> Order {
        Order::from_request(&OrderRequest::market(symbol, OrderSide::Buy, 10))
    }

    #[tokio::test]
    async fn test_insert_assigns_ids() {
        let store = MemoryStore::new();
        let a = store.insert(&pending_order("ABC")).await.unwrap();
        let b = store.insert(&pending_order("XYZ")).await.unwrap();
        assert_eq!(a.id, Some(1));
        assert_eq!(b.id, Some(2));
    }

    #[tokio::test]
    async fn test_rejects_second_active_order_for_symbol() {
        let store = MemoryStore::new();
        store.insert(&pending_order("ABC")).await.unwrap();

        let err = store.insert(&pending_order("ABC")).await.unwrap_err();
        assert!(matches!(err, StewardError::DuplicateOrderDetected(_)));
    }

    #[tokio::test]
    async fn test_terminal_order_frees_the_symbol() {
        let store = MemoryStore::new();
        let mut order = store.insert(&pending_order("ABC")).await.unwrap();

        order.transition(OrderStatus::Cancelled, None).unwrap();
        store.update(&order, OrderStatus::Pending).await.unwrap();

        assert!(store.insert(&pending_order("ABC")).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_write_detected() {
        let store = MemoryStore::new();
        let inserted = store.insert(&pending_order("ABC")).await.unwrap();

        // First writer wins
        let mut first = inserted.clone();
        first.transition(OrderStatus::Failed, Some("rejected".to_string())).unwrap();
        store.update(&first, OrderStatus::Pending).await.unwrap();

        // Second writer read Pending before the first write landed
        let mut second = inserted.clone();
        second.transition(OrderStatus::Ongoing, None).unwrap();
        let err = store.update(&second, OrderStatus::Pending).await.unwrap_err();
        assert!(matches!(err, StewardError::StaleWrite { .. }));
    }

    #[tokio::test]
    async fn test_upsert_scope_freezes_pre_existing_qty() {
        let store = MemoryStore::new();
        store
            .upsert_scope(&TrackingScopeEntry::new("ABC", 10, 5))
            .await
            .unwrap();

        store
            .upsert_scope(&TrackingScopeEntry::new("ABC", 20, 99))
            .await
            .unwrap();

        let entry = store.get_scope("ABC").await.unwrap().unwrap();
        assert_eq!(entry.system_tracked_qty, 20);
        assert_eq!(entry.pre_existing_qty, 5);
    }

    #[tokio::test]
    async fn test_archive_moves_old_terminal_orders() {
        let store = MemoryStore::new();
        let mut order = store.insert(&pending_order("ABC")).await.unwrap();
        order.transition(OrderStatus::Cancelled, None).unwrap();
        store.update(&order, OrderStatus::Pending).await.unwrap();

        let cutoff = Utc::now() + Duration::hours(1);
        assert_eq!(store.archive_terminal(cutoff).await.unwrap(), 1);
        assert_eq!(store.archived_count().await, 1);
        assert!(store.get(order.id.unwrap()).await.unwrap().is_none());

        // Archived broker ids stay known
        assert!(store.list_by_symbol("ABC").await.unwrap().is_empty());
    }
}
