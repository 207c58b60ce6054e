//! Position reconciliation engine.
//!
//! Compares the tracking scope against the broker's authoritative holdings
//! and absorbs whatever a human did directly through the broker account:
//! manual buys raise `system_tracked_qty`, manual sells lower it (floored at
//! zero), and a position that reached zero removes the symbol from scope and
//! force-closes any open order. Anything that fits no classification is
//! flagged as a conflict for manual review and never auto-resolved.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::locks::SymbolLocks;
use crate::broker::Broker;
use crate::domain::{
    OrderStatus, ReconciliationOutcome, ReconciliationReport, SymbolReconciliation,
};
use crate::error::{Result, StewardError};
use crate::store::OrderStore;

/// Attempts to win a conditional write before giving up on a forced close
const FORCE_CLOSE_ATTEMPTS: usize = 3;

pub struct ReconciliationEngine {
    broker: Arc<dyn Broker>,
    store: Arc<dyn OrderStore>,
    locks: Arc<SymbolLocks>,
}

impl ReconciliationEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn OrderStore>,
        locks: Arc<SymbolLocks>,
    ) -> Self {
        Self {
            broker,
            store,
            locks,
        }
    }

    /// Fetch current holdings from the broker and reconcile against them
    pub async fn run_once(&self) -> Result<ReconciliationReport> {
        let holdings = self.broker.get_holdings().await?;
        self.reconcile_with(&holdings).await
    }

    /// Reconcile the full tracking scope against a holdings snapshot.
    ///
    /// Idempotent: a second pass with the same snapshot yields all matched.
    pub async fn reconcile_with(
        &self,
        holdings: &HashMap<String, i64>,
    ) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        for scope_entry in self.store.list_scope().await? {
            let symbol = scope_entry.symbol.clone();
            let _guard = self.locks.acquire(&symbol).await;

            // Re-read under the lock: the scope updater or a previous step
            // may have moved the quantity since the listing.
            let Some(mut entry) = self.store.get_scope(&symbol).await? else {
                continue;
            };

            let expected = entry.expected_qty();
            let actual = holdings.get(&symbol).copied().unwrap_or(0);

            let outcome = if actual < 0 {
                let conflict = StewardError::ReconciliationConflict {
                    symbol: symbol.clone(),
                    detail: format!("broker reports negative quantity {}", actual),
                };
                error!("{} — flagged for manual review", conflict);
                SymbolReconciliation {
                    symbol: symbol.clone(),
                    outcome: ReconciliationOutcome::Conflict,
                    expected_qty: expected,
                    broker_qty: actual,
                    delta_applied: 0,
                }
            } else if actual == expected {
                entry.last_reconciled_at = Some(Utc::now());
                self.store.upsert_scope(&entry).await?;
                SymbolReconciliation {
                    symbol: symbol.clone(),
                    outcome: ReconciliationOutcome::Matched,
                    expected_qty: expected,
                    broker_qty: actual,
                    delta_applied: 0,
                }
            } else if actual == 0 {
                let delta = -entry.system_tracked_qty;
                self.store.delete_scope(&symbol).await?;
                self.force_close_open_order(&symbol).await?;
                info!(
                    "Position closed outside the engine: {} removed from tracking scope",
                    symbol
                );
                SymbolReconciliation {
                    symbol: symbol.clone(),
                    outcome: ReconciliationOutcome::PositionClosed,
                    expected_qty: expected,
                    broker_qty: actual,
                    delta_applied: delta,
                }
            } else if actual > expected {
                let delta = actual - expected;
                entry.system_tracked_qty += delta;
                entry.last_reconciled_at = Some(Utc::now());
                self.store.upsert_scope(&entry).await?;
                info!(
                    "Manual buy detected for {}: tracked quantity {} -> {}",
                    symbol,
                    entry.system_tracked_qty - delta,
                    entry.system_tracked_qty
                );
                SymbolReconciliation {
                    symbol: symbol.clone(),
                    outcome: ReconciliationOutcome::ManualBuyDetected,
                    expected_qty: expected,
                    broker_qty: actual,
                    delta_applied: delta,
                }
            } else {
                // 0 < actual < expected: partial manual sell
                let decrease = expected - actual;
                let before = entry.system_tracked_qty;
                entry.system_tracked_qty = (before - decrease).max(0);
                entry.last_reconciled_at = Some(Utc::now());
                self.store.upsert_scope(&entry).await?;
                info!(
                    "Manual sell detected for {}: tracked quantity {} -> {}",
                    symbol, before, entry.system_tracked_qty
                );
                SymbolReconciliation {
                    symbol: symbol.clone(),
                    outcome: ReconciliationOutcome::ManualSellDetected,
                    expected_qty: expected,
                    broker_qty: actual,
                    delta_applied: entry.system_tracked_qty - before,
                }
            };

            report.record(outcome);
        }

        info!("{}", report.summary());
        Ok(report)
    }

    /// Force the symbol's open order (if any) to closed, re-reading and
    /// retrying when a concurrent writer wins the conditional update
    async fn force_close_open_order(&self, symbol: &str) -> Result<()> {
        for _ in 0..FORCE_CLOSE_ATTEMPTS {
            let Some(mut order) = self.store.get_active_by_symbol(symbol).await? else {
                return Ok(());
            };

            let expected = order.status;
            if !expected.can_transition_to(OrderStatus::Closed) {
                debug!(
                    "Open order {} for {} cannot be force-closed from {}",
                    order.id.unwrap_or_default(),
                    symbol,
                    expected
                );
                return Ok(());
            }

            order.transition(
                OrderStatus::Closed,
                Some("position closed at broker".to_string()),
            )?;

            match self.store.update(&order, expected).await {
                Ok(()) => return Ok(()),
                Err(StewardError::StaleWrite { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        warn!(
            "Gave up force-closing order for {} after {} attempts",
            symbol, FORCE_CLOSE_ATTEMPTS
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use crate::domain::{Order, OrderRequest, OrderSide, TrackingScopeEntry};
    use crate::store::MemoryStore;

    struct Fixture {
        broker: Arc<SimBroker>,
        store: Arc<MemoryStore>,
        engine: ReconciliationEngine,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(SimBroker::new());
        let store = Arc::new(MemoryStore::new());
        let engine = ReconciliationEngine::new(
            broker.clone(),
            store.clone(),
            Arc::new(SymbolLocks::new()),
        );
        Fixture {
            broker,
            store,
            engine,
        }
    }

    #[tokio::test]
    async fn test_matched_position() {
        let fx = fixture();
        fx.store
            .upsert_scope(&TrackingScopeEntry::new("ABC", 10, 0))
            .await
            .unwrap();
        fx.broker.set_holding("ABC", 10).await;

        let report = fx.engine.run_once().await.unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.symbols[0].delta_applied, 0);
    }

    #[tokio::test]
    async fn test_manual_buy_raises_tracked_qty() {
        let fx = fixture();
        fx.store
            .upsert_scope(&TrackingScopeEntry::new("DEF", 10, 0))
            .await
            .unwrap();
        fx.broker.set_holding("DEF", 15).await;

        let report = fx.engine.run_once().await.unwrap();
        assert_eq!(report.manual_buys, 1);
        assert_eq!(report.symbols[0].delta_applied, 5);

        let entry = fx.store.get_scope("DEF").await.unwrap().unwrap();
        assert_eq!(entry.system_tracked_qty, 15);
    }

    #[tokio::test]
    async fn test_manual_buy_respects_pre_existing_qty() {
        let fx = fixture();
        fx.store
            .upsert_scope(&TrackingScopeEntry::new("DEF", 10, 5))
            .await
            .unwrap();
        // expected = 15; broker holds 15 -> matched despite pre-existing lot
        fx.broker.set_holding("DEF", 15).await;

        let report = fx.engine.run_once().await.unwrap();
        assert_eq!(report.matched, 1);
    }

    #[tokio::test]
    async fn test_partial_manual_sell_floors_at_zero() {
        let fx = fixture();
        fx.store
            .upsert_scope(&TrackingScopeEntry::new("GHI", 3, 10))
            .await
            .unwrap();
        // expected = 13, actual = 2: decrease of 11 exceeds tracked 3
        fx.broker.set_holding("GHI", 2).await;

        let report = fx.engine.run_once().await.unwrap();
        assert_eq!(report.manual_sells, 1);

        let entry = fx.store.get_scope("GHI").await.unwrap().unwrap();
        assert_eq!(entry.system_tracked_qty, 0);
    }

    #[tokio::test]
    async fn test_position_closed_removes_scope_and_closes_order() {
        let fx = fixture();
        fx.store
            .upsert_scope(&TrackingScopeEntry::new("GHI", 20, 0))
            .await
            .unwrap();

        let mut order = Order::from_request(&OrderRequest::market("GHI", OrderSide::Buy, 20));
        order.transition(OrderStatus::Ongoing, None).unwrap();
        let order = fx.store.insert(&order).await.unwrap();

        // No holdings seeded: broker quantity is zero
        let report = fx.engine.run_once().await.unwrap();
        assert_eq!(report.positions_closed, 1);

        assert!(fx.store.get_scope("GHI").await.unwrap().is_none());
        let closed = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(closed.status, OrderStatus::Closed);
        assert_eq!(closed.reason.as_deref(), Some("position closed at broker"));
    }

    #[tokio::test]
    async fn test_negative_broker_qty_flags_conflict() {
        let fx = fixture();
        fx.store
            .upsert_scope(&TrackingScopeEntry::new("ABC", 10, 0))
            .await
            .unwrap();
        fx.broker.set_holding("ABC", -4).await;

        let report = fx.engine.run_once().await.unwrap();
        assert!(report.has_conflicts());

        // Never auto-resolved
        let entry = fx.store.get_scope("ABC").await.unwrap().unwrap();
        assert_eq!(entry.system_tracked_qty, 10);
    }

    #[tokio::test]
    async fn test_idempotent_second_pass() {
        let fx = fixture();
        fx.store
            .upsert_scope(&TrackingScopeEntry::new("DEF", 10, 0))
            .await
            .unwrap();
        fx.store
            .upsert_scope(&TrackingScopeEntry::new("JKL", 8, 2))
            .await
            .unwrap();
        fx.broker.set_holding("DEF", 15).await;
        fx.broker.set_holding("JKL", 4).await;

        let first = fx.engine.run_once().await.unwrap();
        assert_eq!(first.manual_buys, 1);
        assert_eq!(first.manual_sells, 1);

        // No intervening broker change: everything matches now
        let second = fx.engine.run_once().await.unwrap();
        assert_eq!(second.matched, 2);
        assert_eq!(second.manual_buys, 0);
        assert_eq!(second.manual_sells, 0);
    }

    #[tokio::test]
    async fn test_convergence_after_one_pass() {
        let fx = fixture();
        fx.store
            .upsert_scope(&TrackingScopeEntry::new("AAA", 10, 3))
            .await
            .unwrap();
        fx.store
            .upsert_scope(&TrackingScopeEntry::new("BBB", 7, 0))
            .await
            .unwrap();
        fx.broker.set_holding("AAA", 20).await;
        fx.broker.set_holding("BBB", 5).await;

        fx.engine.run_once().await.unwrap();

        let holdings = fx.broker.get_holdings().await.unwrap();
        for entry in fx.store.list_scope().await.unwrap() {
            let broker_qty = holdings.get(&entry.symbol).copied().unwrap_or(0);
            assert_eq!(entry.expected_qty(), broker_qty, "symbol {}", entry.symbol);
        }
    }
}
