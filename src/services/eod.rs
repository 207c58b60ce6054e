//! End-of-day orchestrator.
//!
//! Runs the daily cleanup as six independent steps; a failure in one is
//! recorded and never blocks the rest. The returned report carries per-step
//! durations and errors alongside the aggregate counters.

use chrono::{Duration, TimeZone, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::reconciliation::ReconciliationEngine;
use super::verifier::StatusVerifier;
use crate::broker::Broker;
use crate::domain::{DailyCounters, OrderEvent, OrderStatus};
use crate::error::{Result, StewardError};
use crate::store::OrderStore;

/// Configuration for the EOD run
#[derive(Debug, Clone)]
pub struct EodConfig {
    /// Age after which a non-terminal order is considered stale (hours)
    pub stale_after_hours: u64,
    /// Terminal orders older than this are archived (days)
    pub retention_days: u64,
}

impl Default for EodConfig {
    fn default() -> Self {
        Self {
            stale_after_hours: 24,
            retention_days: 30,
        }
    }
}

/// Outcome of one EOD step
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: &'static str,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Outcome of the full EOD run
#[derive(Debug, Clone, Default)]
pub struct EodReport {
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub steps: Vec<StepReport>,
    pub counters: DailyCounters,
}

pub struct EodOrchestrator {
    broker: Arc<dyn Broker>,
    store: Arc<dyn OrderStore>,
    verifier: Arc<StatusVerifier>,
    reconciler: Arc<ReconciliationEngine>,
    events: broadcast::Sender<OrderEvent>,
    config: EodConfig,
}

impl EodOrchestrator {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn OrderStore>,
        verifier: Arc<StatusVerifier>,
        reconciler: Arc<ReconciliationEngine>,
        events: broadcast::Sender<OrderEvent>,
        config: EodConfig,
    ) -> Self {
        Self {
            broker,
            store,
            verifier,
            reconciler,
            events,
            config,
        }
    }

    /// Run the six-step daily sweep
    pub async fn run_once(&self) -> EodReport {
        let mut report = EodReport::default();
        info!("EOD run starting");

        // (1) One final verifier pass
        Self::step(&mut report, "verify_statuses", async {
            self.verifier.poll_once().await.map(|_| ())
        })
        .await;

        // (2) Reconcile against current broker holdings
        Self::step(&mut report, "reconcile_holdings", async {
            self.reconciler.run_once().await.map(|_| ())
        })
        .await;

        // (3) Cancel stale non-terminal orders
        Self::step(&mut report, "cancel_stale_orders", async {
            self.cancel_stale_orders().await
        })
        .await;

        // (4) Aggregate daily counters
        let mut counters = DailyCounters::default();
        Self::step(&mut report, "aggregate_counters", async {
            let midnight = Utc::now().date_naive().and_time(chrono::NaiveTime::MIN);
            counters = self.store.daily_counters(Utc.from_utc_datetime(&midnight)).await?;
            Ok(())
        })
        .await;
        report.counters = counters;

        // (5) Dispatch the summary notification
        Self::step(&mut report, "dispatch_summary", async {
            self.events
                .send(OrderEvent::EodSummary { counters })
                .ok();
            Ok(())
        })
        .await;

        // (6) Archive old terminal orders
        Self::step(&mut report, "archive_terminal", async {
            let cutoff = Utc::now() - Duration::days(self.config.retention_days as i64);
            let archived = self.store.archive_terminal(cutoff).await?;
            debug!("Archived {} terminal orders", archived);
            Ok(())
        })
        .await;

        info!(
            "EOD run finished: {} completed, {} failed",
            report.steps_completed, report.steps_failed
        );
        report
    }

    async fn cancel_stale_orders(&self) -> Result<()> {
        let cutoff = Utc::now() - Duration::hours(self.config.stale_after_hours as i64);

        for order in self.store.list_stale(cutoff).await? {
            // An ongoing order is a held position, not a working order;
            // report it and leave it to reconciliation.
            if !order.status.can_transition_to(OrderStatus::Cancelled) {
                warn!(
                    "Stale {} order {} for {} left in place",
                    order.status,
                    order.id.unwrap_or_default(),
                    order.symbol
                );
                continue;
            }

            // Best effort at the broker first; a transient failure aborts
            // the step so tomorrow's run sees the order again.
            if let Some(broker_id) = &order.broker_order_id {
                match self.broker.cancel_order(broker_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => debug!("Broker cancel of {} skipped: {}", broker_id, e),
                }
            }

            let expected = order.status;
            let mut cancelled = order;
            cancelled.transition(OrderStatus::Cancelled, Some("stale order cleanup".to_string()))?;

            match self.store.update(&cancelled, expected).await {
                Ok(()) => info!(
                    "Cancelled stale order {} for {}",
                    cancelled.id.unwrap_or_default(),
                    cancelled.symbol
                ),
                Err(StewardError::StaleWrite { .. }) => {
                    debug!("Stale cancel lost a write race, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn step<F>(report: &mut EodReport, name: &'static str, fut: F)
    where
        F: Future<Output = Result<()>>,
    {
        let start = std::time::Instant::now();
        let error = match fut.await {
            Ok(()) => {
                report.steps_completed += 1;
                None
            }
            Err(e) => {
                report.steps_failed += 1;
                error!("EOD step {} failed: {}", name, e);
                Some(e.to_string())
            }
        };

        report.steps.push(StepReport {
            name,
            duration_ms: start.elapsed().as_millis() as u64,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use crate::domain::{Order, OrderRequest, OrderSide};
    use crate::services::locks::SymbolLocks;
    use crate::services::verifier::VerifierConfig;
    use crate::store::MemoryStore;

    struct Fixture {
        broker: Arc<SimBroker>,
        store: Arc<MemoryStore>,
        orchestrator: EodOrchestrator,
    }

    fn fixture() -> Fixture {
        let broker: Arc<SimBroker> = Arc::new(SimBroker::new());
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let (tx, _rx) = broadcast::channel(64);

        let verifier = Arc::new(StatusVerifier::new(
            broker.clone(),
            store.clone(),
            tx.clone(),
            VerifierConfig::default(),
        ));
        let reconciler = Arc::new(ReconciliationEngine::new(
            broker.clone(),
            store.clone(),
            Arc::new(SymbolLocks::new()),
        ));
        let orchestrator = EodOrchestrator::new(
            broker.clone(),
            store.clone(),
            verifier,
            reconciler,
            tx,
            EodConfig::default(),
        );

        Fixture {
            broker,
            store,
            orchestrator,
        }
    }

    async fn stale_pending_order(store: &MemoryStore, symbol: &str) -> Order {
        let mut order = Order::from_request(&OrderRequest::market(symbol, OrderSide::Buy, 10));
        order.created_at = Utc::now() - Duration::hours(48);
        store.insert(&order).await.unwrap()
    }

    #[tokio::test]
    async fn test_all_steps_complete_on_clean_run() {
        let fx = fixture();
        let report = fx.orchestrator.run_once().await;

        assert_eq!(report.steps_completed, 6);
        assert_eq!(report.steps_failed, 0);
        assert_eq!(report.steps.len(), 6);
        assert!(report.steps.iter().all(|s| s.error.is_none()));
    }

    #[tokio::test]
    async fn test_stale_order_cancelled() {
        let fx = fixture();
        let order = stale_pending_order(&fx.store, "ABC").await;

        let report = fx.orchestrator.run_once().await;
        assert_eq!(report.steps_failed, 0);

        let updated = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Cancelled);
        assert_eq!(updated.reason.as_deref(), Some("stale order cleanup"));
    }

    #[tokio::test]
    async fn test_stale_ongoing_order_left_alone() {
        let fx = fixture();
        let mut order = Order::from_request(&OrderRequest::market("ABC", OrderSide::Buy, 10));
        order.created_at = Utc::now() - Duration::hours(48);
        order.status = OrderStatus::Ongoing;
        let order = fx.store.insert(&order).await.unwrap();

        fx.orchestrator.run_once().await;

        let updated = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Ongoing);
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let fx = fixture();
        // A stale order whose broker-side cancel will hit an outage
        let mut order = stale_pending_order(&fx.store, "ABC").await;
        order.broker_order_id = Some("B-1".to_string());
        fx.store.update(&order, OrderStatus::Pending).await.unwrap();

        fx.broker.set_unavailable(true);
        let report = fx.orchestrator.run_once().await;

        // Steps 1-3 touch the broker and fail; 4-6 still execute
        assert_eq!(report.steps_completed + report.steps_failed, 6);
        assert_eq!(report.steps_failed, 3);
        assert_eq!(report.steps.len(), 6);

        let failed: Vec<&str> = report
            .steps
            .iter()
            .filter(|s| s.error.is_some())
            .map(|s| s.name)
            .collect();
        assert_eq!(
            failed,
            vec!["verify_statuses", "reconcile_holdings", "cancel_stale_orders"]
        );
    }

    #[tokio::test]
    async fn test_counters_reported() {
        let fx = fixture();
        let order = Order::from_request(&OrderRequest::market("ABC", OrderSide::Buy, 10));
        fx.store.insert(&order).await.unwrap();

        let report = fx.orchestrator.run_once().await;
        assert_eq!(report.counters.placed, 1);
        assert_eq!(report.counters.pending, 1);
    }
}
