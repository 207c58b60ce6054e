//! Retry engine for failed placements.
//!
//! Re-attempts failed orders under current market and capital conditions.
//! Expiry is checked before anything else: an order past the close of the
//! next trading session after its first failure is cancelled, not retried.
//! Before placing, the broker's own order list is consulted so a manually
//! placed order is linked instead of duplicated, and a leftover system
//! duplicate from a prior run is cancelled first.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerOrder, BrokerOrderStatus};
use crate::domain::{Order, OrderEvent, OrderKind, OrderRequest, OrderStatus};
use crate::error::{Result, StewardError};
use crate::hours::TradingCalendar;
use crate::sizing::CapitalAllocator;
use crate::store::OrderStore;

/// What one retry run did
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryReport {
    pub examined: u64,
    pub expired: u64,
    pub manual_linked: u64,
    pub duplicates_cancelled: u64,
    pub retried: u64,
    pub still_failed: u64,
    pub skipped: u64,
}

pub struct RetryEngine {
    broker: Arc<dyn Broker>,
    store: Arc<dyn OrderStore>,
    events: broadcast::Sender<OrderEvent>,
    allocator: CapitalAllocator,
    calendar: TradingCalendar,
}

impl RetryEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn OrderStore>,
        events: broadcast::Sender<OrderEvent>,
        allocator: CapitalAllocator,
        calendar: TradingCalendar,
    ) -> Self {
        Self {
            broker,
            store,
            events,
            allocator,
            calendar,
        }
    }

    /// Run one retry pass over every retryable order
    pub async fn run_once(&self) -> Result<RetryReport> {
        self.run_at(Utc::now()).await
    }

    /// Run one retry pass with an explicit clock (deterministic under test)
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RetryReport> {
        let mut report = RetryReport::default();

        for order in self.store.list_non_terminal().await? {
            match order.status {
                OrderStatus::Failed => {
                    report.examined += 1;
                    self.process_failed(order, now, &mut report).await?;
                }
                OrderStatus::Pending => {
                    // A pending order that sat out past expiry (e.g. an
                    // after-hours order spanning a weekend) is cancelled too.
                    let baseline = order.first_failed_at.unwrap_or(order.created_at);
                    if self.calendar.is_expired(baseline, now) {
                        report.examined += 1;
                        self.expire(order, &mut report).await?;
                    }
                }
                _ => {}
            }
        }

        info!(
            "Retry run: examined={}, expired={}, linked={}, retried={}, still_failed={}, skipped={}",
            report.examined,
            report.expired,
            report.manual_linked,
            report.retried,
            report.still_failed,
            report.skipped
        );
        Ok(report)
    }

    async fn expire(&self, mut order: Order, report: &mut RetryReport) -> Result<()> {
        let expected = order.status;
        order.transition(OrderStatus::Cancelled, Some("expired".to_string()))?;

        match self.store.update(&order, expected).await {
            Ok(()) => {
                report.expired += 1;
                info!(
                    "Order {} for {} expired (first failure {:?})",
                    order.id.unwrap_or_default(),
                    order.symbol,
                    order.first_failed_at
                );
                Ok(())
            }
            Err(StewardError::StaleWrite { .. }) => {
                report.skipped += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn process_failed(
        &self,
        order: Order,
        now: DateTime<Utc>,
        report: &mut RetryReport,
    ) -> Result<()> {
        // Expiry precedes everything else
        let baseline = order.first_failed_at.unwrap_or(order.created_at);
        if self.calendar.is_expired(baseline, now) {
            return self.expire(order, report).await;
        }

        // Recompute the target quantity from current capital and price;
        // the quantity may rise or fall versus the failed attempt
        let quote = match self.broker.get_quote(&order.symbol).await {
            Ok(quote) => quote,
            Err(e) if e.is_transient() => {
                report.skipped += 1;
                warn!("No quote for {}, retry deferred: {}", order.symbol, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let target_qty = match self.allocator.quantity_for(quote) {
            Ok(qty) => qty,
            Err(e) => {
                report.skipped += 1;
                warn!("Retry for {} not sized: {}", order.symbol, e);
                return Ok(());
            }
        };

        // Classify broker-side orders for this symbol as system or manual
        let broker_orders = match self.broker.list_orders().await {
            Ok(orders) => orders,
            Err(e) if e.is_transient() => {
                report.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let known_ids = self.store.known_broker_order_ids().await?;

        let mut manual: Option<&BrokerOrder> = None;
        let mut system_duplicates: Vec<&BrokerOrder> = Vec::new();
        for broker_order in broker_orders.iter().filter(|o| o.symbol == order.symbol) {
            let linkable = matches!(
                broker_order.status,
                BrokerOrderStatus::Open
                    | BrokerOrderStatus::PartiallyFilled
                    | BrokerOrderStatus::Filled
            );
            if !linkable {
                continue;
            }
            if known_ids.contains(&broker_order.broker_order_id) {
                if broker_order.status.is_open() {
                    system_duplicates.push(broker_order);
                }
            } else if manual.is_none() {
                manual = Some(broker_order);
            }
        }

        // A manual order takes the place of a retry, whatever its quantity
        if let Some(manual) = manual {
            return self.link_manual(order, manual, report).await;
        }

        // A duplicate from a prior failed run must not stay working
        for duplicate in system_duplicates {
            match self.broker.cancel_order(&duplicate.broker_order_id).await {
                Ok(()) => {
                    report.duplicates_cancelled += 1;
                    info!(
                        "Cancelled duplicate system order {} for {}",
                        duplicate.broker_order_id, order.symbol
                    );
                }
                Err(e) if e.is_transient() => {
                    report.skipped += 1;
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        "Duplicate {} not cancelled ({}), proceeding",
                        duplicate.broker_order_id, e
                    );
                }
            }
        }

        self.place_retry(order, target_qty, quote, now, report).await
    }

    /// Adopt a manually placed broker order instead of placing a new one
    async fn link_manual(
        &self,
        mut order: Order,
        manual: &BrokerOrder,
        report: &mut RetryReport,
    ) -> Result<()> {
        let expected = order.status;

        order.broker_order_id = Some(manual.broker_order_id.clone());
        order.requested_qty = manual.qty;
        order.requested_price = manual.price;

        match manual.status {
            BrokerOrderStatus::Filled => {
                let price = manual.avg_fill_price.or(manual.price).unwrap_or_default();
                let qty = if manual.filled_qty > 0 {
                    manual.filled_qty
                } else {
                    manual.qty
                };
                order.record_execution(price, qty, manual.updated_at.unwrap_or_else(Utc::now))?;
            }
            _ => {
                order.transition(
                    OrderStatus::Pending,
                    Some("linked to manually placed order".to_string()),
                )?;
            }
        }

        match self.store.update(&order, expected).await {
            Ok(()) => {
                report.manual_linked += 1;
                info!(
                    "Linked manual order {} to {} (qty {}, status {})",
                    manual.broker_order_id,
                    order.symbol,
                    manual.qty,
                    order.status
                );
                let _ = self.events.send(OrderEvent::ManualOrderLinked {
                    symbol: order.symbol.clone(),
                    broker_order_id: manual.broker_order_id.clone(),
                    qty: manual.qty,
                    price: manual.price,
                });
                Ok(())
            }
            Err(StewardError::StaleWrite { .. }) => {
                report.skipped += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn place_retry(
        &self,
        mut order: Order,
        target_qty: i64,
        quote: Decimal,
        now: DateTime<Utc>,
        report: &mut RetryReport,
    ) -> Result<()> {
        let expected = order.status;
        let request = OrderRequest {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            requested_qty: target_qty,
            requested_price: match order.kind {
                OrderKind::Limit => Some(quote),
                OrderKind::Market => None,
            },
            kind: order.kind,
            variety: order.variety,
        };
        request.validate()?;

        match self.broker.place_order(&request).await {
            Ok(broker_order_id) => {
                order.broker_order_id = Some(broker_order_id);
                order.requested_qty = target_qty;
                order.requested_price = request.requested_price;
                order.retry_count += 1;
                order.last_retry_attempt = Some(now);
                order.transition(OrderStatus::Pending, None)?;
                order.reason = None;

                match self.store.update(&order, expected).await {
                    Ok(()) => {
                        report.retried += 1;
                        info!(
                            "Retry {} placed for {} x{} (attempt {})",
                            order.broker_order_id.as_deref().unwrap_or("?"),
                            order.symbol,
                            target_qty,
                            order.retry_count
                        );
                        let _ = self.events.send(OrderEvent::Placed {
                            symbol: order.symbol.clone(),
                            side: order.side,
                            qty: target_qty,
                        });
                    }
                    Err(StewardError::StaleWrite { .. }) => {
                        report.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
                Ok(())
            }
            Err(StewardError::OrderRejected(reason)) => {
                order.reason = Some(reason.clone());
                order.last_retry_attempt = Some(now);

                match self.store.update(&order, expected).await {
                    Ok(()) => {
                        report.still_failed += 1;
                        warn!("Retry for {} rejected again: {}", order.symbol, reason);
                        let _ = self.events.send(OrderEvent::Rejected {
                            symbol: order.symbol.clone(),
                            reason,
                        });
                    }
                    Err(StewardError::StaleWrite { .. }) => {
                        report.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                report.skipped += 1;
                warn!("Retry for {} deferred, broker unavailable", order.symbol);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use crate::domain::OrderSide;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct Fixture {
        broker: Arc<SimBroker>,
        store: Arc<MemoryStore>,
        engine: RetryEngine,
        events: broadcast::Receiver<OrderEvent>,
    }

    fn fixture(capital: rust_decimal::Decimal) -> Fixture {
        let broker = Arc::new(SimBroker::new());
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = broadcast::channel(64);
        let engine = RetryEngine::new(
            broker.clone(),
            store.clone(),
            tx,
            CapitalAllocator::new(capital),
            TradingCalendar::default(),
        );
        Fixture {
            broker,
            store,
            engine,
            events: rx,
        }
    }

    async fn failed_order(fx: &Fixture, symbol: &str, qty: i64, failed_at: DateTime<Utc>) -> Order {
        let mut order = Order::from_request(&OrderRequest::market(symbol, OrderSide::Buy, qty));
        order.created_at = failed_at;
        order.status = OrderStatus::Failed;
        order.first_failed_at = Some(failed_at);
        order.reason = Some("rejected: funds".to_string());
        fx.store.insert(&order).await.unwrap()
    }

    fn day0(h: u32) -> DateTime<Utc> {
        // Monday 2025-06-02
        Utc.with_ymd_and_hms(2025, 6, 2, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_retry_places_with_recomputed_quantity() {
        let mut fx = fixture(dec!(25000));
        let order = failed_order(&fx, "ABC", 10, day0(9)).await;
        // Current price 500 -> 25000 / 500 = 50 shares, not the original 10
        fx.broker.set_quote("ABC", dec!(500)).await;

        let report = fx.engine.run_at(day0(15)).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(fx.broker.placed_count(), 1);

        let updated = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Pending);
        assert_eq!(updated.requested_qty, 50);
        assert_eq!(updated.retry_count, 1);
        assert!(updated.last_retry_attempt.is_some());
        assert!(updated.broker_order_id.is_some());

        assert!(matches!(
            fx.events.recv().await.unwrap(),
            OrderEvent::Placed { qty: 50, .. }
        ));
    }

    #[tokio::test]
    async fn test_manual_order_is_linked_not_duplicated() {
        let mut fx = fixture(dec!(25000));
        let order = failed_order(&fx, "XYZ", 5, day0(9)).await;
        fx.broker.set_quote("XYZ", dec!(100)).await;

        // Unrecognized open order at the broker, quantity 8
        fx.broker
            .inject_order(BrokerOrder {
                broker_order_id: "MANUAL-77".to_string(),
                symbol: "XYZ".to_string(),
                side: OrderSide::Buy,
                qty: 8,
                price: Some(dec!(99.5)),
                status: BrokerOrderStatus::Open,
                filled_qty: 0,
                avg_fill_price: None,
                status_message: None,
                updated_at: None,
            })
            .await;

        let report = fx.engine.run_at(day0(15)).await.unwrap();
        assert_eq!(report.manual_linked, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(fx.broker.placed_count(), 0);

        let updated = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(updated.broker_order_id.as_deref(), Some("MANUAL-77"));
        assert_eq!(updated.requested_qty, 8);
        assert_eq!(updated.requested_price, Some(dec!(99.5)));
        assert_eq!(updated.status, OrderStatus::Pending);

        assert!(matches!(
            fx.events.recv().await.unwrap(),
            OrderEvent::ManualOrderLinked { qty: 8, .. }
        ));
    }

    #[tokio::test]
    async fn test_filled_manual_order_adopts_execution() {
        let fx = fixture(dec!(25000));
        let order = failed_order(&fx, "XYZ", 5, day0(9)).await;
        fx.broker.set_quote("XYZ", dec!(100)).await;

        fx.broker
            .inject_order(BrokerOrder {
                broker_order_id: "MANUAL-78".to_string(),
                symbol: "XYZ".to_string(),
                side: OrderSide::Buy,
                qty: 8,
                price: Some(dec!(99)),
                status: BrokerOrderStatus::Filled,
                filled_qty: 8,
                avg_fill_price: Some(dec!(99.2)),
                status_message: None,
                updated_at: None,
            })
            .await;

        fx.engine.run_at(day0(15)).await.unwrap();

        let updated = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Ongoing);
        assert_eq!(updated.execution_qty, Some(8));
        assert_eq!(updated.execution_price, Some(dec!(99.2)));
    }

    #[tokio::test]
    async fn test_system_duplicate_cancelled_before_retry() {
        let fx = fixture(dec!(1000));
        let order = failed_order(&fx, "ABC", 10, day0(9)).await;
        fx.broker.set_quote("ABC", dec!(100)).await;

        // A prior failed run left an acknowledged order working at the broker
        let mut stale = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        stale.broker_order_id = Some("SYS-1".to_string());
        fx.store.update(&stale, OrderStatus::Failed).await.unwrap();
        fx.broker
            .inject_order(BrokerOrder {
                broker_order_id: "SYS-1".to_string(),
                symbol: "ABC".to_string(),
                side: OrderSide::Buy,
                qty: 10,
                price: Some(dec!(100)),
                status: BrokerOrderStatus::Open,
                filled_qty: 0,
                avg_fill_price: None,
                status_message: None,
                updated_at: None,
            })
            .await;

        let report = fx.engine.run_at(day0(15)).await.unwrap();
        assert_eq!(report.duplicates_cancelled, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(fx.broker.cancelled_ids().await, vec!["SYS-1".to_string()]);

        let updated = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Pending);
        assert_ne!(updated.broker_order_id.as_deref(), Some("SYS-1"));
    }

    #[tokio::test]
    async fn test_expired_failed_order_is_cancelled() {
        let fx = fixture(dec!(25000));
        // Failed Friday 2025-05-30; checked Tuesday, well past Monday's close
        let friday = Utc.with_ymd_and_hms(2025, 5, 30, 9, 0, 0).unwrap();
        let order = failed_order(&fx, "ABC", 10, friday).await;

        let report = fx.engine.run_at(day0(16)).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(fx.broker.placed_count(), 0);

        let updated = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Cancelled);
        assert_eq!(updated.reason.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_stale_pending_order_expires() {
        let fx = fixture(dec!(25000));
        // Pending since Friday, checked Monday after market close
        let friday = Utc.with_ymd_and_hms(2025, 5, 30, 14, 0, 0).unwrap();
        let mut order = Order::from_request(&OrderRequest::market("JKL", OrderSide::Buy, 10));
        order.created_at = friday;
        let order = fx.store.insert(&order).await.unwrap();

        let monday_after_close = Utc.with_ymd_and_hms(2025, 6, 2, 16, 0, 0).unwrap();
        let report = fx.engine.run_at(monday_after_close).await.unwrap();
        assert_eq!(report.expired, 1);

        let updated = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Cancelled);
        assert_eq!(updated.reason.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_rejection_on_retry_keeps_failed_with_new_reason() {
        let fx = fixture(dec!(25000));
        let order = failed_order(&fx, "ABC", 10, day0(9)).await;
        fx.broker.set_quote("ABC", dec!(500)).await;
        fx.broker.reject_next_place("RMS: price band").await;

        let report = fx.engine.run_at(day0(15)).await.unwrap();
        assert_eq!(report.still_failed, 1);

        let updated = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Failed);
        assert_eq!(updated.reason.as_deref(), Some("RMS: price band"));
        assert_eq!(updated.retry_count, 0);
    }

    #[tokio::test]
    async fn test_broker_outage_defers_retry() {
        let fx = fixture(dec!(25000));
        let order = failed_order(&fx, "ABC", 10, day0(9)).await;
        fx.broker.set_unavailable(true);

        let report = fx.engine.run_at(day0(15)).await.unwrap();
        assert_eq!(report.skipped, 1);

        let updated = fx.store.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Failed);
    }
}
