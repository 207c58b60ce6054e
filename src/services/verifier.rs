//! Status verifier background service.
//!
//! Periodically polls the broker for the status of every non-terminal order
//! and drives the local state machine: fills, rejections, partial fills, and
//! placements the broker never acknowledged. State changes are persisted
//! through the order store's conditional writes and surfaced as events on
//! the broadcast channel; notification delivery happens elsewhere.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerOrder, BrokerOrderStatus};
use crate::domain::{Order, OrderEvent, OrderStatus};
use crate::error::{Result, StewardError};
use crate::store::OrderStore;

/// Configuration for the status verifier
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Interval between poll cycles (seconds)
    pub poll_interval_secs: u64,
    /// Grace period before an unacknowledged placement counts as failed (seconds)
    pub placement_grace_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1800, // 30 minutes
            placement_grace_secs: 120,
        }
    }
}

/// Verifier statistics
#[derive(Debug, Clone, Default)]
pub struct VerifierStats {
    pub cycles: u64,
    pub orders_checked: u64,
    pub fills: u64,
    pub rejections: u64,
    pub unacknowledged_failures: u64,
    pub transient_errors: u64,
    pub last_cycle: Option<DateTime<Utc>>,
}

/// Background order-status verifier
pub struct StatusVerifier {
    broker: Arc<dyn Broker>,
    store: Arc<dyn OrderStore>,
    events: broadcast::Sender<OrderEvent>,
    config: VerifierConfig,
    running: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<VerifierStats>>,
}

impl StatusVerifier {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn OrderStore>,
        events: broadcast::Sender<OrderEvent>,
        config: VerifierConfig,
    ) -> Self {
        Self {
            broker,
            store,
            events,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            handle: Mutex::new(None),
            stats: Arc::new(RwLock::new(VerifierStats::default())),
        }
    }

    pub async fn stats(&self) -> VerifierStats {
        self.stats.read().await.clone()
    }

    /// Start the polling loop
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Status verifier already running");
            return;
        }

        info!(
            "Starting status verifier (interval: {}s, grace: {}s)",
            self.config.poll_interval_secs, self.config.placement_grace_secs
        );

        let broker = self.broker.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let running = self.running.clone();
        let stop_signal = self.stop_signal.clone();
        let stats = self.stats.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                config.poll_interval_secs,
            ));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        // The cycle itself is never cancelled mid-flight; a
                        // stop request takes effect only between cycles.
                        match Self::run_cycle(&*broker, &*store, &events, &config, Utc::now()).await {
                            Ok(checked) => {
                                let mut s = stats.write().await;
                                s.cycles += 1;
                                s.orders_checked += checked.orders_checked;
                                s.fills += checked.fills;
                                s.rejections += checked.rejections;
                                s.unacknowledged_failures += checked.unacknowledged_failures;
                                s.last_cycle = Some(Utc::now());
                            }
                            Err(e) if e.is_transient() => {
                                stats.write().await.transient_errors += 1;
                                warn!("Verifier cycle skipped, broker unavailable: {}", e);
                            }
                            Err(e) => {
                                error!("Verifier cycle failed: {}", e);
                            }
                        }
                    }
                    _ = stop_signal.notified() => {
                        break;
                    }
                }
            }

            info!("Status verifier stopped");
        });

        *self.handle.lock().await = Some(handle);
    }

    /// Request a clean stop and wait for the in-flight cycle to finish
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_signal.notify_one();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Run one poll cycle immediately (used by the EOD orchestrator)
    pub async fn poll_once(&self) -> Result<CycleOutcome> {
        Self::run_cycle(
            &*self.broker,
            &*self.store,
            &self.events,
            &self.config,
            Utc::now(),
        )
        .await
    }

    /// On-demand verification of a single order, for callers needing
    /// synchronous confirmation immediately after placement
    pub async fn verify_order(&self, order_id: i64) -> Result<Order> {
        let order = self
            .store
            .get(order_id)
            .await?
            .ok_or_else(|| StewardError::OrderNotFound(order_id.to_string()))?;

        if order.is_terminal() {
            return Ok(order);
        }

        let Some(broker_id) = order.broker_order_id.clone() else {
            return Ok(order);
        };

        let broker_order = self.broker.get_order(&broker_id).await?;
        Self::apply_broker_status(&*self.store, &self.events, order.clone(), &broker_order).await?;

        self.store
            .get(order_id)
            .await?
            .ok_or_else(|| StewardError::OrderNotFound(order_id.to_string()))
    }

    async fn run_cycle(
        broker: &dyn Broker,
        store: &dyn OrderStore,
        events: &broadcast::Sender<OrderEvent>,
        config: &VerifierConfig,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome> {
        let broker_orders = broker.list_orders().await?;
        let by_id: HashMap<&str, &BrokerOrder> = broker_orders
            .iter()
            .map(|o| (o.broker_order_id.as_str(), o))
            .collect();

        let grace = Duration::seconds(config.placement_grace_secs as i64);
        let mut outcome = CycleOutcome::default();

        for order in store.list_non_terminal().await? {
            outcome.orders_checked += 1;

            match order.broker_order_id.clone() {
                Some(broker_id) => {
                    if let Some(broker_order) = by_id.get(broker_id.as_str()) {
                        match Self::apply_broker_status(store, events, order, broker_order).await {
                            Ok(Applied::Fill) => outcome.fills += 1,
                            Ok(Applied::Rejection) => outcome.rejections += 1,
                            Ok(_) => {}
                            Err(StewardError::StaleWrite { order_id, .. }) => {
                                // Another writer got there first; next cycle re-reads
                                debug!("Verifier lost write race on order {}", order_id);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    // Acknowledged but absent from today's list: an older
                    // working order, nothing to learn this cycle.
                }
                None if order.status == OrderStatus::Pending
                    && now - order.created_at > grace =>
                {
                    // Never acknowledged and past the grace period: the
                    // placement call never landed.
                    let mut failed = order;
                    failed.transition(
                        OrderStatus::Failed,
                        Some("placement never acknowledged by broker".to_string()),
                    )?;
                    match store.update(&failed, OrderStatus::Pending).await {
                        Ok(()) => {
                            outcome.unacknowledged_failures += 1;
                            warn!(
                                "Order {} for {} failed: never acknowledged",
                                failed.id.unwrap_or_default(),
                                failed.symbol
                            );
                            let _ = events.send(OrderEvent::Rejected {
                                symbol: failed.symbol.clone(),
                                reason: "placement never acknowledged by broker".to_string(),
                            });
                        }
                        Err(StewardError::StaleWrite { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                None => {}
            }
        }

        debug!(
            "Verifier cycle: checked={}, fills={}, rejections={}, unacknowledged={}",
            outcome.orders_checked,
            outcome.fills,
            outcome.rejections,
            outcome.unacknowledged_failures
        );

        Ok(outcome)
    }

    /// Apply one broker-reported status to a local order
    async fn apply_broker_status(
        store: &dyn OrderStore,
        events: &broadcast::Sender<OrderEvent>,
        mut order: Order,
        broker_order: &BrokerOrder,
    ) -> Result<Applied> {
        let expected = order.status;

        match broker_order.status {
            BrokerOrderStatus::Filled => {
                let price = broker_order
                    .avg_fill_price
                    .or(broker_order.price)
                    .or(order.requested_price)
                    .unwrap_or_default();
                let qty = if broker_order.filled_qty > 0 {
                    broker_order.filled_qty
                } else {
                    broker_order.qty
                };
                let time = broker_order.updated_at.unwrap_or_else(Utc::now);

                order.record_execution(price, qty, time)?;
                store.update(&order, expected).await?;

                info!(
                    "Order {} for {} executed: {} x{} @ {}",
                    order.id.unwrap_or_default(),
                    order.symbol,
                    order.side,
                    qty,
                    price
                );
                let _ = events.send(OrderEvent::Executed {
                    symbol: order.symbol.clone(),
                    side: order.side,
                    price,
                    qty,
                    time,
                });
                Ok(Applied::Fill)
            }
            BrokerOrderStatus::Rejected => {
                let reason = broker_order
                    .status_message
                    .clone()
                    .unwrap_or_else(|| "rejected by broker".to_string());

                order.transition(OrderStatus::Failed, Some(reason.clone()))?;
                store.update(&order, expected).await?;

                warn!(
                    "Order {} for {} rejected: {}",
                    order.id.unwrap_or_default(),
                    order.symbol,
                    reason
                );
                let _ = events.send(OrderEvent::Rejected {
                    symbol: order.symbol.clone(),
                    reason,
                });
                Ok(Applied::Rejection)
            }
            BrokerOrderStatus::PartiallyFilled => {
                order.execution_qty = Some(broker_order.filled_qty);
                if let Some(price) = broker_order.avg_fill_price {
                    order.execution_price = Some(price);
                }
                store.update(&order, expected).await?;

                let _ = events.send(OrderEvent::PartiallyFilled {
                    symbol: order.symbol.clone(),
                    qty: broker_order.filled_qty,
                });
                Ok(Applied::PartialFill)
            }
            BrokerOrderStatus::Cancelled => {
                if order.status.can_transition_to(OrderStatus::Cancelled) {
                    order.transition(
                        OrderStatus::Cancelled,
                        Some("cancelled at broker".to_string()),
                    )?;
                    store.update(&order, expected).await?;
                }
                Ok(Applied::Cancelled)
            }
            BrokerOrderStatus::Open => Ok(Applied::NoChange),
        }
    }
}

/// What one verifier cycle did
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    pub orders_checked: u64,
    pub fills: u64,
    pub rejections: u64,
    pub unacknowledged_failures: u64,
}

enum Applied {
    Fill,
    Rejection,
    PartialFill,
    Cancelled,
    NoChange,
}
