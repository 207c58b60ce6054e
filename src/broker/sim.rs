//! Simulated broker for dry-run mode and tests.
//!
//! Keeps all broker-side state in memory and lets callers script fills,
//! rejections, manual orders, and outages. Order ids are deterministic
//! (`SIM-1`, `SIM-2`, ...) so tests can assert on them.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

use super::{Broker, BrokerOrder, BrokerOrderStatus};
use crate::domain::{OrderRequest, OrderSide};
use crate::error::{Result, StewardError};

#[derive(Default)]
struct SimState {
    orders: HashMap<String, BrokerOrder>,
    holdings: HashMap<String, i64>,
    quotes: HashMap<String, Decimal>,
    reject_next: Option<String>,
    cancelled: Vec<String>,
}

/// In-memory broker double
#[derive(Default)]
pub struct SimBroker {
    state: RwLock<SimState>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    placed: AtomicU64,
}

impl SimBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_quote(&self, symbol: &str, price: Decimal) {
        self.state.write().await.quotes.insert(symbol.to_string(), price);
    }

    pub async fn set_holding(&self, symbol: &str, qty: i64) {
        let mut state = self.state.write().await;
        if qty == 0 {
            state.holdings.remove(symbol);
        } else {
            state.holdings.insert(symbol.to_string(), qty);
        }
    }

    /// Insert an order as if it had been placed outside this engine
    pub async fn inject_order(&self, order: BrokerOrder) {
        self.state
            .write()
            .await
            .orders
            .insert(order.broker_order_id.clone(), order);
    }

    /// Script the next placement to be rejected with `reason`
    pub async fn reject_next_place(&self, reason: &str) {
        self.state.write().await.reject_next = Some(reason.to_string());
    }

    /// Simulate the broker being unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Mark an existing order filled and adjust holdings accordingly
    pub async fn fill_order(&self, broker_order_id: &str, price: Decimal, qty: i64) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(order) = state.orders.get_mut(broker_order_id) {
            order.status = BrokerOrderStatus::Filled;
            order.filled_qty = qty;
            order.avg_fill_price = Some(price);
            order.updated_at = Some(Utc::now());

            let delta = match order.side {
                OrderSide::Buy => qty,
                OrderSide::Sell => -qty,
            };
            let symbol = order.symbol.clone();
            let balance = state.holdings.entry(symbol.clone()).or_insert(0);
            *balance += delta;
            if *balance <= 0 {
                state.holdings.remove(&symbol);
            }
        }
    }

    /// Mark an existing order rejected with a verbatim reason
    pub async fn reject_order(&self, broker_order_id: &str, reason: &str) {
        let mut state = self.state.write().await;
        if let Some(order) = state.orders.get_mut(broker_order_id) {
            order.status = BrokerOrderStatus::Rejected;
            order.status_message = Some(reason.to_string());
            order.updated_at = Some(Utc::now());
        }
    }

    /// Record a partial fill without leaving the open state
    pub async fn partially_fill_order(&self, broker_order_id: &str, price: Decimal, qty: i64) {
        let mut state = self.state.write().await;
        if let Some(order) = state.orders.get_mut(broker_order_id) {
            order.status = BrokerOrderStatus::PartiallyFilled;
            order.filled_qty = qty;
            order.avg_fill_price = Some(price);
            order.updated_at = Some(Utc::now());
        }
    }

    pub fn placed_count(&self) -> u64 {
        self.placed.load(Ordering::SeqCst)
    }

    pub async fn cancelled_ids(&self) -> Vec<String> {
        self.state.read().await.cancelled.clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StewardError::BrokerUnavailable(
                "simulated outage".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Broker for SimBroker {
    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        self.check_available()?;

        let mut state = self.state.write().await;
        if let Some(reason) = state.reject_next.take() {
            return Err(StewardError::OrderRejected(reason));
        }

        let id = format!("SIM-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        state.orders.insert(
            id.clone(),
            BrokerOrder {
                broker_order_id: id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                qty: request.requested_qty,
                price: request.requested_price,
                status: BrokerOrderStatus::Open,
                filled_qty: 0,
                avg_fill_price: None,
                status_message: None,
                updated_at: Some(Utc::now()),
            },
        );
        self.placed.fetch_add(1, Ordering::SeqCst);

        info!(
            "sim broker accepted {} {} x{} as {}",
            request.side, request.symbol, request.requested_qty, id
        );
        Ok(id)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<()> {
        self.check_available()?;

        let mut guard = self.state.write().await;
        let state = &mut *guard;
        match state.orders.get_mut(broker_order_id) {
            Some(order) if order.status.is_open() => {
                order.status = BrokerOrderStatus::Cancelled;
                order.updated_at = Some(Utc::now());
                state.cancelled.push(broker_order_id.to_string());
                Ok(())
            }
            Some(_) => Err(StewardError::OrderRejected(format!(
                "order {} is not open",
                broker_order_id
            ))),
            None => Err(StewardError::OrderNotFound(broker_order_id.to_string())),
        }
    }

    async fn list_orders(&self) -> Result<Vec<BrokerOrder>> {
        self.check_available()?;
        Ok(self.state.read().await.orders.values().cloned().collect())
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder> {
        self.check_available()?;
        self.state
            .read()
            .await
            .orders
            .get(broker_order_id)
            .cloned()
            .ok_or_else(|| StewardError::OrderNotFound(broker_order_id.to_string()))
    }

    async fn get_holdings(&self) -> Result<HashMap<String, i64>> {
        self.check_available()?;
        Ok(self.state.read().await.holdings.clone())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Decimal> {
        self.check_available()?;
        self.state
            .read()
            .await
            .quotes
            .get(symbol)
            .copied()
            .ok_or_else(|| StewardError::Internal(format!("no quote seeded for {}", symbol)))
    }
}
