//! Broker abstraction layer.
//!
//! One explicit, versioned adapter interface per broker; resilience comes
//! from the interface contract and its tests, not from probing SDK method
//! variants at runtime. The connection/session itself is owned by a separate
//! authentication component and is read-only from this engine's perspective.

pub mod rest;
pub mod sim;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{OrderRequest, OrderSide};
use crate::error::Result;

pub use rest::RestBroker;
pub use sim::SimBroker;

/// Order status as the broker reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BrokerOrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

impl BrokerOrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, BrokerOrderStatus::Open | BrokerOrderStatus::PartiallyFilled)
    }
}

/// One order as reported by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub broker_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub price: Option<Decimal>,
    pub status: BrokerOrderStatus,
    pub filled_qty: i64,
    pub avg_fill_price: Option<Decimal>,
    /// Verbatim broker message, populated on rejection
    pub status_message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Broker adapter interface consumed by the engine.
///
/// Every call carries a bounded timeout in its implementation; a timeout is
/// surfaced as `BrokerUnavailable` and treated as transient by callers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Place an order; returns the broker-assigned order id
    async fn place_order(&self, request: &OrderRequest) -> Result<String>;

    /// Cancel an order by broker id
    async fn cancel_order(&self, broker_order_id: &str) -> Result<()>;

    /// Today's orders, open and terminal
    async fn list_orders(&self) -> Result<Vec<BrokerOrder>>;

    /// Fetch a single order by broker id
    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder>;

    /// Current holdings snapshot, symbol -> quantity
    async fn get_holdings(&self) -> Result<HashMap<String, i64>>;

    /// Last traded price for a symbol
    async fn get_quote(&self, symbol: &str) -> Result<Decimal>;

    /// Orders still working at the broker
    async fn list_open_orders(&self) -> Result<Vec<BrokerOrder>> {
        Ok(self
            .list_orders()
            .await?
            .into_iter()
            .filter(|o| o.status.is_open())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StewardError;

    #[test]
    fn test_open_statuses() {
        assert!(BrokerOrderStatus::Open.is_open());
        assert!(BrokerOrderStatus::PartiallyFilled.is_open());
        assert!(!BrokerOrderStatus::Filled.is_open());
        assert!(!BrokerOrderStatus::Rejected.is_open());
        assert!(!BrokerOrderStatus::Cancelled.is_open());
    }

    // The engine's loops branch on transience at this seam; pin the contract
    #[tokio::test]
    async fn test_error_contract_at_the_seam() {
        let mut broker = MockBroker::new();
        broker.expect_place_order().returning(|_| {
            Err(StewardError::BrokerUnavailable(
                "gateway timeout".to_string(),
            ))
        });
        broker
            .expect_cancel_order()
            .returning(|_| Err(StewardError::OrderRejected("order not open".to_string())));

        let request = OrderRequest::market("ABC", OrderSide::Buy, 1);
        let err = broker.place_order(&request).await.unwrap_err();
        assert!(err.is_transient(), "timeouts must be retried, not recorded");

        let err = broker.cancel_order("B-1").await.unwrap_err();
        assert!(!err.is_transient(), "a rejection is terminal for the attempt");
    }
}
