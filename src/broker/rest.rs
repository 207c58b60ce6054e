//! REST broker adapter (native Rust, no external SDK dependency).
//!
//! Speaks a plain JSON order API: the session token is issued by the
//! authentication component and read from the environment. Network failures
//! and timeouts map to `BrokerUnavailable` so the owning loops treat them as
//! transient; an explicit rejection payload maps to `OrderRejected` with the
//! broker's reason carried verbatim.

use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Broker, BrokerOrder, BrokerOrderStatus};
use crate::domain::{OrderKind, OrderRequest, OrderSide, Variety};
use crate::error::{Result, StewardError};

#[derive(Clone)]
pub struct RestBroker {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

impl RestBroker {
    pub fn new(base_url: &str, timeout_ms: u64, access_token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("steward-broker-adapter/0.1")
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| StewardError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
        })
    }

    /// Read the session token from `BROKER_ACCESS_TOKEN`
    pub fn from_env(base_url: &str, timeout_ms: u64) -> Result<Self> {
        let token = std::env::var("BROKER_ACCESS_TOKEN").ok();
        if token.is_none() {
            warn!("BROKER_ACCESS_TOKEN not set; broker calls will be unauthenticated");
        }
        Self::new(base_url, timeout_ms, token)
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self.http.request(method.clone(), &url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                StewardError::BrokerUnavailable(format!("{} {}: {}", method, path, e))
            } else {
                StewardError::Http(e)
            }
        })?;

        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            debug!("{} {} -> {}", method, path, status);
            return Ok(payload);
        }

        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message")
            .to_string();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(StewardError::BrokerUnavailable(format!(
                "{} {} -> {}: {}",
                method, path, status, message
            )))
        } else {
            Err(StewardError::OrderRejected(message))
        }
    }

    fn parse_status(value: &str) -> BrokerOrderStatus {
        match value.to_ascii_uppercase().as_str() {
            "OPEN" | "TRIGGER PENDING" => BrokerOrderStatus::Open,
            "PARTIALLY_FILLED" | "PARTIAL" => BrokerOrderStatus::PartiallyFilled,
            "FILLED" | "COMPLETE" => BrokerOrderStatus::Filled,
            "REJECTED" => BrokerOrderStatus::Rejected,
            _ => BrokerOrderStatus::Cancelled,
        }
    }

    fn parse_order(value: &Value) -> Result<BrokerOrder> {
        let get_str = |key: &str| value.get(key).and_then(Value::as_str);

        let broker_order_id = get_str("order_id")
            .ok_or_else(|| StewardError::Internal("broker order missing order_id".to_string()))?
            .to_string();
        let symbol = get_str("symbol").unwrap_or_default().to_string();
        let side = match get_str("side").unwrap_or("BUY") {
            "SELL" => OrderSide::Sell,
            _ => OrderSide::Buy,
        };

        let decimal_at = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_f64().map(|f| f.to_string())))
                .and_then(|s| s.parse::<Decimal>().ok())
        };

        Ok(BrokerOrder {
            broker_order_id,
            symbol,
            side,
            qty: value.get("qty").and_then(Value::as_i64).unwrap_or(0),
            price: decimal_at("price"),
            status: Self::parse_status(get_str("status").unwrap_or("CANCELLED")),
            filled_qty: value.get("filled_qty").and_then(Value::as_i64).unwrap_or(0),
            avg_fill_price: decimal_at("avg_fill_price"),
            status_message: get_str("status_message").map(str::to_string),
            updated_at: get_str("updated_at").and_then(|s| s.parse().ok()),
        })
    }
}

#[async_trait::async_trait]
impl Broker for RestBroker {
    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        let body = json!({
            "client_order_id": request.client_order_id,
            "symbol": request.symbol,
            "side": request.side,
            "qty": request.requested_qty,
            "price": request.requested_price.map(|p| p.to_string()),
            "order_type": match request.kind {
                OrderKind::Market => "MARKET",
                OrderKind::Limit => "LIMIT",
            },
            "variety": match request.variety {
                Variety::Immediate => "regular",
                Variety::AfterHours => "amo",
            },
        });

        let payload = self.request_json(Method::POST, "/orders", Some(body)).await?;

        payload
            .get("order_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                StewardError::Internal("placement response missing order_id".to_string())
            })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<()> {
        self.request_json(Method::DELETE, &format!("/orders/{}", broker_order_id), None)
            .await?;
        Ok(())
    }

    async fn list_orders(&self) -> Result<Vec<BrokerOrder>> {
        let payload = self.request_json(Method::GET, "/orders", None).await?;

        payload
            .get("orders")
            .and_then(Value::as_array)
            .map(|orders| orders.iter().map(Self::parse_order).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder> {
        let payload = self
            .request_json(Method::GET, &format!("/orders/{}", broker_order_id), None)
            .await?;
        Self::parse_order(&payload)
    }

    async fn get_holdings(&self) -> Result<HashMap<String, i64>> {
        let payload = self.request_json(Method::GET, "/holdings", None).await?;

        let mut holdings = HashMap::new();
        if let Some(rows) = payload.get("holdings").and_then(Value::as_array) {
            for row in rows {
                let symbol = row.get("symbol").and_then(Value::as_str);
                let qty = row.get("qty").and_then(Value::as_i64);
                if let (Some(symbol), Some(qty)) = (symbol, qty) {
                    holdings.insert(symbol.to_string(), qty);
                }
            }
        }
        Ok(holdings)
    }

    async fn get_quote(&self, symbol: &str) -> Result<Decimal> {
        let payload = self
            .request_json(Method::GET, &format!("/quote/{}", symbol), None)
            .await?;

        payload
            .get("last_price")
            .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_f64().map(|f| f.to_string())))
            .and_then(|s| s.parse::<Decimal>().ok())
            .ok_or_else(|| {
                StewardError::Internal(format!("quote response missing last_price for {}", symbol))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_variants() {
        assert_eq!(RestBroker::parse_status("COMPLETE"), BrokerOrderStatus::Filled);
        assert_eq!(RestBroker::parse_status("open"), BrokerOrderStatus::Open);
        assert_eq!(
            RestBroker::parse_status("REJECTED"),
            BrokerOrderStatus::Rejected
        );
        assert_eq!(
            RestBroker::parse_status("TRIGGER PENDING"),
            BrokerOrderStatus::Open
        );
    }

    #[test]
    fn test_parse_order_payload() {
        let payload = json!({
            "order_id": "B-1001",
            "symbol": "ABC",
            "side": "SELL",
            "qty": 10,
            "price": "101.50",
            "status": "OPEN",
            "filled_qty": 0,
        });

        let order = RestBroker::parse_order(&payload).unwrap();
        assert_eq!(order.broker_order_id, "B-1001");
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.price.unwrap().to_string(), "101.50");
        assert_eq!(order.status, BrokerOrderStatus::Open);
    }

    #[test]
    fn test_parse_order_requires_id() {
        let payload = json!({ "symbol": "ABC" });
        assert!(RestBroker::parse_order(&payload).is_err());
    }
}
