use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StewardError};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Market,
    Limit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Market => write!(f, "MARKET"),
            OrderKind::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Order variety: immediate execution or queued outside trading hours for
/// the next session's open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variety {
    Immediate,
    AfterHours,
}

impl std::fmt::Display for Variety {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variety::Immediate => write!(f, "immediate"),
            Variety::AfterHours => write!(f, "after_hours"),
        }
    }
}

/// Order status (collapsed set; historical finer-grained statuses survive
/// only as `reason` text)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Submitted to the broker, awaiting execution
    Pending,
    /// Buy executed, position held
    Ongoing,
    /// Placement failed or broker rejected; eligible for retry
    Failed,
    /// Cancelled (stale, expired, or by request)
    Cancelled,
    /// Position exited or order force-closed by reconciliation
    Closed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Closed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal transitions of the order state machine. Terminal states have
    /// no outgoing edges.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Pending => matches!(next, Ongoing | Failed | Cancelled | Closed),
            // Failed -> Ongoing/Closed covers linking a manual order that
            // already filled; Failed -> Cancelled covers expiry.
            Failed => matches!(next, Pending | Ongoing | Closed | Cancelled),
            Ongoing => matches!(next, Closed),
            Cancelled | Closed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ongoing => "ongoing",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "ongoing" => Ok(OrderStatus::Ongoing),
            "failed" => Ok(OrderStatus::Failed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "closed" => Ok(OrderStatus::Closed),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Order request (what the signal producer asks for)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub requested_qty: i64,
    /// None for market orders
    pub requested_price: Option<Decimal>,
    pub kind: OrderKind,
    pub variety: Variety,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, qty: i64) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            requested_qty: qty,
            requested_price: None,
            kind: OrderKind::Market,
            variety: Variety::Immediate,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, qty: i64, price: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            requested_qty: qty,
            requested_price: Some(price),
            kind: OrderKind::Limit,
            variety: Variety::Immediate,
        }
    }

    /// Validate before anything reaches the broker
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(StewardError::Validation("symbol must not be empty".to_string()));
        }
        if self.requested_qty <= 0 {
            return Err(StewardError::Validation(format!(
                "quantity must be positive, got {}",
                self.requested_qty
            )));
        }
        match (self.kind, self.requested_price) {
            (OrderKind::Limit, None) => Err(StewardError::Validation(
                "limit orders require a price".to_string(),
            )),
            (_, Some(price)) if price <= Decimal::ZERO => Err(StewardError::Validation(format!(
                "price must be positive, got {}",
                price
            ))),
            _ => Ok(()),
        }
    }
}

/// Order tracked by the engine: one row per placement-attempt lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Option<i64>,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub requested_qty: i64,
    pub requested_price: Option<Decimal>,
    pub kind: OrderKind,
    pub variety: Variety,
    /// None until the broker acknowledges placement
    pub broker_order_id: Option<String>,
    pub status: OrderStatus,
    pub retry_count: u32,
    pub first_failed_at: Option<DateTime<Utc>>,
    pub last_retry_attempt: Option<DateTime<Utc>>,
    /// Free-text cause of the current state
    pub reason: Option<String>,
    pub execution_price: Option<Decimal>,
    pub execution_qty: Option<i64>,
    pub execution_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn from_request(request: &OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            requested_qty: request.requested_qty,
            requested_price: request.requested_price,
            kind: request.kind,
            variety: request.variety,
            broker_order_id: None,
            status: OrderStatus::Pending,
            retry_count: 0,
            first_failed_at: None,
            last_retry_attempt: None,
            reason: None,
            execution_price: None,
            execution_qty: None,
            execution_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a state transition, enforcing the machine. The store still
    /// checks the optimistic precondition on write; this guards callers
    /// from constructing illegal updates in the first place.
    pub fn transition(&mut self, next: OrderStatus, reason: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(StewardError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == OrderStatus::Failed && self.first_failed_at.is_none() {
            self.first_failed_at = Some(Utc::now());
        }
        self.status = next;
        if reason.is_some() {
            self.reason = reason;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a fill. Buys move to Ongoing (position held), sells to Closed.
    pub fn record_execution(
        &mut self,
        price: Decimal,
        qty: i64,
        time: DateTime<Utc>,
    ) -> Result<()> {
        let next = match self.side {
            OrderSide::Buy => OrderStatus::Ongoing,
            OrderSide::Sell => OrderStatus::Closed,
        };
        self.transition(next, None)?;
        self.execution_price = Some(price);
        self.execution_qty = Some(qty);
        self.execution_time = Some(time);
        Ok(())
    }
}
