//! Typed lifecycle events emitted by the engine.
//!
//! Events flow over a broadcast channel so the notification dispatcher and
//! the tracking-scope updater consume them independently, decoupling polling
//! from side effects.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::OrderSide;

/// Counters aggregated for the daily summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCounters {
    pub placed: u64,
    pub executed: u64,
    pub rejected: u64,
    pub pending: u64,
}

/// Lifecycle event for one order, or the end-of-day summary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Placed {
        symbol: String,
        side: OrderSide,
        qty: i64,
    },
    Rejected {
        symbol: String,
        reason: String,
    },
    Executed {
        symbol: String,
        side: OrderSide,
        price: Decimal,
        qty: i64,
        time: DateTime<Utc>,
    },
    PartiallyFilled {
        symbol: String,
        qty: i64,
    },
    ManualOrderLinked {
        symbol: String,
        broker_order_id: String,
        qty: i64,
        price: Option<Decimal>,
    },
    EodSummary {
        counters: DailyCounters,
    },
}

impl OrderEvent {
    /// Symbol the event concerns, if any
    pub fn symbol(&self) -> Option<&str> {
        match self {
            OrderEvent::Placed { symbol, .. }
            | OrderEvent::Rejected { symbol, .. }
            | OrderEvent::Executed { symbol, .. }
            | OrderEvent::PartiallyFilled { symbol, .. }
            | OrderEvent::ManualOrderLinked { symbol, .. } => Some(symbol),
            OrderEvent::EodSummary { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_serialization_tags() {
        let event = OrderEvent::Executed {
            symbol: "ABC".to_string(),
            side: OrderSide::Buy,
            price: dec!(101.5),
            qty: 10,
            time: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "executed");
        assert_eq!(json["symbol"], "ABC");
    }

    #[test]
    fn test_eod_summary_has_no_symbol() {
        let event = OrderEvent::EodSummary {
            counters: DailyCounters::default(),
        };
        assert!(event.symbol().is_none());
    }
}
