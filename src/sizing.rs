//! Capital-based position sizing.
//!
//! Retry attempts never reuse the originally requested quantity; the target
//! is recomputed from the configured capital-per-trade and the current quote,
//! so the quantity may rise or fall versus the failed attempt.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{Result, StewardError};

/// Computes order quantities from a fixed capital allocation per trade
#[derive(Debug, Clone)]
pub struct CapitalAllocator {
    capital_per_trade: Decimal,
}

impl CapitalAllocator {
    pub fn new(capital_per_trade: Decimal) -> Self {
        Self { capital_per_trade }
    }

    /// Largest whole quantity purchasable at `price` with the per-trade
    /// capital. Rejects inputs that could never produce a valid order.
    pub fn quantity_for(&self, price: Decimal) -> Result<i64> {
        if self.capital_per_trade <= Decimal::ZERO {
            return Err(StewardError::Validation(format!(
                "capital per trade must be positive, got {}",
                self.capital_per_trade
            )));
        }
        if price <= Decimal::ZERO {
            return Err(StewardError::Validation(format!(
                "price must be positive, got {}",
                price
            )));
        }

        let qty = (self.capital_per_trade / price)
            .floor()
            .to_i64()
            .unwrap_or(0);

        if qty <= 0 {
            return Err(StewardError::Validation(format!(
                "capital {} buys zero shares at price {}",
                self.capital_per_trade, price
            )));
        }

        Ok(qty)
    }
}
