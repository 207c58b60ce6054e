//! Tracking scope: the set of symbols and quantities this engine considers
//! itself responsible for, and the outcome types of a reconciliation pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per symbol the engine is responsible for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingScopeEntry {
    pub symbol: String,
    /// Quantity this engine believes it owns
    pub system_tracked_qty: i64,
    /// Quantity held before this engine started tracking the symbol,
    /// frozen at scope-creation time
    pub pre_existing_qty: i64,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl TrackingScopeEntry {
    pub fn new(symbol: impl Into<String>, system_tracked_qty: i64, pre_existing_qty: i64) -> Self {
        Self {
            symbol: symbol.into(),
            system_tracked_qty,
            pre_existing_qty,
            last_reconciled_at: None,
        }
    }

    /// Quantity the broker should be holding for this symbol
    pub fn expected_qty(&self) -> i64 {
        self.system_tracked_qty + self.pre_existing_qty
    }
}

/// Classification of one symbol in a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    /// Broker and local quantities agree
    Matched,
    /// Broker holds more than expected; a buy happened outside this engine
    ManualBuyDetected,
    /// Broker holds less than expected but not zero
    ManualSellDetected,
    /// Broker quantity reached zero; scope entry removed
    PositionClosed,
    /// Unclassifiable disagreement, flagged for manual review
    Conflict,
}

impl std::fmt::Display for ReconciliationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::ManualBuyDetected => write!(f, "manual_buy_detected"),
            Self::ManualSellDetected => write!(f, "manual_sell_detected"),
            Self::PositionClosed => write!(f, "position_closed"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// Per-symbol result of one reconciliation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolReconciliation {
    pub symbol: String,
    pub outcome: ReconciliationOutcome,
    pub expected_qty: i64,
    pub broker_qty: i64,
    /// Signed quantity delta applied to `system_tracked_qty`
    pub delta_applied: i64,
}

/// Transient output of one reconciliation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub started_at: Option<DateTime<Utc>>,
    pub symbols: Vec<SymbolReconciliation>,
    pub matched: usize,
    pub manual_buys: usize,
    pub manual_sells: usize,
    pub positions_closed: usize,
    pub conflicts: usize,
}

impl ReconciliationReport {
    pub fn record(&mut self, entry: SymbolReconciliation) {
        match entry.outcome {
            ReconciliationOutcome::Matched => self.matched += 1,
            ReconciliationOutcome::ManualBuyDetected => self.manual_buys += 1,
            ReconciliationOutcome::ManualSellDetected => self.manual_sells += 1,
            ReconciliationOutcome::PositionClosed => self.positions_closed += 1,
            ReconciliationOutcome::Conflict => self.conflicts += 1,
        }
        self.symbols.push(entry);
    }

    pub fn has_conflicts(&self) -> bool {
        self.conflicts > 0
    }

    /// Human-readable summary with counts per category
    pub fn summary(&self) -> String {
        format!(
            "reconciled {} symbols: {} matched, {} manual buys, {} manual sells, {} closed, {} conflicts",
            self.symbols.len(),
            self.matched,
            self.manual_buys,
            self.manual_sells,
            self.positions_closed,
            self.conflicts
        )
    }
}
