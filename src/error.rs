use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum StewardError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Broker could not be reached or timed out. Transient: the owning loop
    /// retries on its next cycle and no local state is changed.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Broker rejected the order. Terminal for the attempt; the reason is
    /// captured verbatim from the broker response.
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// Quantity or price failed validation and was never submitted.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A matching order already exists; submission was skipped and the
    /// existing order should be linked instead.
    #[error("Duplicate order detected: {0}")]
    DuplicateOrderDetected(String),

    /// Optimistic-concurrency conflict: the order's status changed between
    /// the caller's read and write. The caller must re-read and retry its
    /// own decision.
    #[error("Stale write on order {order_id}: expected status {expected}, found {found}")]
    StaleWrite {
        order_id: String,
        expected: String,
        found: String,
    },

    /// Broker and local state disagree in a way that maps to no known
    /// classification. Flagged for manual review, never auto-resolved.
    #[error("Reconciliation conflict for {symbol}: {detail}")]
    ReconciliationConflict { symbol: String, detail: String },

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl StewardError {
    /// Transient errors leave no mark on the order store; the owning loop
    /// simply retries next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, StewardError::BrokerUnavailable(_) | StewardError::Http(_))
    }
}

/// Result type alias for StewardError
pub type Result<T> = std::result::Result<T, StewardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StewardError::BrokerUnavailable("timeout".to_string()).is_transient());
        assert!(!StewardError::OrderRejected("insufficient funds".to_string()).is_transient());
        assert!(!StewardError::Validation("qty must be positive".to_string()).is_transient());
    }

    #[test]
    fn test_stale_write_display() {
        let err = StewardError::StaleWrite {
            order_id: "42".to_string(),
            expected: "failed".to_string(),
            found: "pending".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Stale write on order 42: expected status failed, found pending"
        );
    }
}
