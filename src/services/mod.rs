pub mod dispatcher;
pub mod eod;
pub mod locks;
pub mod reconciliation;
pub mod retry;
pub mod verifier;

pub use dispatcher::{format_event, spawn_notification_dispatcher, spawn_scope_updater};
pub use eod::{EodConfig, EodOrchestrator, EodReport, StepReport};
pub use locks::SymbolLocks;
pub use reconciliation::ReconciliationEngine;
pub use retry::{RetryEngine, RetryReport};
pub use verifier::{StatusVerifier, VerifierConfig, VerifierStats};
