pub mod events;
pub mod order;
pub mod tracking;

pub use events::{DailyCounters, OrderEvent};
pub use order::{Order, OrderKind, OrderRequest, OrderSide, OrderStatus, Variety};
pub use tracking::{
    ReconciliationOutcome, ReconciliationReport, SymbolReconciliation, TrackingScopeEntry,
};
