pub mod broker;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod hours;
pub mod notify;
pub mod placement;
pub mod services;
pub mod sizing;
pub mod store;

pub use broker::{Broker, BrokerOrder, BrokerOrderStatus, RestBroker, SimBroker};
pub use config::AppConfig;
pub use domain::{
    DailyCounters, Order, OrderEvent, OrderKind, OrderRequest, OrderSide, OrderStatus,
    ReconciliationOutcome, ReconciliationReport, TrackingScopeEntry, Variety,
};
pub use error::{Result, StewardError};
pub use hours::TradingCalendar;
pub use placement::PlacementService;
pub use services::{
    EodConfig, EodOrchestrator, EodReport, ReconciliationEngine, RetryEngine, RetryReport,
    StatusVerifier, SymbolLocks, VerifierConfig,
};
pub use sizing::CapitalAllocator;
pub use store::{MemoryStore, OrderStore, PostgresStore};
