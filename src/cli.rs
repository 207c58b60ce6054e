use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "steward", about = "Brokerage order lifecycle and reconciliation engine")]
pub struct Cli {
    /// Config directory (default: ./config)
    #[arg(long, default_value = "config")]
    pub config_dir: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine: status-verifier loop plus event consumers
    Run,
    /// Verify a single order against the broker right now
    Verify {
        /// Local order id
        order_id: i64,
    },
    /// Run one retry pass over failed orders
    Retry,
    /// Run one reconciliation pass against broker holdings
    Reconcile,
    /// Run the end-of-day sweep
    Eod,
    /// Show non-terminal orders and the tracking scope
    Status,
}
