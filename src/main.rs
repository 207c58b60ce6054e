use clap::Parser;
use std::sync::Arc;
use steward::cli::{Cli, Commands};
use steward::config::AppConfig;
use steward::error::{Result, StewardError};
use steward::notify::{LogNotifier, Notifier, WebhookNotifier};
use steward::services::{
    spawn_notification_dispatcher, spawn_scope_updater, EodConfig, EodOrchestrator,
    ReconciliationEngine, RetryEngine, StatusVerifier, SymbolLocks, VerifierConfig,
};
use steward::{
    Broker, CapitalAllocator, MemoryStore, OrderEvent, OrderStore, PostgresStore, RestBroker,
    SimBroker, TradingCalendar,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Everything the subcommands share
struct Context {
    broker: Arc<dyn Broker>,
    store: Arc<dyn OrderStore>,
    events: broadcast::Sender<OrderEvent>,
    locks: Arc<SymbolLocks>,
    config: AppConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)?;
    init_logging(&config);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("config error: {}", error);
        }
        return Err(StewardError::Internal(format!(
            "invalid configuration ({} errors)",
            errors.len()
        )));
    }

    let ctx = build_context(config).await?;

    match cli.command {
        Commands::Run => run_engine(&ctx).await?,
        Commands::Verify { order_id } => {
            let verifier = make_verifier(&ctx);
            let order = verifier.verify_order(order_id).await?;
            println!(
                "order {} [{}] {} x{} -> {}",
                order_id,
                order.symbol,
                order.side,
                order.requested_qty,
                order.status
            );
        }
        Commands::Retry => {
            let retry = RetryEngine::new(
                ctx.broker.clone(),
                ctx.store.clone(),
                ctx.events.clone(),
                CapitalAllocator::new(ctx.config.capital.per_trade),
                calendar(&ctx.config)?,
            );
            let report = retry.run_once().await?;
            println!(
                "retry: examined={}, expired={}, linked={}, retried={}, still_failed={}",
                report.examined,
                report.expired,
                report.manual_linked,
                report.retried,
                report.still_failed
            );
        }
        Commands::Reconcile => {
            let engine =
                ReconciliationEngine::new(ctx.broker.clone(), ctx.store.clone(), ctx.locks.clone());
            let report = engine.run_once().await?;
            println!("{}", report.summary());
        }
        Commands::Eod => {
            let report = make_eod(&ctx).run_once().await;
            println!(
                "eod: {} completed, {} failed",
                report.steps_completed, report.steps_failed
            );
            for step in &report.steps {
                match &step.error {
                    Some(error) => println!("  {} ({}ms): FAILED {}", step.name, step.duration_ms, error),
                    None => println!("  {} ({}ms): ok", step.name, step.duration_ms),
                }
            }
        }
        Commands::Status => {
            for order in ctx.store.list_non_terminal().await? {
                println!(
                    "order {} [{}] {} x{} {} (retries: {})",
                    order.id.unwrap_or_default(),
                    order.symbol,
                    order.side,
                    order.requested_qty,
                    order.status,
                    order.retry_count
                );
            }
            for entry in ctx.store.list_scope().await? {
                println!(
                    "scope {}: tracked {}, pre-existing {}",
                    entry.symbol, entry.system_tracked_qty, entry.pre_existing_qty
                );
            }
        }
    }

    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match &config.logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "steward.log");
            if config.logging.json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(appender)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(appender)
                    .with_ansi(false)
                    .init();
            }
        }
        None if config.logging.json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

async fn build_context(config: AppConfig) -> Result<Context> {
    let (events, _) = broadcast::channel(256);
    let locks = Arc::new(SymbolLocks::new());

    let (broker, store): (Arc<dyn Broker>, Arc<dyn OrderStore>) = if config.dry_run.enabled {
        info!("Dry run: simulated broker and in-memory store");
        (Arc::new(SimBroker::new()), Arc::new(MemoryStore::new()))
    } else {
        let store = PostgresStore::new(&config.database.url, config.database.max_connections).await?;
        store.migrate().await?;
        let broker = RestBroker::from_env(&config.broker.rest_url, config.broker.timeout_ms)?;
        (Arc::new(broker), Arc::new(store))
    };

    Ok(Context {
        broker,
        store,
        events,
        locks,
        config,
    })
}

fn calendar(config: &AppConfig) -> Result<TradingCalendar> {
    TradingCalendar::from_config(&config.session.open, &config.session.close).ok_or_else(|| {
        StewardError::Validation("session open/close must be HH:MM".to_string())
    })
}

fn make_verifier(ctx: &Context) -> StatusVerifier {
    StatusVerifier::new(
        ctx.broker.clone(),
        ctx.store.clone(),
        ctx.events.clone(),
        VerifierConfig {
            poll_interval_secs: ctx.config.engine.verify_interval_secs,
            placement_grace_secs: ctx.config.engine.placement_grace_secs,
        },
    )
}

fn make_eod(ctx: &Context) -> EodOrchestrator {
    let verifier = Arc::new(make_verifier(ctx));
    let reconciler = Arc::new(ReconciliationEngine::new(
        ctx.broker.clone(),
        ctx.store.clone(),
        ctx.locks.clone(),
    ));
    EodOrchestrator::new(
        ctx.broker.clone(),
        ctx.store.clone(),
        verifier,
        reconciler,
        ctx.events.clone(),
        EodConfig {
            stale_after_hours: ctx.config.engine.stale_after_hours,
            retention_days: ctx.config.engine.retention_days,
        },
    )
}

async fn run_engine(ctx: &Context) -> Result<()> {
    let notifier: Arc<dyn Notifier> = match &ctx.config.notifications.webhook_url {
        Some(url) => WebhookNotifier::new(url.clone()),
        None => WebhookNotifier::from_env()
            .map(|n| n as Arc<dyn Notifier>)
            .unwrap_or_else(|| Arc::new(LogNotifier)),
    };

    let dispatcher = spawn_notification_dispatcher(notifier, ctx.events.subscribe());
    let scope_updater = spawn_scope_updater(
        ctx.store.clone(),
        ctx.broker.clone(),
        ctx.locks.clone(),
        ctx.events.subscribe(),
    );

    let verifier = make_verifier(ctx);
    verifier.start().await;
    info!("Engine running; Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(StewardError::Io)?;
    warn!("Shutdown requested, finishing in-flight verifier cycle");

    verifier.stop().await;
    dispatcher.abort();
    scope_updater.abort();

    info!("Engine stopped");
    Ok(())
}
