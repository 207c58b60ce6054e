//! Event consumers.
//!
//! Two independent subscribers drain the broadcast channel: the notification
//! dispatcher formats events and forwards them to the configured sink, and
//! the scope updater maintains `system_tracked_qty` as executions land. The
//! polling loops never call either directly.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::broker::Broker;
use crate::domain::{OrderEvent, OrderSide, TrackingScopeEntry};
use crate::notify::Notifier;
use crate::services::locks::SymbolLocks;
use crate::store::OrderStore;

/// Render an event as notification text
pub fn format_event(event: &OrderEvent) -> String {
    match event {
        OrderEvent::Placed { symbol, side, qty } => {
            format!("Order placed: {} {} x{}", side, symbol, qty)
        }
        OrderEvent::Rejected { symbol, reason } => {
            format!("Order rejected: {} ({})", symbol, reason)
        }
        OrderEvent::Executed {
            symbol,
            side,
            price,
            qty,
            ..
        } => format!("Order executed: {} {} x{} @ {}", side, symbol, qty, price),
        OrderEvent::PartiallyFilled { symbol, qty } => {
            format!("Order partially filled: {} ({} so far)", symbol, qty)
        }
        OrderEvent::ManualOrderLinked {
            symbol,
            broker_order_id,
            qty,
            price,
        } => format!(
            "Manual order linked: {} x{} ({}{})",
            symbol,
            qty,
            broker_order_id,
            price
                .map(|p| format!(" @ {}", p))
                .unwrap_or_default()
        ),
        OrderEvent::EodSummary { counters } => format!(
            "EOD summary: {} placed, {} executed, {} rejected, {} pending",
            counters.placed, counters.executed, counters.rejected, counters.pending
        ),
    }
}

/// Forward every event to the notification sink
pub fn spawn_notification_dispatcher(
    notifier: Arc<dyn Notifier>,
    mut events: broadcast::Receiver<OrderEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let text = format_event(&event);
                    if let Err(e) = notifier.send(&text).await {
                        error!("Notification delivery failed: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Notification dispatcher lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Notification dispatcher stopped");
    })
}

/// Keep the tracking scope in step with executions.
///
/// A buy execution raises `system_tracked_qty` (creating the scope entry on
/// the first fill for a symbol, with the pre-existing broker quantity frozen
/// at that moment); a sell execution lowers it, floored at zero, and removes
/// the entry once nothing tracked or pre-existing remains.
pub fn spawn_scope_updater(
    store: Arc<dyn OrderStore>,
    broker: Arc<dyn Broker>,
    locks: Arc<SymbolLocks>,
    mut events: broadcast::Receiver<OrderEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(OrderEvent::Executed {
                    symbol, side, qty, ..
                }) => {
                    if let Err(e) =
                        apply_execution(&*store, &*broker, &locks, &symbol, side, qty).await
                    {
                        error!("Scope update for {} failed: {}", symbol, e);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Scope updater lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Scope updater stopped");
    })
}

async fn apply_execution(
    store: &dyn OrderStore,
    broker: &dyn Broker,
    locks: &SymbolLocks,
    symbol: &str,
    side: OrderSide,
    qty: i64,
) -> crate::error::Result<()> {
    let _guard = locks.acquire(symbol).await;

    match (store.get_scope(symbol).await?, side) {
        (Some(mut entry), OrderSide::Buy) => {
            entry.system_tracked_qty += qty;
            store.upsert_scope(&entry).await?;
            debug!(
                "Scope {}: tracked quantity now {}",
                symbol, entry.system_tracked_qty
            );
        }
        (Some(mut entry), OrderSide::Sell) => {
            entry.system_tracked_qty = (entry.system_tracked_qty - qty).max(0);
            if entry.system_tracked_qty == 0 && entry.pre_existing_qty == 0 {
                store.delete_scope(symbol).await?;
                debug!("Scope {}: position fully closed, entry removed", symbol);
            } else {
                store.upsert_scope(&entry).await?;
            }
        }
        (None, OrderSide::Buy) => {
            // First fill for this symbol: freeze whatever was already held
            // outside the engine before this execution
            let pre_existing = match broker.get_holdings().await {
                Ok(holdings) => (holdings.get(symbol).copied().unwrap_or(0) - qty).max(0),
                Err(e) => {
                    warn!(
                        "Holdings unavailable while creating scope for {}: {}",
                        symbol, e
                    );
                    0
                }
            };
            store
                .upsert_scope(&TrackingScopeEntry::new(symbol, qty, pre_existing))
                .await?;
            debug!(
                "Scope {} created: tracked {}, pre-existing {}",
                symbol, qty, pre_existing
            );
        }
        (None, OrderSide::Sell) => {
            warn!("Sell execution for untracked symbol {}", symbol);
        }
    }

    Ok(())
}
