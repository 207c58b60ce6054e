//! Placement flow: the boundary the signal producer feeds.
//!
//! Validates a request, records it as a pending order, and submits it to the
//! broker. The store's one-active-order-per-symbol constraint is the guard
//! against double submission; the verifier takes over from there.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::domain::{Order, OrderEvent, OrderRequest, OrderStatus};
use crate::error::{Result, StewardError};
use crate::store::OrderStore;

pub struct PlacementService {
    broker: Arc<dyn Broker>,
    store: Arc<dyn OrderStore>,
    events: broadcast::Sender<OrderEvent>,
}

impl PlacementService {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn OrderStore>,
        events: broadcast::Sender<OrderEvent>,
    ) -> Self {
        Self {
            broker,
            store,
            events,
        }
    }

    /// Place one order from the signal producer.
    ///
    /// The order row is created before the broker call so an unacknowledged
    /// placement is still visible to the verifier's grace-period check.
    pub async fn submit(&self, request: OrderRequest) -> Result<Order> {
        request.validate()?;

        let order = Order::from_request(&request);
        let mut order = self.store.insert(&order).await?;

        match self.broker.place_order(&request).await {
            Ok(broker_order_id) => {
                order.broker_order_id = Some(broker_order_id);
                self.store.update(&order, OrderStatus::Pending).await?;

                info!(
                    "Placed {} {} x{} as {}",
                    order.side,
                    order.symbol,
                    order.requested_qty,
                    order.broker_order_id.as_deref().unwrap_or("?")
                );
                let _ = self.events.send(OrderEvent::Placed {
                    symbol: order.symbol.clone(),
                    side: order.side,
                    qty: order.requested_qty,
                });
                Ok(order)
            }
            Err(StewardError::OrderRejected(reason)) => {
                order.transition(OrderStatus::Failed, Some(reason.clone()))?;
                self.store.update(&order, OrderStatus::Pending).await?;

                warn!("Placement for {} rejected: {}", order.symbol, reason);
                let _ = self.events.send(OrderEvent::Rejected {
                    symbol: order.symbol.clone(),
                    reason: reason.clone(),
                });
                Err(StewardError::OrderRejected(reason))
            }
            Err(e) if e.is_transient() => {
                // Leave the row pending and unacknowledged; the verifier
                // fails it after the grace period if the call never landed
                warn!("Placement for {} not acknowledged: {}", order.symbol, e);
                Ok(order)
            }
            Err(e) => Err(e),
        }
    }
}
