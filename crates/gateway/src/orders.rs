//! Order records, status merging, cancellation, retention GC.
//!
//! The manager owns every order record and is the single writer to the
//! order routing map. Orders are never queued across reconnects: a placement
//! while the session is down is rejected outright. Terminal orders are kept
//! for audit and garbage-collected after the retention window.

use std::sync::Arc;
use std::time::Duration;

use common::upstream::{OrderKind, Side, UpstreamRequest};
use common::{unix_now, ClientId, IdAllocator, Instrument, OrderId};
use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, info, warn};
use upstream::{SessionError, SessionHandle};

use crate::error::CommandError;
use crate::protocol::PlaceOrderParams;
use crate::routing::RoutingTables;

/// How often the retention sweep runs.
pub const GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    PendingSubmit,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }

    /// Map a vendor status string. Unknown statuses leave the state
    /// unchanged; the raw string is still forwarded to the client.
    pub fn from_vendor(status: &str, filled: f64, remaining: f64) -> Option<OrderState> {
        match status {
            "PendingSubmit" | "ApiPending" | "PendingCancel" => Some(OrderState::PendingSubmit),
            "PreSubmitted" | "Submitted" => {
                if filled > 0.0 && remaining > 0.0 {
                    Some(OrderState::PartiallyFilled)
                } else {
                    Some(OrderState::Submitted)
                }
            }
            "Filled" => Some(OrderState::Filled),
            "Cancelled" | "ApiCancelled" => Some(OrderState::Cancelled),
            "Inactive" => Some(OrderState::Rejected),
            _ => None,
        }
    }
}

/// A single order, kept for the lifetime of the process (bounded by GC).
#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: OrderId,
    pub client_id: ClientId,
    pub instrument: Instrument,
    pub side: Side,
    pub qty: i64,
    pub kind: OrderKind,
    pub price: Option<f64>,
    pub state: OrderState,
    pub filled_qty: f64,
    pub remaining_qty: f64,
    pub avg_fill_price: Option<f64>,
    pub last_fill_price: Option<f64>,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Owns all order records.
pub struct OrderManager {
    orders: DashMap<OrderId, Order>,
    routing: Arc<RoutingTables>,
    ids: Arc<IdAllocator>,
    session: SessionHandle,
    retention: Duration,
}

impl OrderManager {
    pub fn new(
        routing: Arc<RoutingTables>,
        ids: Arc<IdAllocator>,
        session: SessionHandle,
        retention: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            orders: DashMap::new(),
            routing,
            ids,
            session,
            retention,
        })
    }

    /// Validate and submit an order.
    pub async fn place(
        &self,
        client_id: ClientId,
        params: PlaceOrderParams,
    ) -> Result<OrderId, CommandError> {
        if params.quantity <= 0 {
            return Err(CommandError::BadRequest(
                "quantity must be a positive integer".to_string(),
            ));
        }
        match params.price {
            Some(price) if price <= 0.0 => {
                return Err(CommandError::BadRequest(
                    "price must be positive".to_string(),
                ));
            }
            None if params.order_type.requires_price() => {
                return Err(CommandError::BadRequest(format!(
                    "price is required for {:?} orders",
                    params.order_type
                )));
            }
            _ => {}
        }
        let instrument = params.instrument()?;

        let order_id = self.ids.next_order_id();
        let now = unix_now();
        let order = Order {
            order_id,
            client_id,
            instrument: instrument.clone(),
            side: params.action,
            qty: params.quantity,
            kind: params.order_type,
            price: params.price,
            state: OrderState::PendingSubmit,
            filled_qty: 0.0,
            remaining_qty: params.quantity as f64,
            avg_fill_price: None,
            last_fill_price: None,
            created_at: now,
            updated_at: now,
        };
        // Record before the send so the first status event is routable.
        self.orders.insert(order_id, order);
        self.routing.insert_order(order_id, client_id);

        let request = UpstreamRequest::PlaceOrder {
            order_id,
            instrument,
            side: params.action,
            quantity: params.quantity,
            kind: params.order_type,
            price: params.price,
        };
        match self.session.send(request).await {
            Ok(()) => {
                counter!("bridge_orders_placed_total").increment(1);
                info!(order_id, %client_id, side = ?params.action, qty = params.quantity, "order placed");
                Ok(order_id)
            }
            Err(e) => {
                // Orders never queue across reconnects.
                self.orders.remove(&order_id);
                self.routing.remove_order(order_id);
                warn!(order_id, error = %e, "order rejected, upstream unavailable");
                Err(match e {
                    SessionError::NotReady | SessionError::Closed | SessionError::Failed => {
                        CommandError::NotConnected
                    }
                    _ => CommandError::Timeout,
                })
            }
        }
    }

    /// Cancel an order. Accepted only from the owning client while the
    /// order is non-terminal.
    pub async fn cancel(&self, client_id: ClientId, order_id: OrderId) -> Result<(), CommandError> {
        {
            let Some(order) = self.orders.get(&order_id) else {
                return Err(CommandError::NotFound);
            };
            if order.client_id != client_id {
                return Err(CommandError::NotOwned);
            }
            if order.state.is_terminal() {
                return Err(CommandError::Terminal);
            }
        }
        self.session
            .send(UpstreamRequest::CancelOrder { order_id })
            .await?;
        info!(order_id, %client_id, "order cancel requested");
        Ok(())
    }

    /// Merge an upstream status update: state follows the latest event,
    /// filled quantity is monotone, remaining tracks the update verbatim.
    /// Returns the owning client so the event can be forwarded.
    pub fn apply_status(
        &self,
        order_id: OrderId,
        status: &str,
        filled: f64,
        remaining: f64,
        avg_fill_price: Option<f64>,
        last_fill_price: Option<f64>,
    ) -> Option<ClientId> {
        let client_id = self.routing.client_for_order(order_id)?;
        if let Some(mut order) = self.orders.get_mut(&order_id) {
            if let Some(state) = OrderState::from_vendor(status, filled, remaining) {
                order.state = state;
            }
            order.filled_qty = order.filled_qty.max(filled);
            order.remaining_qty = remaining;
            if avg_fill_price.is_some() {
                order.avg_fill_price = avg_fill_price;
            }
            if last_fill_price.is_some() {
                order.last_fill_price = last_fill_price;
            }
            order.updated_at = unix_now();
        }
        Some(client_id)
    }

    pub fn get(&self, order_id: OrderId) -> Option<Order> {
        self.orders.get(&order_id).map(|order| order.clone())
    }

    /// Owning client of an order, without touching its state.
    pub fn owner(&self, order_id: OrderId) -> Option<ClientId> {
        self.routing.client_for_order(order_id)
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Drop terminal orders older than the retention window.
    pub fn collect_garbage(&self, now: f64) {
        let cutoff = now - self.retention.as_secs_f64();
        let stale: Vec<OrderId> = self
            .orders
            .iter()
            .filter(|order| order.state.is_terminal() && order.updated_at < cutoff)
            .map(|order| order.order_id)
            .collect();
        for order_id in &stale {
            self.orders.remove(order_id);
            self.routing.remove_order(*order_id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "collected terminal orders");
        }
    }
}

/// Periodic retention sweep. Owned by the supervisor.
pub async fn retention_sweeper(manager: Arc<OrderManager>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        manager.collect_garbage(unix_now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use upstream::testing::manual_handle;
    use upstream::SessionPhase;
    use uuid::Uuid;

    struct Fixture {
        manager: Arc<OrderManager>,
        ids: Arc<IdAllocator>,
        requests: mpsc::Receiver<UpstreamRequest>,
        phase: tokio::sync::watch::Sender<SessionPhase>,
    }

    fn fixture() -> Fixture {
        let (handle, requests, phase) = manual_handle(64, Duration::from_secs(5));
        let routing = Arc::new(RoutingTables::new());
        let ids = Arc::new(IdAllocator::new());
        let manager = OrderManager::new(routing, ids.clone(), handle, Duration::from_secs(86_400));
        Fixture {
            manager,
            ids,
            requests,
            phase,
        }
    }

    fn limit_buy(symbol: &str, qty: i64, price: f64) -> PlaceOrderParams {
        serde_json::from_value(serde_json::json!({
            "symbol": symbol,
            "action": "BUY",
            "quantity": qty,
            "order_type": "LMT",
            "price": price,
            "instrument_type": "stock",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn placement_allocates_above_the_handshake_floor() {
        let mut fx = fixture();
        fx.ids.observe_order_id_floor(1001);
        let client = Uuid::new_v4();

        let order_id = fx
            .manager
            .place(client, limit_buy("AAPL", 100, 150.0))
            .await
            .unwrap();
        assert_eq!(order_id, 1001);

        let order = fx.manager.get(order_id).unwrap();
        assert_eq!(order.state, OrderState::PendingSubmit);
        assert_eq!(order.remaining_qty, 100.0);

        match fx.requests.recv().await.unwrap() {
            UpstreamRequest::PlaceOrder {
                order_id, quantity, kind, price, ..
            } => {
                assert_eq!(order_id, 1001);
                assert_eq!(quantity, 100);
                assert_eq!(kind, OrderKind::Limit);
                assert_eq!(price, Some(150.0));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_rejects_bad_quantities_and_prices() {
        let fx = fixture();
        let client = Uuid::new_v4();

        let err = fx
            .manager
            .place(client, limit_buy("AAPL", 0, 150.0))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::BadRequest(_)));

        let mut params = limit_buy("AAPL", 100, 150.0);
        params.price = None;
        let err = fx.manager.place(client, params).await.unwrap_err();
        assert!(matches!(err, CommandError::BadRequest(_)));

        let mut params = limit_buy("AAPL", 100, 150.0);
        params.price = Some(-1.0);
        let err = fx.manager.place(client, params).await.unwrap_err();
        assert!(matches!(err, CommandError::BadRequest(_)));

        assert_eq!(fx.manager.order_count(), 0);
    }

    #[tokio::test]
    async fn placement_while_disconnected_is_rejected_not_queued() {
        let fx = fixture();
        fx.phase.send(SessionPhase::Reconnecting).unwrap();
        let client = Uuid::new_v4();

        let err = fx
            .manager
            .place(client, limit_buy("AAPL", 100, 150.0))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::NotConnected);
        assert_eq!(fx.manager.order_count(), 0, "no record survives a reject");
    }

    #[tokio::test]
    async fn status_merge_is_a_monotone_fold() {
        let fx = fixture();
        fx.ids.observe_order_id_floor(1001);
        let client = Uuid::new_v4();
        let order_id = fx
            .manager
            .place(client, limit_buy("AAPL", 100, 150.0))
            .await
            .unwrap();

        fx.manager
            .apply_status(order_id, "Submitted", 0.0, 100.0, None, None);
        assert_eq!(fx.manager.get(order_id).unwrap().state, OrderState::Submitted);

        fx.manager
            .apply_status(order_id, "Submitted", 40.0, 60.0, Some(150.0), Some(150.0));
        let order = fx.manager.get(order_id).unwrap();
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.filled_qty, 40.0);
        assert_eq!(order.remaining_qty, 60.0);

        // A stale, lower fill count must not regress the fold.
        fx.manager
            .apply_status(order_id, "Submitted", 10.0, 60.0, None, None);
        assert_eq!(fx.manager.get(order_id).unwrap().filled_qty, 40.0);

        fx.manager
            .apply_status(order_id, "Filled", 100.0, 0.0, Some(150.0), Some(150.0));
        let order = fx.manager.get(order_id).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.filled_qty, 100.0);
        assert_eq!(order.remaining_qty, 0.0);
        assert_eq!(order.avg_fill_price, Some(150.0));

        // Unknown vendor status: state sticks, quantities still merge.
        fx.manager
            .apply_status(order_id, "SomethingNew", 100.0, 0.0, None, None);
        assert_eq!(fx.manager.get(order_id).unwrap().state, OrderState::Filled);
    }

    #[tokio::test]
    async fn cancel_enforces_ownership_and_liveness() {
        let mut fx = fixture();
        fx.ids.observe_order_id_floor(2001);
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let order_id = fx
            .manager
            .place(owner, limit_buy("AAPL", 10, 5.0))
            .await
            .unwrap();
        let _ = fx.requests.recv().await;

        assert_eq!(
            fx.manager.cancel(intruder, order_id).await.unwrap_err(),
            CommandError::NotOwned
        );
        assert_eq!(
            fx.manager.cancel(owner, 9999).await.unwrap_err(),
            CommandError::NotFound
        );
        assert!(
            fx.requests.try_recv().is_err(),
            "rejected cancels send nothing upstream"
        );

        fx.manager.cancel(owner, order_id).await.unwrap();
        assert!(matches!(
            fx.requests.recv().await.unwrap(),
            UpstreamRequest::CancelOrder { order_id: id } if id == order_id
        ));

        fx.manager
            .apply_status(order_id, "Cancelled", 0.0, 10.0, None, None);
        assert_eq!(
            fx.manager.cancel(owner, order_id).await.unwrap_err(),
            CommandError::Terminal
        );
    }

    #[tokio::test]
    async fn gc_reaps_only_old_terminal_orders() {
        let fx = fixture();
        fx.ids.observe_order_id_floor(3001);
        let client = Uuid::new_v4();
        let done = fx
            .manager
            .place(client, limit_buy("AAPL", 1, 1.0))
            .await
            .unwrap();
        let live = fx
            .manager
            .place(client, limit_buy("MSFT", 1, 1.0))
            .await
            .unwrap();
        fx.manager.apply_status(done, "Filled", 1.0, 0.0, None, None);

        // Nothing is old enough yet.
        fx.manager.collect_garbage(unix_now());
        assert_eq!(fx.manager.order_count(), 2);

        // A sweep far in the future reaps the filled order only.
        fx.manager.collect_garbage(unix_now() + 100_000.0);
        assert_eq!(fx.manager.order_count(), 1);
        assert!(fx.manager.get(done).is_none());
        assert!(fx.manager.get(live).is_some());
    }

    #[test]
    fn vendor_status_mapping_covers_partials() {
        assert_eq!(
            OrderState::from_vendor("Submitted", 5.0, 5.0),
            Some(OrderState::PartiallyFilled)
        );
        assert_eq!(
            OrderState::from_vendor("Submitted", 0.0, 10.0),
            Some(OrderState::Submitted)
        );
        assert_eq!(
            OrderState::from_vendor("Inactive", 0.0, 10.0),
            Some(OrderState::Rejected)
        );
        assert_eq!(OrderState::from_vendor("Weird", 0.0, 0.0), None);
    }
}
