//! Event router: upstream session events → client queues.
//!
//! Single consumer of the session's event stream. Data events are routed by
//! request id, order events by order id; connection transitions fan out to
//! every client and drive the resubscribe pass.

use std::sync::Arc;

use common::upstream::{Severity, UpstreamEvent};
use common::{ClientId, IdAllocator, ReqId};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use upstream::SessionEvent;

use crate::client::ClientRegistry;
use crate::orders::OrderManager;
use crate::protocol::{ConnectionStatus, DataType, ServerMessage};
use crate::subscriptions::{RouteOutcome, SubscriptionManager};

/// Consumes decoded upstream events and fans them out to client queues.
pub struct EventRouter {
    events: mpsc::Receiver<SessionEvent>,
    registry: Arc<ClientRegistry>,
    subs: Arc<SubscriptionManager>,
    orders: Arc<OrderManager>,
    ids: Arc<IdAllocator>,
}

impl EventRouter {
    pub fn new(
        events: mpsc::Receiver<SessionEvent>,
        registry: Arc<ClientRegistry>,
        subs: Arc<SubscriptionManager>,
        orders: Arc<OrderManager>,
        ids: Arc<IdAllocator>,
    ) -> Self {
        Self {
            events,
            registry,
            subs,
            orders,
            ids,
        }
    }

    /// Run until the session ends or shutdown is signalled.
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("event router running");
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        info!("event router stopped");
    }

    async fn handle(&mut self, event: SessionEvent) {
        counter!("bridge_events_routed_total").increment(1);
        match event {
            SessionEvent::ConnectionReady { next_order_id } => {
                self.ids.observe_order_id_floor(next_order_id);
                self.registry.broadcast(&ServerMessage::connection_status(
                    ConnectionStatus::Connected,
                    Some(next_order_id),
                ));
                self.subs.resubscribe_all().await;
            }
            SessionEvent::ConnectionLost { reason } => {
                warn!(%reason, "upstream connection lost, notifying clients");
                self.subs.mark_disconnected();
                self.registry.broadcast(&ServerMessage::connection_status(
                    ConnectionStatus::Disconnected,
                    None,
                ));
            }
            SessionEvent::Vendor { event, received_at } => {
                self.handle_vendor(event, received_at).await;
            }
        }
    }

    async fn handle_vendor(&mut self, event: UpstreamEvent, received_at: f64) {
        match event {
            UpstreamEvent::NextOrderId { order_id } => {
                // Mid-session refresh of the order-id floor.
                self.ids.observe_order_id_floor(order_id);
            }
            UpstreamEvent::TickPrice { req_id, tick, price } => {
                if let Some((client_id, symbol)) = self.route_data(req_id) {
                    self.forward(
                        client_id,
                        ServerMessage::MarketData {
                            symbol,
                            req_id,
                            data_type: DataType::Price,
                            tick_type: tick.as_str().to_string(),
                            price: Some(price),
                            size: None,
                            value: None,
                            timestamp: received_at,
                        },
                    );
                }
            }
            UpstreamEvent::TickSize { req_id, tick, size } => {
                if let Some((client_id, symbol)) = self.route_data(req_id) {
                    self.forward(
                        client_id,
                        ServerMessage::MarketData {
                            symbol,
                            req_id,
                            data_type: DataType::Size,
                            tick_type: tick.as_str().to_string(),
                            price: None,
                            size: Some(size),
                            value: None,
                            timestamp: received_at,
                        },
                    );
                }
            }
            UpstreamEvent::TickString { req_id, tick, value } => {
                if let Some((client_id, symbol)) = self.route_data(req_id) {
                    self.forward(
                        client_id,
                        ServerMessage::MarketData {
                            symbol,
                            req_id,
                            data_type: DataType::Text,
                            tick_type: tick,
                            price: None,
                            size: None,
                            value: Some(value),
                            timestamp: received_at,
                        },
                    );
                }
            }
            UpstreamEvent::Trade {
                req_id,
                time,
                price,
                size,
                exchange,
                special_conditions,
                past_limit,
                unreported,
            } => {
                if let Some((client_id, symbol)) = self.route_data(req_id) {
                    self.forward(
                        client_id,
                        ServerMessage::TimeAndSales {
                            symbol,
                            req_id,
                            price,
                            size,
                            exchange,
                            special_conditions,
                            past_limit,
                            unreported,
                            timestamp: time,
                        },
                    );
                }
            }
            UpstreamEvent::BidAsk {
                req_id,
                time,
                bid_price,
                ask_price,
                bid_size,
                ask_size,
                bid_past_low,
                ask_past_high,
            } => {
                if let Some((client_id, symbol)) = self.route_data(req_id) {
                    self.forward(
                        client_id,
                        ServerMessage::BidAskTick {
                            symbol,
                            req_id,
                            bid_price,
                            ask_price,
                            bid_size,
                            ask_size,
                            bid_past_low,
                            ask_past_high,
                            timestamp: time,
                        },
                    );
                }
            }
            UpstreamEvent::OrderStatus {
                order_id,
                status,
                filled,
                remaining,
                avg_fill_price,
                last_fill_price,
            } => {
                match self.orders.apply_status(
                    order_id,
                    &status,
                    filled,
                    remaining,
                    avg_fill_price,
                    last_fill_price,
                ) {
                    Some(client_id) => self.forward(
                        client_id,
                        ServerMessage::OrderStatus {
                            order_id,
                            status,
                            filled,
                            remaining,
                            avg_fill_price,
                            last_fill_price,
                            timestamp: received_at,
                        },
                    ),
                    None => {
                        warn!(order_id, "order status for unknown order");
                        counter!("bridge_unknown_order_events_total").increment(1);
                    }
                }
            }
            UpstreamEvent::ContractDetails {
                req_id,
                contract,
                market_name,
                min_tick,
            } => match self.subs.handle_contract_details(req_id, &contract) {
                Some(client_id) => self.forward(
                    client_id,
                    ServerMessage::ContractDetails {
                        req_id,
                        contract,
                        market_name,
                        min_tick,
                        timestamp: received_at,
                    },
                ),
                None => self.unknown(req_id),
            },
            UpstreamEvent::ContractDetailsEnd { req_id } => {
                match self.subs.handle_contract_details_end(req_id).await {
                    Some(client_id) => self.forward(
                        client_id,
                        ServerMessage::ContractDetailsEnd {
                            req_id,
                            timestamp: received_at,
                        },
                    ),
                    None => self.unknown(req_id),
                }
            }
            UpstreamEvent::Error {
                req_id,
                order_id,
                code,
                message,
            } => {
                let severity = Severity::from_code(code);
                let target = if let Some(req_id) = req_id {
                    if severity.is_fatal() {
                        self.subs.fail_request(req_id)
                    } else {
                        self.subs.client_for_request(req_id)
                    }
                } else if let Some(order_id) = order_id {
                    self.orders.owner(order_id)
                } else {
                    None
                };

                let error = ServerMessage::Error {
                    severity,
                    error_code: code.to_string(),
                    error_string: message,
                    req_id,
                    order_id,
                    timestamp: received_at,
                };
                match target {
                    Some(client_id) => self.forward(client_id, error),
                    None if req_id.is_none() && order_id.is_none() => {
                        // System notices (connectivity, farm status) go to
                        // everyone.
                        self.registry.broadcast(&error);
                    }
                    None => {
                        debug!(?req_id, ?order_id, code, "vendor error for unknown id");
                    }
                }
            }
            UpstreamEvent::Pong => {}
        }
    }

    /// Resolve a data event's owner; logs and counts the failure modes.
    fn route_data(&self, req_id: ReqId) -> Option<(ClientId, String)> {
        match self.subs.record_event(req_id) {
            RouteOutcome::Deliver { client_id, symbol } => Some((client_id, symbol)),
            RouteOutcome::Cancelling => None,
            RouteOutcome::Unknown => {
                self.unknown(req_id);
                None
            }
        }
    }

    fn forward(&self, client_id: ClientId, message: ServerMessage) {
        let Some(client) = self.registry.get(client_id) else {
            return;
        };
        if client.send(&message).is_err() {
            // The writer task notices the tripped queue and disconnects.
            debug!(%client_id, "message dropped for slow or closed client");
        }
    }

    fn unknown(&self, req_id: ReqId) {
        warn!(req_id, "event for unknown request id");
        counter!("bridge_unknown_req_events_total").increment(1);
    }
}
