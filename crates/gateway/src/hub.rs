//! WebSocket hub: accepts client connections, runs their reader and writer
//! tasks, and dispatches parsed commands.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use common::upstream::StreamKind;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::json;
use tokio::time::interval;
use tracing::{debug, info, warn};
use upstream::{SessionHandle, SessionPhase};

use crate::client::{ClientRegistry, ClientState, QueueClosed};
use crate::error::CommandError;
use crate::orders::OrderManager;
use crate::protocol::{ClientCommand, ConnectionStatus, ServerMessage};
use crate::subscriptions::SubscriptionManager;

/// Application-level liveness ping cadence. Three missed pongs close the
/// connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket close code sent to slow consumers (server error class).
const CLOSE_SLOW_CONSUMER: u16 = 1011;

/// Shared state behind every connection handler.
pub struct HubState {
    pub registry: Arc<ClientRegistry>,
    pub subs: Arc<SubscriptionManager>,
    pub orders: Arc<OrderManager>,
    pub session: SessionHandle,
    pub max_ws_message_bytes: usize,
}

/// Build the axum router: WebSocket upgrades on `/`, liveness on `/health`,
/// counters on `/stats`.
pub fn create_router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
}

async fn health_handler(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "upstream": phase_label(state.session.phase()),
        "clients": state.registry.client_count(),
    }))
}

async fn stats_handler(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    Json(json!({
        "upstream": phase_label(state.session.phase()),
        "clients": state.registry.client_count(),
        "subscriptions": state.subs.subscription_count(),
        "orders": state.orders.order_count(),
    }))
}

fn phase_label(phase: SessionPhase) -> &'static str {
    match phase {
        SessionPhase::Disconnected => "disconnected",
        SessionPhase::Connecting => "connecting",
        SessionPhase::Handshaking => "handshaking",
        SessionPhase::Ready => "ready",
        SessionPhase::Reconnecting => "reconnecting",
        SessionPhase::Failed => "failed",
    }
}

/// Upstream phase as presented in `connection_status` messages.
pub fn status_of(phase: SessionPhase) -> ConnectionStatus {
    match phase {
        SessionPhase::Ready => ConnectionStatus::Connected,
        SessionPhase::Connecting | SessionPhase::Handshaking => ConnectionStatus::Connecting,
        _ => ConnectionStatus::Disconnected,
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
) -> impl IntoResponse {
    let max = state.max_ws_message_bytes;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let client = state.registry.register();
    let client_id = client.id;
    counter!("bridge_client_connections_total").increment(1);

    // Tell the newcomer where the upstream session stands.
    let _ = client.send(&ServerMessage::connection_status(
        status_of(state.session.phase()),
        None,
    ));

    // Writer: drains the outbound queue. A tripped queue means the client
    // could not keep up and gets closed with reason `slow_consumer`.
    let writer_client = client.clone();
    let writer = tokio::spawn(async move {
        loop {
            match writer_client.queue.pop().await {
                Ok(frame) => {
                    if ws_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(QueueClosed::SlowConsumer) => {
                    counter!("bridge_slow_consumer_disconnects_total").increment(1);
                    warn!(client_id = %writer_client.id, "disconnecting slow consumer");
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_SLOW_CONSUMER,
                            reason: "slow_consumer".into(),
                        })))
                        .await;
                    break;
                }
                Err(QueueClosed::Closed) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Reader: parses commands and enforces liveness.
    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    client.touch_pong();

    loop {
        tokio::select! {
            biased;

            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, &client, text.as_bytes()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    handle_frame(&state, &client, &data).await;
                }
                Some(Ok(Message::Pong(_))) => client.touch_pong(),
                Some(Ok(Message::Ping(_))) => {
                    // The transport answers pings; they still prove liveness.
                    client.touch_pong();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(%client_id, error = %e, "websocket error");
                    break;
                }
            },

            _ = ping.tick() => {
                if client.millis_since_pong() > 3 * PING_INTERVAL.as_millis() as i64 {
                    warn!(%client_id, "client missed three pongs, closing");
                    break;
                }
                if client.queue.push(Message::Ping(Vec::new().into()), true).is_err() {
                    break;
                }
            }
        }
    }

    // Ownership cascade: registry entry, queue, subscriptions, routing.
    state.registry.unregister(client_id);
    state.subs.client_disconnected(client_id).await;
    writer.abort();
    counter!("bridge_client_disconnections_total").increment(1);
    info!(%client_id, "client session ended");
}

async fn handle_frame(state: &Arc<HubState>, client: &Arc<ClientState>, payload: &[u8]) {
    let command: ClientCommand = match serde_json::from_slice(payload) {
        Ok(command) => command,
        Err(e) => {
            counter!("bridge_bad_requests_total").increment(1);
            let _ = client.send(&ServerMessage::bad_request(format!("invalid command: {e}")));
            return;
        }
    };
    if let Err(e) = dispatch(state, client, command).await {
        let _ = client.send(&ServerMessage::command_error(&e));
    }
}

/// Route one parsed command to its owning component.
pub async fn dispatch(
    state: &Arc<HubState>,
    client: &Arc<ClientState>,
    command: ClientCommand,
) -> Result<(), CommandError> {
    match command {
        ClientCommand::SubscribeMarketData(params) => {
            let instrument = params.instrument()?;
            state
                .subs
                .subscribe(client.id, instrument, StreamKind::Level1)
                .await?;
            Ok(())
        }
        ClientCommand::SubscribeTimeAndSales(params) => {
            let instrument = params.instrument()?;
            state
                .subs
                .subscribe(client.id, instrument, StreamKind::Trades)
                .await?;
            Ok(())
        }
        ClientCommand::SubscribeBidAsk(params) => {
            let instrument = params.instrument()?;
            state
                .subs
                .subscribe(client.id, instrument, StreamKind::Quotes)
                .await?;
            Ok(())
        }
        ClientCommand::UnsubscribeMarketData { symbol } => {
            state.subs.unsubscribe_symbol(client.id, &symbol).await;
            Ok(())
        }
        ClientCommand::PlaceOrder(params) => {
            state.orders.place(client.id, params).await?;
            Ok(())
        }
        ClientCommand::CancelOrder { order_id } => {
            state.orders.cancel(client.id, order_id).await
        }
        ClientCommand::GetContractDetails(params) => {
            let instrument = params.instrument()?;
            state
                .subs
                .lookup_contract_details(client.id, instrument)
                .await?;
            Ok(())
        }
    }
}
