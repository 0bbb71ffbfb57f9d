//! Process lifecycle: startup order, shutdown cascade, signals.
//!
//! Components start leaves-first — ids, routing, session, router, managers,
//! hub — and stop in reverse. On SIGINT/SIGTERM the hub stops accepting,
//! clients get `connection_status: shutting_down` and a short grace period,
//! then the managers and the session close cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::IdAllocator;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info};
use upstream::{SessionError, UpstreamSession, VendorTransport};

use crate::client::ClientRegistry;
use crate::config::Config;
use crate::hub::{create_router, HubState};
use crate::orders::{retention_sweeper, OrderManager, GC_INTERVAL};
use crate::protocol::{ConnectionStatus, ServerMessage};
use crate::router::EventRouter;
use crate::routing::RoutingTables;
use crate::subscriptions::{cancel_janitor, SubscriptionManager};

/// Grace between the shutdown broadcast and closing client sockets.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Bound on the cooperative drain of background tasks.
const DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Why the process is exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal signal-driven shutdown.
    Clean,
    /// The upstream session tripped into its terminal `Failed` state.
    UpstreamFailed,
}

/// Run the whole gateway until shutdown.
pub async fn run(
    config: Config,
    transport: impl VendorTransport,
) -> anyhow::Result<ExitReason> {
    let ids = Arc::new(IdAllocator::new());
    let routing = Arc::new(RoutingTables::new());

    let (session, session_handle, events, session_shutdown) =
        UpstreamSession::new(transport, config.session());
    let mut session_task = tokio::spawn(session.run());

    let registry = Arc::new(ClientRegistry::new(config.client_queue_capacity));
    let (subs, cancel_rx) = SubscriptionManager::new(
        routing.clone(),
        ids.clone(),
        session_handle.clone(),
        registry.clone(),
    );
    let janitor = tokio::spawn(cancel_janitor(subs.clone(), cancel_rx));

    let orders = OrderManager::new(
        routing.clone(),
        ids.clone(),
        session_handle.clone(),
        config.order_retention,
    );
    let sweeper = tokio::spawn(retention_sweeper(orders.clone(), GC_INTERVAL));

    let router = EventRouter::new(
        events,
        registry.clone(),
        subs.clone(),
        orders.clone(),
        ids.clone(),
    );
    let (router_shutdown_tx, router_shutdown_rx) = mpsc::channel(1);
    let router_task = tokio::spawn(router.run(router_shutdown_rx));

    let hub = Arc::new(HubState {
        registry: registry.clone(),
        subs: subs.clone(),
        orders: orders.clone(),
        session: session_handle.clone(),
        max_ws_message_bytes: config.max_ws_message_bytes,
    });
    let app = create_router(hub);
    let addr: SocketAddr = format!("{}:{}", config.ws_host, config.ws_port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.ws_host, config.ws_port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "websocket hub listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    let mut exit = ExitReason::Clean;
    let mut session_done = false;
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        result = &mut session_task => {
            session_done = true;
            match result {
                Ok(Err(SessionError::Failed)) => {
                    error!("upstream session failed permanently");
                    exit = ExitReason::UpstreamFailed;
                }
                Ok(_) => info!("upstream session ended"),
                Err(e) => error!(error = %e, "upstream session task panicked"),
            }
        }
    }

    info!("shutting down");
    registry.broadcast(&ServerMessage::connection_status(
        ConnectionStatus::ShuttingDown,
        None,
    ));
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    registry.close_all();

    sweeper.abort();
    janitor.abort();
    let _ = router_shutdown_tx.send(()).await;
    let _ = session_shutdown.send(()).await;

    let drained = timeout(DRAIN_WINDOW, async {
        let _ = router_task.await;
        if !session_done {
            let _ = session_task.await;
        }
    })
    .await;
    if drained.is_err() {
        error!("drain window elapsed, forcing shutdown");
    }

    info!("shutdown complete");
    Ok(exit)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
