//! Subscription lifecycle: create, activate, cancel, resubscribe.
//!
//! The manager owns every subscription record and is the single writer to
//! the routing tables' subscription maps. Mutating entry points are called
//! from exactly two places: the per-client reader tasks (commands) and the
//! event router (upstream events).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::instrument::front_month;
use common::upstream::{ContractDescriptor, StreamKind, UpstreamRequest};
use common::{unix_now, ClientId, IdAllocator, Instrument, InstrumentKind, ReqId, SubId};
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use upstream::{SessionError, SessionHandle};
use uuid::Uuid;

use crate::client::ClientRegistry;
use crate::error::CommandError;
use crate::protocol::ServerMessage;
use crate::routing::RoutingTables;

/// How long a cancelled subscription lingers before its routing entries are
/// reclaimed. The vendor protocol has no cancel acknowledgement; events that
/// arrive inside this window are dropped silently.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created, not yet confirmed by data. Re-sent on reconnect.
    Pending,
    /// At least one data event has arrived.
    Active,
    /// Terminated by a fatal vendor error.
    Failed,
    /// Cancel sent; awaiting the grace timer.
    Cancelling,
    /// Fully torn down.
    Cancelled,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionState::Failed | SubscriptionState::Cancelled)
    }
}

/// A single (client, instrument, stream-kind) data stream.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub sub_id: SubId,
    pub client_id: ClientId,
    pub instrument: Instrument,
    pub stream_kind: StreamKind,
    pub req_id: ReqId,
    pub state: SubscriptionState,
    /// Process-wide creation counter; preserves per-client relative order
    /// when resubscribing.
    pub seq: u64,
    pub created_at: f64,
    pub last_event_at: Option<f64>,
}

/// Outcome of routing a data event by request id.
pub enum RouteOutcome {
    /// Deliver to this client, labelled with the subscribed symbol.
    Deliver { client_id: ClientId, symbol: String },
    /// The subscription is being cancelled; drop silently.
    Cancelling,
    /// Nobody owns this request id.
    Unknown,
}

enum Lookup {
    /// One-shot `get_contract_details` request.
    ClientDetails { client_id: ClientId },
    /// Front-month resolution gating a pending futures subscription.
    FrontMonth { sub_id: SubId, months: Vec<String> },
}

/// Owns all subscription records.
pub struct SubscriptionManager {
    subs: DashMap<SubId, Subscription>,
    /// Transient contract-details table: req_id → what the reply completes.
    lookups: DashMap<ReqId, Lookup>,
    routing: Arc<RoutingTables>,
    ids: Arc<IdAllocator>,
    session: SessionHandle,
    registry: Arc<ClientRegistry>,
    cancel_tx: mpsc::UnboundedSender<SubId>,
    seq: AtomicU64,
}

impl SubscriptionManager {
    /// Build the manager plus the receiver its cancel janitor drains.
    pub fn new(
        routing: Arc<RoutingTables>,
        ids: Arc<IdAllocator>,
        session: SessionHandle,
        registry: Arc<ClientRegistry>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SubId>) {
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            subs: DashMap::new(),
            lookups: DashMap::new(),
            routing,
            ids,
            session,
            registry,
            cancel_tx,
            seq: AtomicU64::new(0),
        });
        (manager, cancel_rx)
    }

    /// Create a subscription for a canonical instrument.
    ///
    /// Routing entries are installed before the upstream request goes out, so
    /// any inbound event is routable from the start. If the session is not
    /// ready the subscription stays `Pending` and is sent on the next
    /// `ConnectionReady`.
    pub async fn subscribe(
        &self,
        client_id: ClientId,
        instrument: Instrument,
        stream_kind: StreamKind,
    ) -> Result<SubId, CommandError> {
        if self.has_duplicate(client_id, &instrument, stream_kind) {
            return Err(CommandError::DuplicateSubscription);
        }

        let req_id = self.ids.next_req_id();
        let sub_id = Uuid::new_v4();
        let subscription = Subscription {
            sub_id,
            client_id,
            instrument: instrument.clone(),
            stream_kind,
            req_id,
            state: SubscriptionState::Pending,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            created_at: unix_now(),
            last_event_at: None,
        };
        self.routing
            .insert_sub(sub_id, req_id, client_id, &instrument.identity());
        self.subs.insert(sub_id, subscription);
        counter!("bridge_subscriptions_created_total").increment(1);
        info!(%client_id, %sub_id, req_id, symbol = %instrument, kind = ?stream_kind, "subscription created");

        self.dispatch(sub_id).await;
        Ok(sub_id)
    }

    /// At most one non-terminal subscription may exist per
    /// (client, canonical instrument, stream kind). A futures subscription
    /// whose contract month is still unresolved conflicts with any month.
    fn has_duplicate(
        &self,
        client_id: ClientId,
        instrument: &Instrument,
        stream_kind: StreamKind,
    ) -> bool {
        let key = instrument.identity();
        self.routing.subs_for_client(client_id).iter().any(|sub_id| {
            self.subs.get(sub_id).is_some_and(|sub| {
                if sub.state.is_terminal() || sub.stream_kind != stream_kind {
                    return false;
                }
                let existing = sub.instrument.identity();
                if existing == key {
                    return true;
                }
                instrument.kind == InstrumentKind::Future
                    && existing.kind == key.kind
                    && existing.symbol == key.symbol
                    && existing.exchange == key.exchange
                    && (existing.contract_month.is_none() || key.contract_month.is_none())
            })
        })
    }

    /// Send the upstream request for a subscription. Unresolved futures go
    /// through a contract-details lookup first; send failures leave the
    /// subscription `Pending` for the next reconnect.
    async fn dispatch(&self, sub_id: SubId) {
        let Some((req_id, instrument, stream_kind)) = self
            .subs
            .get(&sub_id)
            .map(|sub| (sub.req_id, sub.instrument.clone(), sub.stream_kind))
        else {
            return;
        };

        let request = if instrument.kind == InstrumentKind::Future
            && instrument.contract_month.is_none()
        {
            self.lookups.insert(
                req_id,
                Lookup::FrontMonth {
                    sub_id,
                    months: Vec::new(),
                },
            );
            UpstreamRequest::ContractDetails { req_id, instrument }
        } else {
            stream_kind.subscribe_request(req_id, instrument)
        };

        match self.session.send(request).await {
            Ok(()) => {}
            Err(SessionError::NotReady) => {
                debug!(%sub_id, "session not ready, subscription stays pending");
            }
            Err(e) => {
                warn!(%sub_id, error = %e, "upstream send failed, subscription stays pending");
            }
        }
    }

    /// Cancel all of a client's subscriptions for a symbol, across stream
    /// kinds. They enter `Cancelling` and are reclaimed by the grace timer.
    pub async fn unsubscribe_symbol(&self, client_id: ClientId, symbol: &str) {
        let symbol = symbol.trim().to_ascii_uppercase();
        let targets: Vec<SubId> = self
            .routing
            .subs_for_client(client_id)
            .into_iter()
            .filter(|sub_id| {
                self.subs.get(sub_id).is_some_and(|sub| {
                    !sub.state.is_terminal()
                        && sub.state != SubscriptionState::Cancelling
                        && sub.instrument.symbol == symbol
                })
            })
            .collect();

        for sub_id in targets {
            self.begin_cancel(sub_id).await;
        }
    }

    async fn begin_cancel(&self, sub_id: SubId) {
        let Some((req_id, stream_kind)) = self.subs.get_mut(&sub_id).map(|mut sub| {
            sub.state = SubscriptionState::Cancelling;
            (sub.req_id, sub.stream_kind)
        }) else {
            return;
        };
        self.lookups.remove(&req_id);
        if let Err(e) = self.session.send(stream_kind.cancel_request(req_id)).await {
            debug!(%sub_id, error = %e, "upstream cancel not sent");
        }
        info!(%sub_id, req_id, "subscription cancelling");
        let _ = self.cancel_tx.send(sub_id);
    }

    /// Grace timer expiry: `Cancelling` becomes `Cancelled` and the record
    /// disappears.
    pub fn finish_cancel(&self, sub_id: SubId) {
        let was_cancelling = self
            .subs
            .get_mut(&sub_id)
            .map(|mut sub| {
                if sub.state == SubscriptionState::Cancelling {
                    sub.state = SubscriptionState::Cancelled;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if was_cancelling {
            self.routing.forget(sub_id);
            self.subs.remove(&sub_id);
            counter!("bridge_subscriptions_cancelled_total").increment(1);
            debug!(%sub_id, "subscription cancelled");
        }
    }

    /// Ownership cascade on disconnect: cancel upstream and reclaim routing
    /// immediately. Late events for the old request ids are dropped as
    /// unknown.
    pub async fn client_disconnected(&self, client_id: ClientId) {
        let owned = self.routing.subs_for_client(client_id);
        for sub_id in owned {
            let Some((req_id, stream_kind, state)) = self
                .subs
                .get(&sub_id)
                .map(|sub| (sub.req_id, sub.stream_kind, sub.state))
            else {
                continue;
            };
            self.lookups.remove(&req_id);
            if !state.is_terminal() {
                let _ = self
                    .session
                    .send(stream_kind.cancel_request(req_id))
                    .await;
            }
            self.routing.forget(sub_id);
            self.subs.remove(&sub_id);
        }
        self.routing.remove_client(client_id);
        self.lookups
            .retain(|_, lookup| !matches!(lookup, Lookup::ClientDetails { client_id: c } if *c == client_id));
        info!(%client_id, "subscriptions cleaned up after disconnect");
    }

    /// Reconnect: active subscriptions go back to `Pending` until re-sent.
    pub fn mark_disconnected(&self) {
        self.lookups.clear();
        for mut entry in self.subs.iter_mut() {
            if entry.state == SubscriptionState::Active {
                entry.state = SubscriptionState::Pending;
            }
        }
    }

    /// `ConnectionReady`: every non-terminal subscription gets a fresh
    /// request id, rewritten routing, and exactly one re-send. Iteration is
    /// in creation order, which preserves each client's relative order.
    pub async fn resubscribe_all(&self) {
        self.lookups.clear();
        let mut pending: Vec<(u64, SubId)> = self
            .subs
            .iter()
            .filter(|sub| {
                matches!(
                    sub.state,
                    SubscriptionState::Pending | SubscriptionState::Active
                )
            })
            .map(|sub| (sub.seq, sub.sub_id))
            .collect();
        pending.sort_unstable();

        let count = pending.len();
        for (_, sub_id) in pending {
            let new_req_id = self.ids.next_req_id();
            let rebound = self
                .subs
                .get_mut(&sub_id)
                .map(|mut sub| {
                    sub.req_id = new_req_id;
                    sub.state = SubscriptionState::Pending;
                })
                .is_some();
            if rebound {
                self.routing.rebind(sub_id, new_req_id);
                self.dispatch(sub_id).await;
            }
        }
        if count > 0 {
            info!(count, "resubscribed after reconnect");
        }
    }

    /// Route a data event by request id, activating `Pending` subscriptions
    /// and refreshing `last_event_at`.
    pub fn record_event(&self, req_id: ReqId) -> RouteOutcome {
        let Some(sub_id) = self.routing.sub_for_req(req_id) else {
            return RouteOutcome::Unknown;
        };
        let Some(mut sub) = self.subs.get_mut(&sub_id) else {
            return RouteOutcome::Unknown;
        };
        match sub.state {
            SubscriptionState::Cancelling => return RouteOutcome::Cancelling,
            SubscriptionState::Pending => {
                sub.state = SubscriptionState::Active;
                debug!(%sub_id, req_id, "subscription active");
            }
            _ => {}
        }
        sub.last_event_at = Some(unix_now());
        RouteOutcome::Deliver {
            client_id: sub.client_id,
            symbol: sub.instrument.symbol.clone(),
        }
    }

    /// Owner of a request id, through either the lookup table or a
    /// subscription. Used for non-fatal vendor errors.
    pub fn client_for_request(&self, req_id: ReqId) -> Option<ClientId> {
        if let Some(lookup) = self.lookups.get(&req_id) {
            return match &*lookup {
                Lookup::ClientDetails { client_id } => Some(*client_id),
                Lookup::FrontMonth { sub_id, .. } => {
                    self.subs.get(sub_id).map(|sub| sub.client_id)
                }
            };
        }
        let sub_id = self.routing.sub_for_req(req_id)?;
        self.subs.get(&sub_id).map(|sub| sub.client_id)
    }

    /// Fatal vendor error for a request id: terminate whatever it gates.
    /// Returns the owner so the error itself can still be forwarded.
    pub fn fail_request(&self, req_id: ReqId) -> Option<ClientId> {
        if let Some((_, lookup)) = self.lookups.remove(&req_id) {
            match lookup {
                Lookup::ClientDetails { client_id } => return Some(client_id),
                Lookup::FrontMonth { sub_id, .. } => return self.fail_sub(sub_id),
            }
        }
        let sub_id = self.routing.sub_for_req(req_id)?;
        self.fail_sub(sub_id)
    }

    fn fail_sub(&self, sub_id: SubId) -> Option<ClientId> {
        let client_id = self.subs.get_mut(&sub_id).map(|mut sub| {
            sub.state = SubscriptionState::Failed;
            sub.client_id
        })?;
        self.routing.forget(sub_id);
        self.subs.remove(&sub_id);
        counter!("bridge_subscriptions_failed_total").increment(1);
        warn!(%sub_id, "subscription failed");
        Some(client_id)
    }

    /// One-shot contract-details lookup on behalf of a client.
    pub async fn lookup_contract_details(
        &self,
        client_id: ClientId,
        instrument: Instrument,
    ) -> Result<ReqId, CommandError> {
        let req_id = self.ids.next_req_id();
        self.lookups
            .insert(req_id, Lookup::ClientDetails { client_id });
        match self
            .session
            .send(UpstreamRequest::ContractDetails { req_id, instrument })
            .await
        {
            Ok(()) => Ok(req_id),
            Err(e) => {
                // One-shot lookups are not queued across reconnects.
                self.lookups.remove(&req_id);
                Err(e.into())
            }
        }
    }

    /// Route a `contract_details` event: accumulate months for front-month
    /// resolution, or forward a one-shot lookup. Returns the client to
    /// forward the details to, if any.
    pub fn handle_contract_details(
        &self,
        req_id: ReqId,
        contract: &ContractDescriptor,
    ) -> Option<ClientId> {
        enum Hit {
            Client(ClientId),
            Sub(SubId),
        }
        let hit = self.lookups.get_mut(&req_id).map(|mut lookup| match &mut *lookup {
            Lookup::ClientDetails { client_id } => Hit::Client(*client_id),
            Lookup::FrontMonth { sub_id, months } => {
                if let Some(month) = &contract.contract_month {
                    months.push(month.clone());
                }
                Hit::Sub(*sub_id)
            }
        });
        match hit {
            Some(Hit::Client(client_id)) => Some(client_id),
            Some(Hit::Sub(sub_id)) => self.subs.get(&sub_id).map(|sub| sub.client_id),
            None => {
                let sub_id = self.routing.sub_for_req(req_id)?;
                self.subs.get(&sub_id).map(|sub| sub.client_id)
            }
        }
    }

    /// Route a `contract_details_end` event. Completes front-month
    /// resolution: the gated subscription is re-dispatched with the resolved
    /// month under a fresh request id, or failed when no tradable month
    /// exists.
    pub async fn handle_contract_details_end(&self, req_id: ReqId) -> Option<ClientId> {
        match self.lookups.remove(&req_id) {
            Some((_, Lookup::ClientDetails { client_id })) => Some(client_id),
            Some((_, Lookup::FrontMonth { sub_id, months })) => {
                let client_id = self.subs.get(&sub_id).map(|sub| sub.client_id);
                match front_month(months) {
                    Some(month) => {
                        let new_req_id = self.ids.next_req_id();
                        let resolved = self
                            .subs
                            .get_mut(&sub_id)
                            .map(|mut sub| {
                                sub.instrument.contract_month = Some(month.clone());
                                sub.req_id = new_req_id;
                            })
                            .is_some();
                        if resolved {
                            info!(%sub_id, %month, "front month resolved");
                            self.routing.rebind(sub_id, new_req_id);
                            self.dispatch(sub_id).await;
                        }
                    }
                    None => {
                        let symbol = self
                            .subs
                            .get(&sub_id)
                            .map(|sub| sub.instrument.symbol.clone())
                            .unwrap_or_default();
                        warn!(%sub_id, %symbol, "no tradable contract month");
                        if let Some(owner) = self.fail_sub(sub_id) {
                            if let Some(client) = self.registry.get(owner) {
                                let _ = client.send(&ServerMessage::subscription_failed(
                                    format!("no active contract month for {symbol}"),
                                    Some(req_id),
                                ));
                            }
                        }
                    }
                }
                client_id
            }
            None => {
                let sub_id = self.routing.sub_for_req(req_id)?;
                self.subs.get(&sub_id).map(|sub| sub.client_id)
            }
        }
    }

    pub fn get(&self, sub_id: SubId) -> Option<Subscription> {
        self.subs.get(&sub_id).map(|sub| sub.clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    /// Live (non-terminal) subscriptions for a client, used by tests and the
    /// stats endpoint.
    pub fn live_for_client(&self, client_id: ClientId) -> Vec<Subscription> {
        self.routing
            .subs_for_client(client_id)
            .into_iter()
            .filter_map(|sub_id| self.subs.get(&sub_id).map(|sub| sub.clone()))
            .collect()
    }
}

/// Drains cancel notices and reclaims each subscription after the grace
/// period. Owned by the supervisor.
pub async fn cancel_janitor(
    manager: Arc<SubscriptionManager>,
    mut cancel_rx: mpsc::UnboundedReceiver<SubId>,
) {
    while let Some(sub_id) = cancel_rx.recv().await {
        let manager = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CANCEL_GRACE).await;
            manager.finish_cancel(sub_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use upstream::testing::manual_handle;
    use upstream::SessionPhase;

    struct Fixture {
        manager: Arc<SubscriptionManager>,
        routing: Arc<RoutingTables>,
        requests: mpsc::Receiver<UpstreamRequest>,
        _phase: tokio::sync::watch::Sender<SessionPhase>,
        _cancel_rx: mpsc::UnboundedReceiver<SubId>,
    }

    fn fixture() -> Fixture {
        let (handle, requests, phase) = manual_handle(64, Duration::from_secs(5));
        let routing = Arc::new(RoutingTables::new());
        let ids = Arc::new(IdAllocator::new());
        let registry = Arc::new(ClientRegistry::new(16));
        let (manager, cancel_rx) =
            SubscriptionManager::new(routing.clone(), ids, handle, registry);
        Fixture {
            manager,
            routing,
            requests,
            _phase: phase,
            _cancel_rx: cancel_rx,
        }
    }

    fn stock(symbol: &str) -> Instrument {
        Instrument::new(symbol, InstrumentKind::Stock).canonicalize()
    }

    #[tokio::test]
    async fn subscribe_installs_routing_before_sending() {
        let mut fx = fixture();
        let client = Uuid::new_v4();
        let sub_id = fx
            .manager
            .subscribe(client, stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap();

        let request = fx.requests.recv().await.unwrap();
        let req_id = request.req_id().unwrap();
        assert_eq!(req_id, 1);
        assert_eq!(fx.routing.sub_for_req(req_id), Some(sub_id));
        assert!(matches!(
            request,
            UpstreamRequest::SubscribeMarketData { .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_subscriptions_are_rejected() {
        let fx = fixture();
        let client = Uuid::new_v4();
        fx.manager
            .subscribe(client, stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap();
        let err = fx
            .manager
            .subscribe(client, stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::DuplicateSubscription);

        // A different stream kind for the same instrument is fine.
        fx.manager
            .subscribe(client, stock("AAPL"), StreamKind::Trades)
            .await
            .unwrap();
        // Another client may hold an identical subscription.
        fx.manager
            .subscribe(Uuid::new_v4(), stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_event_activates_the_subscription() {
        let fx = fixture();
        let client = Uuid::new_v4();
        let sub_id = fx
            .manager
            .subscribe(client, stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap();
        assert_eq!(
            fx.manager.get(sub_id).unwrap().state,
            SubscriptionState::Pending
        );

        match fx.manager.record_event(1) {
            RouteOutcome::Deliver { client_id, symbol } => {
                assert_eq!(client_id, client);
                assert_eq!(symbol, "AAPL");
            }
            _ => panic!("expected delivery"),
        }
        let sub = fx.manager.get(sub_id).unwrap();
        assert_eq!(sub.state, SubscriptionState::Active);
        assert!(sub.last_event_at.is_some());
    }

    #[tokio::test]
    async fn events_for_cancelling_subscriptions_are_dropped_silently() {
        let mut fx = fixture();
        let client = Uuid::new_v4();
        fx.manager
            .subscribe(client, stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap();
        let _ = fx.requests.recv().await;

        fx.manager.unsubscribe_symbol(client, "AAPL").await;
        assert!(matches!(
            fx.manager.record_event(1),
            RouteOutcome::Cancelling
        ));
        assert!(matches!(
            fx.requests.recv().await.unwrap(),
            UpstreamRequest::CancelMarketData { req_id: 1 }
        ));
    }

    #[tokio::test]
    async fn finish_cancel_reclaims_routing() {
        let fx = fixture();
        let client = Uuid::new_v4();
        let sub_id = fx
            .manager
            .subscribe(client, stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap();
        fx.manager.unsubscribe_symbol(client, "AAPL").await;
        fx.manager.finish_cancel(sub_id);

        assert!(fx.manager.get(sub_id).is_none());
        assert_eq!(fx.routing.sub_for_req(1), None);
        assert!(matches!(fx.manager.record_event(1), RouteOutcome::Unknown));
    }

    #[tokio::test]
    async fn unsubscribe_covers_all_stream_kinds_for_the_symbol() {
        let mut fx = fixture();
        let client = Uuid::new_v4();
        fx.manager
            .subscribe(client, stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap();
        fx.manager
            .subscribe(client, stock("AAPL"), StreamKind::Quotes)
            .await
            .unwrap();
        fx.manager
            .subscribe(client, stock("MSFT"), StreamKind::Level1)
            .await
            .unwrap();
        while fx.requests.try_recv().is_ok() {}

        fx.manager.unsubscribe_symbol(client, "aapl").await;

        let mut cancels = Vec::new();
        while let Ok(request) = fx.requests.try_recv() {
            cancels.push(request);
        }
        assert_eq!(cancels.len(), 2, "both AAPL streams cancel, MSFT stays");
    }

    #[tokio::test]
    async fn disconnect_cascade_clears_all_tables() {
        let fx = fixture();
        let client = Uuid::new_v4();
        fx.manager
            .subscribe(client, stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap();
        fx.manager
            .subscribe(client, stock("MSFT"), StreamKind::Trades)
            .await
            .unwrap();

        fx.manager.client_disconnected(client).await;

        assert!(fx.routing.is_clean_of_client(client));
        assert_eq!(fx.manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn resubscribe_assigns_fresh_req_ids_exactly_once() {
        let mut fx = fixture();
        let client = Uuid::new_v4();
        let sub_a = fx
            .manager
            .subscribe(client, stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap();
        let sub_b = fx
            .manager
            .subscribe(client, stock("MSFT"), StreamKind::Level1)
            .await
            .unwrap();
        // Activate one of them to prove Active also resubscribes.
        fx.manager.record_event(1);
        while fx.requests.try_recv().is_ok() {}

        fx.manager.mark_disconnected();
        fx.manager.resubscribe_all().await;

        let mut req_ids = Vec::new();
        while let Ok(request) = fx.requests.try_recv() {
            req_ids.push(request.req_id().unwrap());
        }
        assert_eq!(req_ids, vec![3, 4], "fresh ids, one send each, in order");
        assert_eq!(fx.manager.get(sub_a).unwrap().req_id, 3);
        assert_eq!(fx.manager.get(sub_b).unwrap().req_id, 4);
        assert_eq!(fx.routing.sub_for_req(1), None);
        assert_eq!(fx.routing.sub_for_req(2), None);
        assert_eq!(fx.routing.sub_for_req(3), Some(sub_a));
        assert_eq!(fx.routing.sub_for_req(4), Some(sub_b));
        assert_eq!(
            fx.manager.get(sub_a).unwrap().state,
            SubscriptionState::Pending
        );
    }

    #[tokio::test]
    async fn fatal_error_forgets_the_subscription() {
        let fx = fixture();
        let client = Uuid::new_v4();
        let sub_id = fx
            .manager
            .subscribe(client, stock("AAPL"), StreamKind::Level1)
            .await
            .unwrap();

        assert_eq!(fx.manager.fail_request(1), Some(client));
        assert!(fx.manager.get(sub_id).is_none());
        assert_eq!(fx.routing.sub_for_req(1), None);
    }

    #[tokio::test]
    async fn unresolved_future_goes_through_contract_details() {
        let mut fx = fixture();
        let client = Uuid::new_v4();
        let es = Instrument::new("ES", InstrumentKind::Future).canonicalize();
        let sub_id = fx
            .manager
            .subscribe(client, es, StreamKind::Level1)
            .await
            .unwrap();

        // First request is the details lookup, not a data subscribe.
        let request = fx.requests.recv().await.unwrap();
        assert!(matches!(request, UpstreamRequest::ContractDetails { req_id: 1, .. }));

        let detail = |month: &str| ContractDescriptor {
            symbol: "ES".to_string(),
            kind: InstrumentKind::Future,
            exchange: Some("CME".to_string()),
            currency: Some("USD".to_string()),
            local_symbol: None,
            contract_month: Some(month.to_string()),
            multiplier: None,
            con_id: None,
        };
        // Use months far in the future so the test never expires.
        fx.manager.handle_contract_details(1, &detail("209912"));
        fx.manager.handle_contract_details(1, &detail("209909"));
        fx.manager.handle_contract_details_end(1).await;

        let sub = fx.manager.get(sub_id).unwrap();
        assert_eq!(sub.instrument.contract_month.as_deref(), Some("209909"));
        assert_eq!(sub.req_id, 2);

        let request = fx.requests.recv().await.unwrap();
        match request {
            UpstreamRequest::SubscribeMarketData { req_id, instrument } => {
                assert_eq!(req_id, 2);
                assert_eq!(instrument.contract_month.as_deref(), Some("209909"));
            }
            other => panic!("unexpected request: {other:?}"),
        }
        // A data event for the fresh req_id now activates it.
        assert!(matches!(
            fx.manager.record_event(2),
            RouteOutcome::Deliver { .. }
        ));
    }
}
