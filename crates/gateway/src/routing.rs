//! Request-id and ownership routing tables.
//!
//! These maps are the only mutable state shared across components. Lookups
//! never block; mutations are sharded by key. By convention the subscription
//! manager is the sole writer of the subscription maps and the order manager
//! of the order map.

use common::{ClientId, InstrumentKey, OrderId, ReqId, SubId};
use dashmap::{DashMap, DashSet};

struct SubOwner {
    client_id: ClientId,
    key: InstrumentKey,
}

/// Bidirectional routing state: request id ↔ subscription, order ↔ client,
/// client ↔ subscriptions, instrument ↔ subscriptions (diagnostics only).
pub struct RoutingTables {
    req_to_sub: DashMap<ReqId, SubId>,
    sub_to_req: DashMap<SubId, ReqId>,
    order_to_client: DashMap<OrderId, ClientId>,
    client_to_subs: DashMap<ClientId, DashSet<SubId>>,
    instrument_to_subs: DashMap<InstrumentKey, DashSet<SubId>>,
    sub_owner: DashMap<SubId, SubOwner>,
}

impl RoutingTables {
    pub fn new() -> Self {
        Self {
            req_to_sub: DashMap::new(),
            sub_to_req: DashMap::new(),
            order_to_client: DashMap::new(),
            client_to_subs: DashMap::new(),
            instrument_to_subs: DashMap::new(),
            sub_owner: DashMap::new(),
        }
    }

    /// Register a new subscription under its request id. Entries must exist
    /// before the upstream request is sent so the first inbound event is
    /// routable.
    pub fn insert_sub(
        &self,
        sub_id: SubId,
        req_id: ReqId,
        client_id: ClientId,
        key: &InstrumentKey,
    ) {
        self.req_to_sub.insert(req_id, sub_id);
        self.sub_to_req.insert(sub_id, req_id);
        self.sub_owner.insert(
            sub_id,
            SubOwner {
                client_id,
                key: key.clone(),
            },
        );
        self.client_to_subs
            .entry(client_id)
            .or_default()
            .insert(sub_id);
        self.instrument_to_subs
            .entry(key.clone())
            .or_default()
            .insert(sub_id);
    }

    /// Swap a subscription onto a fresh request id (resubscribe after
    /// reconnect). The stale request id stops routing immediately.
    pub fn rebind(&self, sub_id: SubId, new_req_id: ReqId) {
        if let Some(old) = self.sub_to_req.insert(sub_id, new_req_id) {
            self.req_to_sub.remove(&old);
        }
        self.req_to_sub.insert(new_req_id, sub_id);
    }

    /// Remove every trace of a subscription.
    pub fn forget(&self, sub_id: SubId) {
        if let Some((_, req_id)) = self.sub_to_req.remove(&sub_id) {
            self.req_to_sub.remove(&req_id);
        }
        if let Some((_, owner)) = self.sub_owner.remove(&sub_id) {
            if let Some(subs) = self.client_to_subs.get(&owner.client_id) {
                subs.remove(&sub_id);
            }
            let now_empty = match self.instrument_to_subs.get(&owner.key) {
                Some(subs) => {
                    subs.remove(&sub_id);
                    subs.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.instrument_to_subs
                    .remove_if(&owner.key, |_, subs| subs.is_empty());
            }
        }
    }

    /// Drop a client's index entry once its subscriptions are forgotten.
    pub fn remove_client(&self, client_id: ClientId) {
        self.client_to_subs.remove(&client_id);
    }

    pub fn sub_for_req(&self, req_id: ReqId) -> Option<SubId> {
        self.req_to_sub.get(&req_id).map(|entry| *entry)
    }

    pub fn req_for_sub(&self, sub_id: SubId) -> Option<ReqId> {
        self.sub_to_req.get(&sub_id).map(|entry| *entry)
    }

    pub fn subs_for_client(&self, client_id: ClientId) -> Vec<SubId> {
        self.client_to_subs
            .get(&client_id)
            .map(|subs| subs.iter().map(|s| *s).collect())
            .unwrap_or_default()
    }

    /// Diagnostic aggregation: every live subscription for an instrument.
    pub fn subs_for_instrument(&self, key: &InstrumentKey) -> Vec<SubId> {
        self.instrument_to_subs
            .get(key)
            .map(|subs| subs.iter().map(|s| *s).collect())
            .unwrap_or_default()
    }

    pub fn insert_order(&self, order_id: OrderId, client_id: ClientId) {
        self.order_to_client.insert(order_id, client_id);
    }

    pub fn remove_order(&self, order_id: OrderId) {
        self.order_to_client.remove(&order_id);
    }

    pub fn client_for_order(&self, order_id: OrderId) -> Option<ClientId> {
        self.order_to_client.get(&order_id).map(|entry| *entry)
    }

    pub fn live_sub_count(&self) -> usize {
        self.sub_to_req.len()
    }

    /// True when no table references the client or any of its subscriptions.
    pub fn is_clean_of_client(&self, client_id: ClientId) -> bool {
        if self.client_to_subs.contains_key(&client_id) {
            return false;
        }
        if self
            .order_to_client
            .iter()
            .any(|entry| *entry.value() == client_id)
        {
            return false;
        }
        !self
            .sub_owner
            .iter()
            .any(|entry| entry.value().client_id == client_id)
    }
}

impl Default for RoutingTables {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Instrument, InstrumentKind};
    use uuid::Uuid;

    fn key(symbol: &str) -> InstrumentKey {
        Instrument::new(symbol, InstrumentKind::Stock)
            .canonicalize()
            .identity()
    }

    #[test]
    fn bind_forms_a_bijection() {
        let tables = RoutingTables::new();
        let client = Uuid::new_v4();
        let sub = Uuid::new_v4();
        tables.insert_sub(sub, 1, client, &key("AAPL"));

        assert_eq!(tables.sub_for_req(1), Some(sub));
        assert_eq!(tables.req_for_sub(sub), Some(1));
        assert_eq!(tables.subs_for_client(client), vec![sub]);
        assert_eq!(tables.subs_for_instrument(&key("AAPL")), vec![sub]);
    }

    #[test]
    fn rebind_retires_the_old_req_id() {
        let tables = RoutingTables::new();
        let client = Uuid::new_v4();
        let sub = Uuid::new_v4();
        tables.insert_sub(sub, 1, client, &key("AAPL"));
        tables.rebind(sub, 7);

        assert_eq!(tables.sub_for_req(1), None);
        assert_eq!(tables.sub_for_req(7), Some(sub));
        assert_eq!(tables.req_for_sub(sub), Some(7));
    }

    #[test]
    fn forget_removes_every_trace() {
        let tables = RoutingTables::new();
        let client = Uuid::new_v4();
        let sub = Uuid::new_v4();
        tables.insert_sub(sub, 1, client, &key("AAPL"));
        tables.forget(sub);

        assert_eq!(tables.sub_for_req(1), None);
        assert_eq!(tables.req_for_sub(sub), None);
        assert!(tables.subs_for_client(client).is_empty());
        assert!(tables.subs_for_instrument(&key("AAPL")).is_empty());
        assert_eq!(tables.live_sub_count(), 0);
    }

    #[test]
    fn client_cleanup_leaves_no_references() {
        let tables = RoutingTables::new();
        let client = Uuid::new_v4();
        let other = Uuid::new_v4();
        let subs: Vec<SubId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, sub) in subs.iter().enumerate() {
            tables.insert_sub(*sub, i as i64 + 1, client, &key("MSFT"));
        }
        let other_sub = Uuid::new_v4();
        tables.insert_sub(other_sub, 99, other, &key("MSFT"));
        tables.insert_order(2001, client);

        for sub in &subs {
            tables.forget(*sub);
        }
        tables.remove_order(2001);
        tables.remove_client(client);

        assert!(tables.is_clean_of_client(client));
        // The other client's subscription survives.
        assert_eq!(tables.sub_for_req(99), Some(other_sub));
    }
}
