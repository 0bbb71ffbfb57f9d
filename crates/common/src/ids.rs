//! Process-wide identifier allocation.

use std::sync::atomic::{AtomicI64, Ordering};

use uuid::Uuid;

/// Unique identifier for a connected WebSocket client.
pub type ClientId = Uuid;

/// Unique identifier for a subscription record.
pub type SubId = Uuid;

/// Correlates an outbound upstream request with the inbound events it produces.
pub type ReqId = i64;

/// Order identifier, seeded from the upstream handshake.
pub type OrderId = i64;

/// Allocator for request and order ids.
///
/// Request ids start at 1 and are never recycled. Order ids are handed out
/// above a floor raised by every handshake, so locally allocated ids stay
/// valid from the brokerage's point of view across reconnects.
pub struct IdAllocator {
    next_req_id: AtomicI64,
    next_order_id: AtomicI64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_req_id: AtomicI64::new(1),
            next_order_id: AtomicI64::new(1),
        }
    }

    /// Allocate the next request id.
    pub fn next_req_id(&self) -> ReqId {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Raise the order-id floor to the `next_order_id` received at handshake.
    ///
    /// Never lowers the counter: ids allocated since the previous handshake
    /// stay ahead of anything the upstream will accept.
    pub fn observe_order_id_floor(&self, floor: OrderId) {
        self.next_order_id.fetch_max(floor, Ordering::Relaxed);
    }

    /// Allocate the next order id.
    pub fn next_order_id(&self) -> OrderId {
        self.next_order_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
