//! Shared domain types for the MarketBridge gateway.
//!
//! Everything in this crate is transport-agnostic: instrument descriptors and
//! their canonicalization rules, the monotonic id allocator, and the typed
//! request/event surface of the upstream brokerage protocol.

pub mod ids;
pub mod instrument;
pub mod upstream;

pub use ids::{ClientId, IdAllocator, OrderId, ReqId, SubId};
pub use instrument::{Instrument, InstrumentKey, InstrumentKind};
pub use upstream::{
    ContractDescriptor, OrderKind, PriceTick, Severity, Side, SizeTick, StreamKind, UpstreamEvent,
    UpstreamRequest,
};

/// Current wall-clock time as fractional UNIX seconds, the timestamp format
/// used on every client-facing message.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
