//! Typed surface of the upstream brokerage protocol.
//!
//! The vendor SDK is wrapped at the session boundary into these two enums:
//! [`UpstreamRequest`] is everything the gateway can ask of the brokerage,
//! [`UpstreamEvent`] is everything the brokerage can push back. Every event
//! that correlates to a request carries the request id it was issued under.

use serde::{Deserialize, Serialize};

use crate::ids::{OrderId, ReqId};
use crate::instrument::{Instrument, InstrumentKind};

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Order kind; wire names follow the brokerage convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    #[serde(rename = "MKT")]
    Market,
    #[serde(rename = "LMT")]
    Limit,
    #[serde(rename = "STP")]
    Stop,
}

impl OrderKind {
    /// Limit and stop orders carry a mandatory price.
    pub fn requires_price(self) -> bool {
        matches!(self, OrderKind::Limit | OrderKind::Stop)
    }
}

/// The three data streams a client can subscribe to per instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Level-1 ticks (`market_data` messages).
    Level1,
    /// Time and sales (`time_and_sales` messages).
    Trades,
    /// Tick-by-tick bid/ask (`bid_ask_tick` messages).
    Quotes,
}

impl StreamKind {
    pub fn subscribe_request(self, req_id: ReqId, instrument: Instrument) -> UpstreamRequest {
        match self {
            StreamKind::Level1 => UpstreamRequest::SubscribeMarketData { req_id, instrument },
            StreamKind::Trades => UpstreamRequest::SubscribeTrades { req_id, instrument },
            StreamKind::Quotes => UpstreamRequest::SubscribeQuotes { req_id, instrument },
        }
    }

    pub fn cancel_request(self, req_id: ReqId) -> UpstreamRequest {
        match self {
            StreamKind::Level1 => UpstreamRequest::CancelMarketData { req_id },
            StreamKind::Trades | StreamKind::Quotes => {
                UpstreamRequest::CancelTickByTick { req_id }
            }
        }
    }
}

/// Price tick classification for level-1 data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceTick {
    Bid,
    Ask,
    Last,
    High,
    Low,
    Open,
    Close,
    MarkPrice,
}

impl PriceTick {
    pub fn as_str(self) -> &'static str {
        match self {
            PriceTick::Bid => "bid",
            PriceTick::Ask => "ask",
            PriceTick::Last => "last",
            PriceTick::High => "high",
            PriceTick::Low => "low",
            PriceTick::Open => "open",
            PriceTick::Close => "close",
            PriceTick::MarkPrice => "mark_price",
        }
    }
}

/// Size tick classification for level-1 data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeTick {
    BidSize,
    AskSize,
    LastSize,
    Volume,
    AvgVolume,
}

impl SizeTick {
    pub fn as_str(self) -> &'static str {
        match self {
            SizeTick::BidSize => "bid_size",
            SizeTick::AskSize => "ask_size",
            SizeTick::LastSize => "last_size",
            SizeTick::Volume => "volume",
            SizeTick::AvgVolume => "avg_volume",
        }
    }
}

/// Outbound request to the brokerage session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UpstreamRequest {
    SubscribeMarketData {
        req_id: ReqId,
        instrument: Instrument,
    },
    CancelMarketData {
        req_id: ReqId,
    },
    SubscribeTrades {
        req_id: ReqId,
        instrument: Instrument,
    },
    SubscribeQuotes {
        req_id: ReqId,
        instrument: Instrument,
    },
    CancelTickByTick {
        req_id: ReqId,
    },
    ContractDetails {
        req_id: ReqId,
        instrument: Instrument,
    },
    PlaceOrder {
        order_id: OrderId,
        instrument: Instrument,
        side: Side,
        quantity: i64,
        kind: OrderKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        price: Option<f64>,
    },
    CancelOrder {
        order_id: OrderId,
    },
    /// Protocol-level keepalive probe.
    Ping,
    /// Clean session teardown.
    Logoff,
}

impl UpstreamRequest {
    /// The request id this request was issued under, if it has one.
    pub fn req_id(&self) -> Option<ReqId> {
        match self {
            UpstreamRequest::SubscribeMarketData { req_id, .. }
            | UpstreamRequest::CancelMarketData { req_id }
            | UpstreamRequest::SubscribeTrades { req_id, .. }
            | UpstreamRequest::SubscribeQuotes { req_id, .. }
            | UpstreamRequest::CancelTickByTick { req_id }
            | UpstreamRequest::ContractDetails { req_id, .. } => Some(*req_id),
            _ => None,
        }
    }
}

/// Contract description returned by a contract-details lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDescriptor {
    pub symbol: String,
    pub kind: InstrumentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_month: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub con_id: Option<i64>,
}

/// Inbound event decoded from the brokerage session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpstreamEvent {
    /// Handshake message: the next order id this session may use.
    NextOrderId { order_id: OrderId },
    TickPrice {
        req_id: ReqId,
        tick: PriceTick,
        price: f64,
    },
    TickSize {
        req_id: ReqId,
        tick: SizeTick,
        size: f64,
    },
    /// Generic string-valued tick (RT volume, timestamps, fundamentals).
    TickString {
        req_id: ReqId,
        tick: String,
        value: String,
    },
    Trade {
        req_id: ReqId,
        time: f64,
        price: f64,
        size: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        exchange: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        special_conditions: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        past_limit: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        unreported: Option<bool>,
    },
    BidAsk {
        req_id: ReqId,
        time: f64,
        bid_price: f64,
        ask_price: f64,
        bid_size: f64,
        ask_size: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        bid_past_low: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ask_past_high: Option<bool>,
    },
    OrderStatus {
        order_id: OrderId,
        status: String,
        filled: f64,
        remaining: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        avg_fill_price: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_fill_price: Option<f64>,
    },
    ContractDetails {
        req_id: ReqId,
        contract: ContractDescriptor,
        #[serde(skip_serializing_if = "Option::is_none")]
        market_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        min_tick: Option<f64>,
    },
    ContractDetailsEnd { req_id: ReqId },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<ReqId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        order_id: Option<OrderId>,
        code: i32,
        message: String,
    },
    /// Keepalive reply; consumed by the session, never routed.
    Pong,
}

/// Severity classes for vendor errors, as surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    /// Vendor code thresholds: codes below 2000 are errors, below 10000
    /// warnings, the rest informational notices.
    pub fn from_code(code: i32) -> Self {
        if code < 2000 {
            Severity::Error
        } else if code < 10_000 {
            Severity::Warning
        } else {
            Severity::Info
        }
    }

    /// An error-severity event terminates the subscription it names.
    pub fn is_fatal(self) -> bool {
        matches!(self, Severity::Error)
    }
}
