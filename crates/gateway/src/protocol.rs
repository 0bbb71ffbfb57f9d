//! JSON wire protocol between browser clients and the gateway.
//!
//! Inbound frames are discriminated by `command`, outbound frames by `type`.
//! Timestamps are fractional UNIX seconds everywhere.

use common::instrument::detect_kind;
use common::upstream::{ContractDescriptor, OrderKind, Severity, Side};
use common::{unix_now, Instrument, InstrumentKind, OrderId, ReqId};
use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// Command sent by a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    SubscribeMarketData(SubscribeParams),
    SubscribeTimeAndSales(SubscribeParams),
    SubscribeBidAsk(SubscribeParams),
    UnsubscribeMarketData { symbol: String },
    PlaceOrder(PlaceOrderParams),
    CancelOrder { order_id: OrderId },
    GetContractDetails(LookupParams),
}

fn default_instrument_type() -> InstrumentKind {
    InstrumentKind::Stock
}

/// Instrument fields shared by the subscribe commands.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeParams {
    pub symbol: String,
    #[serde(default = "default_instrument_type")]
    pub instrument_type: InstrumentKind,
    pub exchange: Option<String>,
    pub currency: Option<String>,
    /// `YYYYMM`; also accepted under the legacy name `expiry`.
    #[serde(alias = "expiry")]
    pub contract_month: Option<String>,
    pub last_trade_date: Option<String>,
}

impl SubscribeParams {
    /// Resolve the request into a canonical instrument. Symbols typed as
    /// stocks are upgraded when they are well-known futures roots or forex
    /// pairs.
    pub fn instrument(&self) -> std::result::Result<Instrument, CommandError> {
        let symbol = self.symbol.trim();
        if symbol.is_empty() {
            return Err(CommandError::BadRequest("symbol is required".to_string()));
        }
        let mut kind = self.instrument_type;
        if kind == InstrumentKind::Stock {
            kind = detect_kind(symbol);
        }
        let mut instrument = Instrument::new(symbol, kind);
        instrument.exchange = self.exchange.clone();
        instrument.currency = self.currency.clone();
        instrument.contract_month = self
            .contract_month
            .clone()
            .or_else(|| self.last_trade_date.clone());
        Ok(instrument.canonicalize())
    }
}

/// Fields of a `place_order` command.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrderParams {
    pub symbol: String,
    pub action: Side,
    pub quantity: i64,
    #[serde(default = "default_order_type")]
    pub order_type: OrderKind,
    pub price: Option<f64>,
    #[serde(default = "default_instrument_type")]
    pub instrument_type: InstrumentKind,
    pub exchange: Option<String>,
    pub currency: Option<String>,
    #[serde(alias = "expiry")]
    pub contract_month: Option<String>,
}

fn default_order_type() -> OrderKind {
    OrderKind::Market
}

impl PlaceOrderParams {
    pub fn instrument(&self) -> std::result::Result<Instrument, CommandError> {
        let symbol = self.symbol.trim();
        if symbol.is_empty() {
            return Err(CommandError::BadRequest("symbol is required".to_string()));
        }
        let mut instrument = Instrument::new(symbol, self.instrument_type);
        instrument.exchange = self.exchange.clone();
        instrument.currency = self.currency.clone();
        instrument.contract_month = self.contract_month.clone();
        Ok(instrument.canonicalize())
    }
}

/// Fields of a `get_contract_details` command.
#[derive(Debug, Clone, Deserialize)]
pub struct LookupParams {
    pub symbol: String,
    #[serde(default = "default_instrument_type")]
    pub instrument_type: InstrumentKind,
    pub exchange: Option<String>,
    pub currency: Option<String>,
}

impl LookupParams {
    pub fn instrument(&self) -> std::result::Result<Instrument, CommandError> {
        let symbol = self.symbol.trim();
        if symbol.is_empty() {
            return Err(CommandError::BadRequest("symbol is required".to_string()));
        }
        let mut instrument = Instrument::new(symbol, self.instrument_type);
        instrument.exchange = self.exchange.clone();
        instrument.currency = self.currency.clone();
        Ok(instrument.canonicalize())
    }
}

/// Upstream-connection state as surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Connecting,
    ShuttingDown,
}

/// Payload classification for `market_data` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Price,
    Size,
    #[serde(rename = "string")]
    Text,
}

/// Message sent to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionStatus {
        status: ConnectionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_order_id: Option<OrderId>,
        timestamp: f64,
    },
    MarketData {
        symbol: String,
        req_id: ReqId,
        data_type: DataType,
        tick_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        price: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        timestamp: f64,
    },
    TimeAndSales {
        symbol: String,
        req_id: ReqId,
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
        timestamp: f64,
    },
    BidAskTick {
        symbol: String,
        req_id: ReqId,
        bid_price: f64,
        ask_price: f64,
        bid_size: f64,
        ask_size: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        bid_past_low: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ask_past_high: Option<bool>,
        timestamp: f64,
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
        timestamp: f64,
    },
    ContractDetails {
        req_id: ReqId,
        contract: ContractDescriptor,
        #[serde(skip_serializing_if = "Option::is_none")]
        market_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        min_tick: Option<f64>,
        timestamp: f64,
    },
    ContractDetailsEnd {
        req_id: ReqId,
        timestamp: f64,
    },
    Error {
        severity: Severity,
        error_code: String,
        error_string: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<ReqId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        order_id: Option<OrderId>,
        timestamp: f64,
    },
}

impl ServerMessage {
    /// Messages that must never be dropped from a client's outbound queue.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ServerMessage::OrderStatus { .. }
                | ServerMessage::ConnectionStatus { .. }
                | ServerMessage::Error { .. }
        )
    }

    pub fn connection_status(status: ConnectionStatus, next_order_id: Option<OrderId>) -> Self {
        ServerMessage::ConnectionStatus {
            status,
            next_order_id,
            timestamp: unix_now(),
        }
    }

    pub fn command_error(err: &CommandError) -> Self {
        ServerMessage::Error {
            severity: Severity::Error,
            error_code: err.code().to_string(),
            error_string: err.to_string(),
            req_id: None,
            order_id: None,
            timestamp: unix_now(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            severity: Severity::Error,
            error_code: "bad_request".to_string(),
            error_string: message.into(),
            req_id: None,
            order_id: None,
            timestamp: unix_now(),
        }
    }

    pub fn subscription_failed(message: impl Into<String>, req_id: Option<ReqId>) -> Self {
        ServerMessage::Error {
            severity: Severity::Error,
            error_code: "subscription_failed".to_string(),
            error_string: message.into(),
            req_id,
            order_id: None,
            timestamp: unix_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_command_parses_with_defaults() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"command":"subscribe_market_data","symbol":"AAPL","instrument_type":"stock"}"#,
        )
        .unwrap();
        let ClientCommand::SubscribeMarketData(params) = cmd else {
            panic!("wrong variant");
        };
        let instrument = params.instrument().unwrap();
        assert_eq!(instrument.symbol, "AAPL");
        assert_eq!(instrument.kind, InstrumentKind::Stock);
        assert_eq!(instrument.exchange.as_deref(), Some("SMART"));
    }

    #[test]
    fn subscribe_command_upgrades_known_futures_roots() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"command":"subscribe_market_data","symbol":"es","instrument_type":"stock"}"#,
        )
        .unwrap();
        let ClientCommand::SubscribeMarketData(params) = cmd else {
            panic!("wrong variant");
        };
        let instrument = params.instrument().unwrap();
        assert_eq!(instrument.kind, InstrumentKind::Future);
        assert_eq!(instrument.exchange.as_deref(), Some("CME"));
    }

    #[test]
    fn subscribe_accepts_the_legacy_expiry_alias() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"command":"subscribe_market_data","symbol":"ES","instrument_type":"future","expiry":"202609"}"#,
        )
        .unwrap();
        let ClientCommand::SubscribeMarketData(params) = cmd else {
            panic!("wrong variant");
        };
        assert_eq!(params.contract_month.as_deref(), Some("202609"));
    }

    #[test]
    fn place_order_rejects_string_prices() {
        let result = serde_json::from_str::<ClientCommand>(
            r#"{"command":"place_order","symbol":"AAPL","action":"BUY","quantity":100,"order_type":"LMT","price":"150.00","instrument_type":"stock"}"#,
        );
        assert!(result.is_err(), "price must be a JSON number");
    }

    #[test]
    fn unknown_commands_fail_to_parse() {
        assert!(
            serde_json::from_str::<ClientCommand>(r#"{"command":"reboot_universe"}"#).is_err()
        );
    }

    #[test]
    fn market_data_message_matches_the_wire_shape() {
        let msg = ServerMessage::MarketData {
            symbol: "AAPL".to_string(),
            req_id: 1,
            data_type: DataType::Price,
            tick_type: "last".to_string(),
            price: Some(150.25),
            size: None,
            value: None,
            timestamp: 1_700_000_000.5,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "market_data",
                "symbol": "AAPL",
                "req_id": 1,
                "data_type": "price",
                "tick_type": "last",
                "price": 150.25,
                "timestamp": 1_700_000_000.5,
            })
        );
    }

    #[test]
    fn error_message_carries_uppercase_severity() {
        let msg = ServerMessage::command_error(&CommandError::DuplicateSubscription);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["severity"], "ERROR");
        assert_eq!(value["error_code"], "duplicate_subscription");
    }

    #[test]
    fn criticality_covers_exactly_the_protected_kinds() {
        assert!(ServerMessage::connection_status(ConnectionStatus::Connected, None).is_critical());
        assert!(ServerMessage::bad_request("nope").is_critical());
        let tick = ServerMessage::MarketData {
            symbol: "AAPL".into(),
            req_id: 1,
            data_type: DataType::Size,
            tick_type: "volume".into(),
            price: None,
            size: Some(10.0),
            value: None,
            timestamp: 0.0,
        };
        assert!(!tick.is_critical());
    }
}
