//! Instrument descriptors and canonicalization rules.
//!
//! A client may subscribe with nothing more than a symbol; the gateway fills
//! in the routing exchange and currency by instrument kind, upgrades the kind
//! for well-known futures roots and forex pairs, and resolves a futures front
//! month when no contract month was given.

use std::fmt;

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Security type of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Stock,
    Option,
    Future,
    Forex,
    Index,
    Crypto,
}

impl InstrumentKind {
    /// Default routing exchange when the client does not name one.
    pub fn default_exchange(self) -> &'static str {
        match self {
            InstrumentKind::Stock | InstrumentKind::Option => "SMART",
            InstrumentKind::Future => "CME",
            InstrumentKind::Forex => "IDEALPRO",
            InstrumentKind::Index => "CBOE",
            InstrumentKind::Crypto => "PAXOS",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentKind::Stock => "stock",
            InstrumentKind::Option => "option",
            InstrumentKind::Future => "future",
            InstrumentKind::Forex => "forex",
            InstrumentKind::Index => "index",
            InstrumentKind::Crypto => "crypto",
        };
        f.write_str(name)
    }
}

/// An instrument as requested by a client. Immutable once canonicalized,
/// except that a futures contract month may be filled in by front-month
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub kind: InstrumentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// `YYYYMM` or `YYYYMMDD`; futures only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_month: Option<String>,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, kind: InstrumentKind) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            exchange: None,
            currency: None,
            contract_month: None,
        }
    }

    /// Canonical form used for duplicate detection and upstream requests:
    /// uppercased symbol, defaulted exchange and currency.
    pub fn canonicalize(mut self) -> Self {
        self.symbol = self.symbol.trim().to_ascii_uppercase();
        if self.exchange.is_none() {
            self.exchange = Some(self.kind.default_exchange().to_string());
        }
        if self.currency.is_none() {
            self.currency = Some("USD".to_string());
        }
        self
    }

    /// Map-key identity. Futures are distinct per contract month; everything
    /// else is identified by kind, symbol, and exchange.
    pub fn identity(&self) -> InstrumentKey {
        InstrumentKey {
            kind: self.kind,
            symbol: self.symbol.clone(),
            exchange: self.exchange.clone(),
            contract_month: if self.kind == InstrumentKind::Future {
                self.contract_month.clone()
            } else {
                None
            },
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.symbol, self.kind)?;
        if let Some(month) = &self.contract_month {
            write!(f, " {month}")?;
        }
        Ok(())
    }
}

/// Hashable identity of a canonical instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentKey {
    pub kind: InstrumentKind,
    pub symbol: String,
    pub exchange: Option<String>,
    pub contract_month: Option<String>,
}

/// Futures roots that clients habitually subscribe to as if they were stocks.
const FUTURES_ROOTS: &[&str] = &[
    // E-mini and micro E-mini index futures
    "ES", "NQ", "YM", "RTY", "MES", "MNQ", "MYM", "M2K",
    // Energy
    "CL", "NG", "RB", "HO", "BZ",
    // Metals
    "GC", "SI", "HG", "PL", "PA",
    // Agriculture
    "ZC", "ZS", "ZW", "ZL", "ZM", "KC", "SB", "CC", "CT",
    // Rates
    "ZB", "ZN", "ZF", "ZT",
    // Currencies
    "6E", "6B", "6J", "6A", "6C", "6S",
    // Livestock
    "LE", "GF", "HE",
];

/// Infer the instrument kind from a bare symbol: known futures roots become
/// futures, six-letter alphabetic symbols are treated as forex pairs, and
/// everything else stays a stock.
pub fn detect_kind(symbol: &str) -> InstrumentKind {
    let upper = symbol.trim().to_ascii_uppercase();
    if FUTURES_ROOTS.contains(&upper.as_str()) {
        return InstrumentKind::Future;
    }
    if upper.len() == 6 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
        return InstrumentKind::Forex;
    }
    InstrumentKind::Stock
}

/// Pick the front month from the contract months returned by a details
/// lookup: the nearest month that has not yet expired.
pub fn front_month<I>(months: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    front_month_on(months, Utc::now().date_naive())
}

fn front_month_on<I>(months: I, today: NaiveDate) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let current = today.year() as i64 * 100 + today.month() as i64;
    months
        .into_iter()
        .filter_map(|m| {
            // Contract months arrive as YYYYMM or YYYYMMDD.
            let yyyymm: i64 = m.get(..6)?.parse().ok()?;
            (yyyymm >= current).then_some((yyyymm, m))
        })
        .min()
        .map(|(_, m)| m)
}
