use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Taker side of a trade, derived from the venue's buyer-is-maker flag:
/// buyer-is-maker implies the taker sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Immutable value emitted by the ingestor for every taker trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub exchange: String,
    /// Uppercase venue symbol, e.g. `BTCUSDT`.
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub amount: f64,
    /// Millisecond wall-clock timestamp supplied by the venue.
    pub trade_time_ms: i64,
    /// Opaque, unique per (exchange, symbol).
    pub trade_id: i64,
}

impl TradeEvent {
    /// Build a trade event, computing `amount = price * quantity`.
    ///
    /// Returns `None` for non-positive price/quantity (rejected before
    /// aggregation per the boundary behaviour rule).
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        price: f64,
        quantity: f64,
        trade_time_ms: i64,
        trade_id: i64,
    ) -> Option<Self> {
        if price <= 0.0 || quantity <= 0.0 {
            return None;
        }
        Some(Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            side,
            price,
            quantity,
            amount: price * quantity,
            trade_time_ms,
            trade_id,
        })
    }

    pub fn trade_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.trade_time_ms).unwrap_or_else(Utc::now)
    }
}

/// Connection lifecycle of the WebSocket ingestor. See the transition table
/// owned by `RecoveryManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Severity attached to a recorded error event in the `RecoveryManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Entry stored in a `SlidingAggregator` window. Eviction compares
/// `trade_time_ms` against a wall-clock `now`, not against the most
/// recently inserted trade, so idle windows still expire.
#[derive(Debug, Clone, Copy)]
pub struct WindowEntry {
    pub trade_time_ms: i64,
    pub usd_value: f64,
    pub side: Side,
}

/// Per-(symbol, side) or combined snapshot of a sliding window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSummary {
    pub count: usize,
    pub total_usd: f64,
    pub buy_usd: f64,
    pub sell_usd: f64,
    pub oldest_ms: Option<i64>,
    pub newest_ms: Option<i64>,
}

impl WindowSummary {
    pub const EMPTY: Self = Self {
        count: 0,
        total_usd: 0.0,
        buy_usd: 0.0,
        sell_usd: 0.0,
        oldest_ms: None,
        newest_ms: None,
    };
}

/// Which detector produced a `ThresholdEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorKind {
    Single,
    Cumulative,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "SINGLE"),
            Self::Cumulative => write!(f, "CUMULATIVE"),
        }
    }
}

/// Internal hand-off between a detector and the `Suppressor`.
#[derive(Debug, Clone)]
pub struct ThresholdEvent {
    pub kind: DetectorKind,
    pub symbol: String,
    pub side: Side,
    pub total_usd: f64,
    pub buy_usd: f64,
    pub sell_usd: f64,
    pub trade_count: usize,
    pub window_duration_ms: i64,
    pub observed_at: DateTime<Utc>,
}

/// `(kind, symbol, side)` -- the cooldown suppression key. Each kind and
/// direction suppress independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub kind: DetectorKind,
    pub symbol: String,
    pub side: Side,
}

impl CooldownKey {
    pub fn new(kind: DetectorKind, symbol: impl Into<String>, side: Side) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            side,
        }
    }
}

impl fmt::Display for CooldownKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.symbol, self.side)
    }
}

/// What the `Dispatcher` consumes: a `ThresholdEvent` plus the message
/// rendered at enqueue time (so it reflects the world when the threshold
/// crossed, not when it was eventually sent).
#[derive(Debug, Clone)]
pub struct Alert {
    pub event: ThresholdEvent,
    pub rendered_message: String,
}

/// Splits a venue symbol like `BTCUSDT` into a human-readable `BTC/USDT`.
///
/// Mirrors the exact (imperfect for 3/3 pairs like `ETHBTC`) heuristic the
/// original alert dispatcher used: try common quote lengths shortest-first.
/// This is purely cosmetic and never feeds back into detection logic.
pub fn display_symbol(symbol: &str) -> String {
    let symbol = symbol.replace('-', "");
    for len in [4usize, 5, 6] {
        if symbol.len() >= len {
            let (base, quote) = symbol.split_at(symbol.len() - len);
            return format!("{base}/{quote}");
        }
    }
    symbol
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_event_rejects_non_positive_price_or_quantity() {
        assert!(TradeEvent::new("binance", "BTCUSDT", Side::Buy, 0.0, 1.0, 0, 1).is_none());
        assert!(TradeEvent::new("binance", "BTCUSDT", Side::Buy, 1.0, 0.0, 0, 1).is_none());
        assert!(TradeEvent::new("binance", "BTCUSDT", Side::Buy, -1.0, 1.0, 0, 1).is_none());
    }

    #[test]
    fn trade_event_computes_amount() {
        let t = TradeEvent::new("binance", "BTCUSDT", Side::Buy, 50_000.0, 2.0, 0, 1).unwrap();
        assert_eq!(t.amount, 100_000.0);
    }

    #[test]
    fn cooldown_key_display_is_stable() {
        let key = CooldownKey::new(DetectorKind::Cumulative, "BTCUSDT", Side::Buy);
        assert_eq!(key.to_string(), "CUMULATIVE:BTCUSDT:BUY");
    }

    #[test]
    fn display_symbol_splits_seven_char_usdt_pair() {
        assert_eq!(display_symbol("BTCUSDT"), "BTC/USDT");
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }
}
