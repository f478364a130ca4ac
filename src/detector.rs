use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use crate::aggregator::SlidingAggregator;
use crate::model::{DetectorKind, Side, ThresholdEvent, TradeEvent};

/// Per-trade synchronous quantity check. Symbols absent from `thresholds`
/// are not monitored.
pub struct SingleDetector {
    thresholds: HashMap<String, f64>,
}

impl SingleDetector {
    pub fn new(thresholds: HashMap<String, f64>) -> Self {
        Self { thresholds }
    }

    /// Every `TradeEvent` here is already taker-side by construction (see
    /// §3: resting-order matches are filtered upstream), so the only check
    /// left is the quantity threshold. `usd_value` is the caller's
    /// already-converted USD notional (`PriceConverter::to_usd`) rather
    /// than `trade.amount`, so the alert's dollar figure is correct for
    /// non-USD-quoted symbols too.
    pub fn check(&self, trade: &TradeEvent, usd_value: f64) -> Option<ThresholdEvent> {
        let threshold = *self.thresholds.get(&trade.symbol)?;
        if trade.quantity < threshold {
            return None;
        }
        Some(ThresholdEvent {
            kind: DetectorKind::Single,
            symbol: trade.symbol.clone(),
            side: trade.side,
            total_usd: usd_value,
            buy_usd: if trade.side == Side::Buy { usd_value } else { 0.0 },
            sell_usd: if trade.side == Side::Sell { usd_value } else { 0.0 },
            trade_count: 1,
            window_duration_ms: 0,
            observed_at: trade.trade_time(),
        })
    }
}

/// Invoked after every aggregator update. Fires when the side-scoped
/// window has `count >= min_orders` and `total_usd >= threshold_usd`.
///
/// Two independently configured instances can coexist over the same
/// aggregator stream (the "taker" flavour and the "large order" flavour)
/// with different windows/thresholds.
pub struct CumulativeDetector {
    min_orders: usize,
    threshold_usd: f64,
    monitored_symbols: Option<Vec<String>>,
}

impl CumulativeDetector {
    pub fn new(min_orders: usize, threshold_usd: f64, monitored_symbols: Option<Vec<String>>) -> Self {
        Self {
            min_orders,
            threshold_usd,
            monitored_symbols,
        }
    }

    fn is_monitored(&self, symbol: &str) -> bool {
        match &self.monitored_symbols {
            Some(symbols) => symbols.iter().any(|s| s == symbol),
            None => true,
        }
    }

    /// Check both sides for `symbol` against `aggregator`'s current
    /// window. If both BUY and SELL cross in the same tick, both events
    /// are emitted -- they are independently suppressed downstream.
    pub fn check(&self, aggregator: &SlidingAggregator, symbol: &str) -> Vec<ThresholdEvent> {
        if !self.is_monitored(symbol) {
            return Vec::new();
        }

        [Side::Buy, Side::Sell]
            .into_iter()
            .filter_map(|side| self.check_side(aggregator, symbol, side))
            .collect()
    }

    fn check_side(
        &self,
        aggregator: &SlidingAggregator,
        symbol: &str,
        side: Side,
    ) -> Option<ThresholdEvent> {
        let summary = aggregator.summary_side(symbol, side);
        if summary.count < self.min_orders || summary.total_usd < self.threshold_usd {
            return None;
        }

        Some(ThresholdEvent {
            kind: DetectorKind::Cumulative,
            symbol: symbol.to_string(),
            side,
            total_usd: summary.total_usd,
            buy_usd: summary.buy_usd,
            sell_usd: summary.sell_usd,
            trade_count: summary.count,
            window_duration_ms: aggregator.window().as_millis() as i64,
            observed_at: Utc::now(),
        })
    }
}
