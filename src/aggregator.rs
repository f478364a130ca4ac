use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{Side, WindowEntry, WindowSummary};

/// Per-symbol sliding window of taker volume, split by side.
///
/// Mutated only from the WebSocket receive loop (single-writer, no
/// internal lock) per the concurrency model: the aggregator is called
/// synchronously on the hot path and must never block.
///
/// Both the combined `summary` and the side-scoped `summary_side` read from
/// the same two deques, so a single instance serves both the plain
/// "total pressure" view and the side-keyed cumulative-detector view -- a 5
/// order BUY threshold is never satisfied by 3 BUY + 2 SELL because each
/// side's count/sum only ever sees its own deque.
pub struct SlidingAggregator {
    window: Duration,
    per_symbol: HashMap<String, SymbolWindow>,
}

#[derive(Default)]
struct SymbolWindow {
    buy: VecDeque<WindowEntry>,
    sell: VecDeque<WindowEntry>,
}

impl SlidingAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            per_symbol: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Append an entry and evict everything in its side's deque older than
    /// `now - window`. `now` is supplied by the caller (real wall clock on
    /// the hot path, or a fixed instant in tests) rather than derived from
    /// the entry itself, so idle windows still expire under periodic
    /// cleanup even without new trades.
    pub fn add(&mut self, symbol: &str, entry: WindowEntry, now: DateTime<Utc>) {
        let slot = self.per_symbol.entry(symbol.to_string()).or_default();
        let deque = match entry.side {
            Side::Buy => &mut slot.buy,
            Side::Sell => &mut slot.sell,
        };
        deque.push_back(entry);
        evict(deque, now, self.window);
    }

    /// Evict expired entries for every tracked symbol without inserting
    /// anything. Used by the periodic cleanup task so windows shrink even
    /// when a symbol goes quiet.
    pub fn evict_all(&mut self, now: DateTime<Utc>) {
        for slot in self.per_symbol.values_mut() {
            evict(&mut slot.buy, now, self.window);
            evict(&mut slot.sell, now, self.window);
        }
        self.per_symbol.retain(|_, slot| !slot.buy.is_empty() || !slot.sell.is_empty());
    }

    /// Combined buy+sell summary for a symbol.
    pub fn summary(&self, symbol: &str) -> WindowSummary {
        let Some(slot) = self.per_symbol.get(symbol) else {
            return WindowSummary::EMPTY;
        };
        combine(&slot.buy, &slot.sell)
    }

    /// Side-scoped summary, used by the cumulative detector so opposite
    /// sides never contribute to the same threshold check.
    pub fn summary_side(&self, symbol: &str, side: Side) -> WindowSummary {
        let Some(slot) = self.per_symbol.get(symbol) else {
            return WindowSummary::EMPTY;
        };
        let deque = match side {
            Side::Buy => &slot.buy,
            Side::Sell => &slot.sell,
        };
        summarize(deque)
    }

    /// Clear one side's window for a symbol. Called (optionally) by the
    /// dispatcher after a successful cumulative-alert send, to stop the
    /// same accumulated pressure from re-triggering the instant the
    /// cooldown elapses. Advisory, never mandatory.
    pub fn reset(&mut self, symbol: &str, side: Side) {
        if let Some(slot) = self.per_symbol.get_mut(symbol) {
            match side {
                Side::Buy => slot.buy.clear(),
                Side::Sell => slot.sell.clear(),
            }
        }
    }
}

fn evict(deque: &mut VecDeque<WindowEntry>, now: DateTime<Utc>, window: Duration) {
    let cutoff_ms = now.timestamp_millis() - window.as_millis() as i64;
    while let Some(front) = deque.front() {
        if front.trade_time_ms < cutoff_ms {
            deque.pop_front();
        } else {
            break;
        }
    }
}

fn summarize(deque: &VecDeque<WindowEntry>) -> WindowSummary {
    if deque.is_empty() {
        return WindowSummary::EMPTY;
    }
    let mut buy_usd = 0.0;
    let mut sell_usd = 0.0;
    for e in deque {
        match e.side {
            Side::Buy => buy_usd += e.usd_value,
            Side::Sell => sell_usd += e.usd_value,
        }
    }
    WindowSummary {
        count: deque.len(),
        total_usd: buy_usd + sell_usd,
        buy_usd,
        sell_usd,
        oldest_ms: deque.front().map(|e| e.trade_time_ms),
        newest_ms: deque.back().map(|e| e.trade_time_ms),
    }
}

fn combine(buy: &VecDeque<WindowEntry>, sell: &VecDeque<WindowEntry>) -> WindowSummary {
    let buy_summary = summarize(buy);
    let sell_summary = summarize(sell);
    let oldest_ms = [buy_summary.oldest_ms, sell_summary.oldest_ms]
        .into_iter()
        .flatten()
        .min();
    let newest_ms = [buy_summary.newest_ms, sell_summary.newest_ms]
        .into_iter()
        .flatten()
        .max();
    WindowSummary {
        count: buy_summary.count + sell_summary.count,
        total_usd: buy_summary.total_usd + sell_summary.total_usd,
        buy_usd: buy_summary.buy_usd,
        sell_usd: sell_summary.sell_usd,
        oldest_ms,
        newest_ms,
    }
}
