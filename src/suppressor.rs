use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cooldown::CooldownRegistry;
use crate::model::{Alert, CooldownKey, DetectorKind, ThresholdEvent, display_symbol};

/// Sits between the detectors and the `Dispatcher`. Drops events whose
/// `CooldownKey` is still suppressed; otherwise marks the cooldown *before*
/// handing off, so a second crossing that arrives while dispatch is still
/// pending is still suppressed.
pub struct Suppressor {
    registry: CooldownRegistry,
    single_cooldown: Duration,
    cumulative_cooldown: Duration,
    suppressed: AtomicU64,
}

impl Suppressor {
    pub fn new(single_cooldown: Duration, cumulative_cooldown: Duration) -> Self {
        Self {
            registry: CooldownRegistry::new(),
            single_cooldown,
            cumulative_cooldown,
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(Alert)` when the event should be forwarded to the
    /// dispatcher, `None` when it was suppressed.
    pub fn process(&self, event: ThresholdEvent) -> Option<Alert> {
        let key = CooldownKey::new(event.kind, event.symbol.clone(), event.side);
        if self.registry.in_cooldown(&key) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let cooldown = match event.kind {
            DetectorKind::Single => self.single_cooldown,
            DetectorKind::Cumulative => self.cumulative_cooldown,
        };
        self.registry.mark(key, cooldown);

        let rendered_message = render(&event);
        Some(Alert {
            event,
            rendered_message,
        })
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn active_cooldowns(&self) -> usize {
        self.registry.active_count()
    }
}

fn render(event: &ThresholdEvent) -> String {
    let symbol = display_symbol(&event.symbol);
    match event.kind {
        DetectorKind::Single => format!(
            "[SINGLE] {symbol} {side} ${amount:.0} @ {observed}",
            side = event.side,
            amount = event.total_usd,
            observed = event.observed_at.format("%H:%M:%S"),
        ),
        DetectorKind::Cumulative => format!(
            "[CUMULATIVE] {symbol} {side} {count} orders, ${total:.0} over {window}s (buy=${buy:.0} sell=${sell:.0})",
            side = event.side,
            count = event.trade_count,
            total = event.total_usd,
            window = event.window_duration_ms / 1000,
            buy = event.buy_usd,
            sell = event.sell_usd,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Side;
    use chrono::Utc;

    fn event(kind: DetectorKind, side: Side) -> ThresholdEvent {
        ThresholdEvent {
            kind,
            symbol: "BTCUSDT".into(),
            side,
            total_usd: 2_000_000.0,
            buy_usd: 2_000_000.0,
            sell_usd: 0.0,
            trade_count: 5,
            window_duration_ms: 300_000,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn second_crossing_within_cooldown_is_suppressed() {
        let suppressor = Suppressor::new(Duration::from_secs(60), Duration::from_secs(300));
        assert!(
            suppressor
                .process(event(DetectorKind::Cumulative, Side::Buy))
                .is_some()
        );
        assert!(
            suppressor
                .process(event(DetectorKind::Cumulative, Side::Buy))
                .is_none()
        );
        assert_eq!(suppressor.suppressed_count(), 1);
    }

    #[test]
    fn buy_and_sell_cooldowns_are_independent() {
        let suppressor = Suppressor::new(Duration::from_secs(60), Duration::from_secs(300));
        assert!(
            suppressor
                .process(event(DetectorKind::Cumulative, Side::Buy))
                .is_some()
        );
        assert!(
            suppressor
                .process(event(DetectorKind::Cumulative, Side::Sell))
                .is_some()
        );
    }

    #[test]
    fn single_and_cumulative_cooldowns_are_independent() {
        let suppressor = Suppressor::new(Duration::from_secs(60), Duration::from_secs(300));
        assert!(
            suppressor
                .process(event(DetectorKind::Single, Side::Buy))
                .is_some()
        );
        assert!(
            suppressor
                .process(event(DetectorKind::Cumulative, Side::Buy))
                .is_some()
        );
    }

    #[test]
    fn zero_cooldown_never_suppresses() {
        let suppressor = Suppressor::new(Duration::ZERO, Duration::ZERO);
        for _ in 0..5 {
            assert!(
                suppressor
                    .process(event(DetectorKind::Single, Side::Buy))
                    .is_some()
            );
        }
    }
}
