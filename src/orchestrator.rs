use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::SlidingAggregator;
use crate::archive::Archive;
use crate::config::AppConfig;
use crate::detector::{CumulativeDetector, SingleDetector};
use crate::dispatcher::{Dispatcher, RateLimiter};
use crate::ingest::binance::{BinanceIngestor, RestartableIngestor};
use crate::model::{Side, TradeEvent, WindowEntry};
use crate::price::PriceConverter;
use crate::recovery::{RecoveryConfig, RecoveryManager};
use crate::sink::Sink;
use crate::suppressor::Suppressor;

/// Snapshot of cross-component counters, the Rust analogue of the
/// original's scattered `get_stats()`/`get_status_report()` methods folded
/// into one structured type (§10 of the expanded spec).
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub trades_processed: u64,
    pub alerts_sent: u64,
    pub alerts_suppressed: u64,
    pub alerts_dropped: u64,
    pub ingestor_attempts: u64,
    pub ingestor_uptime_pct: f64,
    pub active_cooldowns: usize,
}

/// Owns exactly one instance of each pipeline singleton and runs the
/// per-trade hot path: Normaliser -> Router -> SingleDetector /
/// Aggregator -> CumulativeDetector -> Suppressor -> Dispatcher.
///
/// The taker and large-order cumulative flavours are two independently
/// configured `(SlidingAggregator, CumulativeDetector)` pairs over the same
/// trade stream, per §10's "dual threshold flavours" supplement.
pub struct Orchestrator {
    converter: Arc<PriceConverter>,
    taker_aggregator: Mutex<SlidingAggregator>,
    taker_detector: CumulativeDetector,
    large_order_aggregator: Mutex<SlidingAggregator>,
    large_order_detector: CumulativeDetector,
    single_detector: SingleDetector,
    /// Taker single- and cumulative-threshold alerts share this suppressor;
    /// the large-order flavour gets its own below. Both flavours tag their
    /// cumulative events with the same `DetectorKind::Cumulative`, so one
    /// shared `Suppressor` would collide the two flavours into a single
    /// `CooldownKey` namespace and `.max()` their cooldown durations
    /// together -- `examples/original_source`'s taker tracker and
    /// large-order detector each keep their own cooldown state
    /// independently, and this mirrors that split.
    taker_suppressor: Suppressor,
    large_order_suppressor: Suppressor,
    dispatcher: Arc<Dispatcher>,
    archive: Option<Arc<dyn Archive>>,
    reset_on_dispatch: bool,
    trades_processed: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: &AppConfig, sink: Box<dyn Sink>, archive: Option<Arc<dyn Archive>>) -> Self {
        let converter = Arc::new(PriceConverter::new(
            config.general.binance_rest_base_url.clone(),
            Duration::from_secs(config.price_cache.ttl_seconds),
        ));

        let taker_aggregator = Mutex::new(SlidingAggregator::new(Duration::from_secs(
            config.taker.cumulative.window_seconds,
        )));
        let taker_detector = CumulativeDetector::new(
            config.taker.cumulative.min_orders,
            config.taker.cumulative.threshold_usd,
            None,
        );

        let large_order_aggregator = Mutex::new(SlidingAggregator::new(Duration::from_secs(
            config.large_order.window_minutes * 60,
        )));
        let large_order_symbols = if config.large_order.symbols.is_empty() {
            None
        } else {
            Some(config.large_order.symbols.clone())
        };
        let large_order_detector = CumulativeDetector::new(1, config.large_order.threshold_usd, large_order_symbols);

        let single_detector = SingleDetector::new(
            config
                .taker
                .single_thresholds
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        );

        let taker_suppressor = Suppressor::new(
            Duration::from_secs(config.taker.cooldown.single),
            Duration::from_secs(config.taker.cooldown.cumulative),
        );
        // Large-order events are always `DetectorKind::Cumulative` and never
        // `Single`, so the single-cooldown half of this suppressor is dead
        // weight -- zero is correct, never consulted.
        let large_order_suppressor =
            Suppressor::new(Duration::ZERO, Duration::from_secs(config.large_order.cooldown_minutes * 60));

        let dispatcher = Arc::new(Dispatcher::new(
            sink,
            config.dispatcher.queue_capacity.unwrap_or(1024),
            RateLimiter::new(config.dispatcher.rate_limit_per_minute, Duration::from_secs(60)),
            Duration::from_secs(config.dispatcher.retry_delay_seconds),
        ));

        Self {
            converter,
            taker_aggregator,
            taker_detector,
            large_order_aggregator,
            large_order_detector,
            single_detector,
            taker_suppressor,
            large_order_suppressor,
            dispatcher,
            archive,
            reset_on_dispatch: config.dispatcher.reset_on_dispatch,
            trades_processed: AtomicU64::new(0),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Process one ingested trade through the full pipeline. Never returns
    /// an error: every fallible sub-step (price conversion, archival)
    /// degrades per its own documented boundary behaviour instead of
    /// aborting the pipeline for this trade.
    pub async fn handle_trade(&self, trade: TradeEvent) {
        self.trades_processed.fetch_add(1, Ordering::Relaxed);

        if let Some(archive) = &self.archive {
            if let Err(report) = archive.record_trade(&trade).await {
                warn!(error = ?report, symbol = trade.symbol, "trade archival failed");
            }
        }

        let usd_value = self.converter.to_usd(&trade.symbol, trade.price, trade.quantity).await;
        let now = Utc::now();

        if let Some(event) = self.single_detector.check(&trade, usd_value) {
            self.forward(event, &self.taker_suppressor).await;
        }

        let entry = WindowEntry {
            trade_time_ms: trade.trade_time_ms,
            usd_value,
            side: trade.side,
        };

        let taker_events = {
            let mut agg = self.taker_aggregator.lock();
            agg.add(&trade.symbol, entry, now);
            self.taker_detector.check(&agg, &trade.symbol)
        };
        for event in taker_events {
            let side = event.side;
            if self.forward(event, &self.taker_suppressor).await && self.reset_on_dispatch {
                self.taker_aggregator.lock().reset(&trade.symbol, side);
            }
        }

        let large_order_events = {
            let mut agg = self.large_order_aggregator.lock();
            agg.add(&trade.symbol, entry, now);
            self.large_order_detector.check(&agg, &trade.symbol)
        };
        for event in large_order_events {
            let side = event.side;
            if self.forward(event, &self.large_order_suppressor).await && self.reset_on_dispatch {
                self.large_order_aggregator.lock().reset(&trade.symbol, side);
            }
        }
    }

    /// Runs an event through the given suppressor and, if not suppressed,
    /// hands it to the dispatcher. Returns `true` if it was actually
    /// forwarded.
    async fn forward(&self, event: crate::model::ThresholdEvent, suppressor: &Suppressor) -> bool {
        let Some(alert) = suppressor.process(event) else {
            return false;
        };

        if let Some(archive) = &self.archive {
            if let Err(report) = archive.record_alert(&alert).await {
                warn!(error = ?report, "alert archival failed");
            }
        }

        self.dispatcher.enqueue(alert);
        true
    }

    /// Periodic maintenance: evict idle windows even for symbols that have
    /// gone quiet, so memory doesn't grow unbounded across a long run.
    pub fn evict_idle_windows(&self) {
        let now = Utc::now();
        self.taker_aggregator.lock().evict_all(now);
        self.large_order_aggregator.lock().evict_all(now);
    }

    pub fn stats(&self, recovery: &RecoveryManager) -> OrchestratorStats {
        OrchestratorStats {
            trades_processed: self.trades_processed.load(Ordering::Relaxed),
            alerts_sent: self.dispatcher.sent_count(),
            alerts_suppressed: self.taker_suppressor.suppressed_count() + self.large_order_suppressor.suppressed_count(),
            alerts_dropped: self.dispatcher.dropped_count() + self.dispatcher.failed_count(),
            ingestor_attempts: recovery.total_attempts(),
            ingestor_uptime_pct: recovery.uptime_percentage(),
            active_cooldowns: self.taker_suppressor.active_cooldowns() + self.large_order_suppressor.active_cooldowns(),
        }
    }
}

/// Wires a Binance ingestor, its `RecoveryManager`, and the `Orchestrator`
/// together, and drives the trade-receive loop until `shutdown` fires.
///
/// Breaks the Ingestor<->RecoveryManager cycle the naive design would have:
/// the manager holds `Arc<dyn Restartable>` (via `RestartableIngestor`),
/// never a concrete ingestor type, and the ingestor never holds the
/// manager at all.
pub async fn run(
    config: Arc<AppConfig>,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
) {
    let (trade_tx, mut trade_rx) = mpsc::channel::<TradeEvent>(4096);
    let ingestor = Arc::new(BinanceIngestor::new(config.symbols.clone()));

    let restartable = Box::new(RestartableIngestor::new(
        ingestor.clone(),
        trade_tx.clone(),
        shutdown.clone(),
    ));
    let recovery = Arc::new(RecoveryManager::new(
        restartable,
        RecoveryConfig {
            base_backoff: Duration::from_secs(config.recovery.base_backoff_seconds),
            max_backoff: Duration::from_secs(config.recovery.max_backoff_seconds),
            max_attempts: config.recovery.max_reconnect_attempts,
            critical_threshold: config.recovery.critical_threshold,
        },
    ));

    let dispatcher = orchestrator.dispatcher();
    let dispatcher_shutdown = shutdown.clone();
    let dispatcher_handle = tokio::spawn(async move { dispatcher.run(dispatcher_shutdown).await });

    let ingest_recovery = recovery.clone();
    let ingest_shutdown = shutdown.clone();
    let ingest_handle = tokio::spawn(async move {
        loop {
            ingest_recovery.run(ingest_shutdown.clone()).await;
            if ingest_shutdown.is_cancelled() {
                return;
            }
        }
    });

    let trade_shutdown = shutdown.clone();
    let trade_orchestrator = orchestrator.clone();
    let trade_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                trade = trade_rx.recv() => {
                    match trade {
                        Some(trade) => trade_orchestrator.handle_trade(trade).await,
                        None => return,
                    }
                }
                _ = trade_shutdown.cancelled() => return,
            }
        }
    });

    let maintenance_shutdown = shutdown.clone();
    let maintenance_orchestrator = orchestrator.clone();
    let maintenance_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = tick.tick() => maintenance_orchestrator.evict_idle_windows(),
                _ = maintenance_shutdown.cancelled() => return,
            }
        }
    });

    let stats_shutdown = shutdown.clone();
    let stats_orchestrator = orchestrator.clone();
    let stats_recovery = recovery.clone();
    let stats_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let stats = stats_orchestrator.stats(&stats_recovery);
                    info!(
                        trades_processed = stats.trades_processed,
                        alerts_sent = stats.alerts_sent,
                        alerts_suppressed = stats.alerts_suppressed,
                        alerts_dropped = stats.alerts_dropped,
                        ingestor_attempts = stats.ingestor_attempts,
                        ingestor_uptime_pct = stats.ingestor_uptime_pct,
                        active_cooldowns = stats.active_cooldowns,
                        "orchestrator stats"
                    );
                }
                _ = stats_shutdown.cancelled() => return,
            }
        }
    });

    shutdown.cancelled().await;
    let drain = Duration::from_secs(config.general.shutdown_drain_seconds);
    let _ = tokio::time::timeout(drain, dispatcher_handle).await;
    let _ = ingest_handle.await;
    let _ = trade_handle.await;
    let _ = maintenance_handle.await;
    let _ = stats_handle.await;
}
