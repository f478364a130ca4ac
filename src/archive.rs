use std::path::{Path, PathBuf};

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::ArchiveError;
use crate::model::{Alert, TradeEvent};

/// Optional append-only record of trades and alerts. Never on the hot
/// path's critical section: a write failure is logged and the trade or
/// alert still flows downstream unaffected.
pub trait Archive: Send + Sync {
    fn record_trade<'a>(&'a self, trade: &'a TradeEvent) -> BoxFuture<'a, Result<(), Report<ArchiveError>>>;
    fn record_alert<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, Result<(), Report<ArchiveError>>>;
}

#[derive(Serialize)]
struct TradeRecord<'a> {
    exchange: &'a str,
    symbol: &'a str,
    side: String,
    price: f64,
    quantity: f64,
    amount: f64,
    trade_time_ms: i64,
    trade_id: i64,
}

#[derive(Serialize)]
struct AlertRecord<'a> {
    kind: String,
    symbol: &'a str,
    side: String,
    total_usd: f64,
    buy_usd: f64,
    sell_usd: f64,
    trade_count: usize,
    window_duration_ms: i64,
    observed_at: chrono::DateTime<chrono::Utc>,
    message: &'a str,
}

/// Appends newline-delimited JSON under `root_dir`: trades go to
/// `<date>/<symbol>.jsonl`, alerts to `alerts/alerts.jsonl`. Chosen over a
/// SQLite store (the teacher's `storage::sqlite` module) because the
/// archive is explicitly non-essential here -- a plain append-only file
/// needs no schema migrations and never blocks on a writer lock held by a
/// query.
pub struct JsonlArchive {
    root_dir: PathBuf,
}

impl JsonlArchive {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    async fn append_line(path: &Path, line: &str) -> Result<(), Report<ArchiveError>> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .change_context(ArchiveError::Open)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .change_context(ArchiveError::Open)?;
        file.write_all(line.as_bytes())
            .await
            .change_context(ArchiveError::Write)?;
        file.write_all(b"\n").await.change_context(ArchiveError::Write)
    }
}

impl Archive for JsonlArchive {
    fn record_trade<'a>(&'a self, trade: &'a TradeEvent) -> BoxFuture<'a, Result<(), Report<ArchiveError>>> {
        Box::pin(async move {
            let date = trade.trade_time().format("%Y-%m-%d");
            let path = self.root_dir.join(date.to_string()).join(format!("{}.jsonl", trade.symbol));
            let record = TradeRecord {
                exchange: &trade.exchange,
                symbol: &trade.symbol,
                side: trade.side.to_string(),
                price: trade.price,
                quantity: trade.quantity,
                amount: trade.amount,
                trade_time_ms: trade.trade_time_ms,
                trade_id: trade.trade_id,
            };
            let line = serde_json::to_string(&record).change_context(ArchiveError::Write)?;
            Self::append_line(&path, &line).await
        })
    }

    fn record_alert<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, Result<(), Report<ArchiveError>>> {
        Box::pin(async move {
            let path = self.root_dir.join("alerts").join("alerts.jsonl");
            let record = AlertRecord {
                kind: alert.event.kind.to_string(),
                symbol: &alert.event.symbol,
                side: alert.event.side.to_string(),
                total_usd: alert.event.total_usd,
                buy_usd: alert.event.buy_usd,
                sell_usd: alert.event.sell_usd,
                trade_count: alert.event.trade_count,
                window_duration_ms: alert.event.window_duration_ms,
                observed_at: alert.event.observed_at,
                message: &alert.rendered_message,
            };
            let line = serde_json::to_string(&record).change_context(ArchiveError::Write)?;
            Self::append_line(&path, &line).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DetectorKind, Side};

    #[tokio::test]
    async fn record_trade_appends_newline_delimited_json() {
        let dir = std::env::temp_dir().join(format!("taker-surveillance-test-{:?}", std::thread::current().id()));
        let archive = JsonlArchive::new(&dir);
        let trade = TradeEvent::new("binance", "BTCUSDT", Side::Buy, 50_000.0, 1.0, 0, 1).unwrap();
        archive.record_trade(&trade).await.unwrap();
        archive.record_trade(&trade).await.unwrap();

        let date = trade.trade_time().format("%Y-%m-%d").to_string();
        let contents = tokio::fs::read_to_string(dir.join(date).join("BTCUSDT.jsonl"))
            .await
            .unwrap();
        assert_eq!(contents.lines().count(), 2);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn record_alert_appends_to_shared_alerts_file() {
        let dir = std::env::temp_dir().join(format!("taker-surveillance-test-alerts-{:?}", std::thread::current().id()));
        let archive = JsonlArchive::new(&dir);
        let alert = Alert {
            event: crate::model::ThresholdEvent {
                kind: DetectorKind::Single,
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                total_usd: 100.0,
                buy_usd: 100.0,
                sell_usd: 0.0,
                trade_count: 1,
                window_duration_ms: 0,
                observed_at: chrono::Utc::now(),
            },
            rendered_message: "test".into(),
        };
        archive.record_alert(&alert).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.join("alerts").join("alerts.jsonl"))
            .await
            .unwrap();
        assert_eq!(contents.lines().count(), 1);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
