use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::ingest::Ingestor;
use crate::model::{Side, TradeEvent};
use crate::recovery::Restartable;

const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443/ws";
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw trade stream ingestor for Binance's combined `@trade` channel.
///
/// Grounded in the teacher's `exchange::binance::run_trades_ws`, trimmed to
/// just the trade stream (no candles, no ticker) and generalized to the
/// `Ingestor`/`Restartable` split so the recovery manager drives reconnects
/// instead of an internal backoff loop.
pub struct BinanceIngestor {
    symbols: Vec<String>,
}

impl BinanceIngestor {
    pub fn new(symbols: Vec<String>) -> Self {
        Self { symbols }
    }

    fn subscribe_frame(&self) -> String {
        let params: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@trade", s.to_lowercase()))
            .collect();
        json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": 1,
        })
        .to_string()
    }
}

impl Ingestor for BinanceIngestor {
    fn exchange(&self) -> &str {
        "binance"
    }

    fn run<'a>(
        &'a self,
        tx: mpsc::Sender<TradeEvent>,
        cancel: CancellationToken,
        on_connected: &'a (dyn Fn() + Send + Sync),
    ) -> BoxFuture<'a, Result<(), Report<IngestError>>> {
        Box::pin(async move {
            let (ws_stream, _) = connect_async(BINANCE_WS_BASE)
                .await
                .change_context(IngestError::Connection {
                    exchange: "binance".into(),
                })?;

            let (mut write, mut read) = ws_stream.split();

            write
                .send(Message::Text(self.subscribe_frame().into()))
                .await
                .change_context(IngestError::Subscribe {
                    exchange: "binance".into(),
                })?;

            // The subscribe ack is the first frame back; a rejection here is
            // fatal for this attempt and must trigger reconnection rather
            // than being silently dropped as an unrecognized control frame.
            match read.next().await {
                Some(Ok(Message::Text(text))) if is_subscribe_error(&text) => {
                    return Err(Report::new(IngestError::Subscribe {
                        exchange: "binance".into(),
                    })
                    .attach(text));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(Report::new(e).change_context(IngestError::Subscribe {
                        exchange: "binance".into(),
                    }));
                }
                None => {
                    return Err(Report::new(IngestError::Subscribe {
                        exchange: "binance".into(),
                    })
                    .attach("stream closed before subscribe ack"));
                }
            }

            on_connected();
            info!(symbols = ?self.symbols, "binance trade stream connected");

            let mut ping_timer = interval(PING_INTERVAL);
            ping_timer.tick().await; // first tick fires immediately

            let pong_deadline = tokio::time::sleep(PONG_TIMEOUT);
            tokio::pin!(pong_deadline);
            let mut awaiting_pong = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("binance trade stream cancelled");
                        return Ok(());
                    }
                    _ = ping_timer.tick() => {
                        if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                            return Err(Report::new(IngestError::Send {
                                exchange: "binance".into(),
                            }));
                        }
                        awaiting_pong = true;
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + PONG_TIMEOUT);
                    }
                    () = &mut pong_deadline, if awaiting_pong => {
                        return Err(Report::new(IngestError::Connection {
                            exchange: "binance".into(),
                        }).attach("no pong within timeout, connection presumed dead"));
                    }
                    msg = read.next() => {
                        match msg {
                            None => {
                                return Err(Report::new(IngestError::Connection {
                                    exchange: "binance".into(),
                                }).attach("stream ended"));
                            }
                            Some(Err(e)) => {
                                return Err(Report::new(e).change_context(IngestError::Connection {
                                    exchange: "binance".into(),
                                }));
                            }
                            Some(Ok(Message::Text(text))) => {
                                if let Some(trade) = parse_trade_frame(&text) {
                                    if tx.send(trade).await.is_err() {
                                        // downstream gone, nothing left to do
                                        return Ok(());
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Pong(_))) => {
                                awaiting_pong = false;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
        })
    }
}

/// True when a frame text is a Binance subscribe rejection rather than a
/// successful ack or an unrelated control/trade frame.
fn is_subscribe_error(text: &str) -> bool {
    match serde_json::from_str::<SubscribeAck>(text) {
        Ok(ack) => ack.error.is_some() || ack.code.is_some(),
        Err(_) => false,
    }
}

#[derive(Debug, Deserialize)]
struct SubscribeAck {
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    code: Option<i64>,
}

fn parse_trade_frame(text: &str) -> Option<TradeEvent> {
    let raw: BinanceTradeFrame = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(_) => {
            // subscribe ack / non-trade control frame
            return None;
        }
    };

    let price: f64 = raw.price.parse().ok()?;
    let quantity: f64 = raw.quantity.parse().ok()?;
    let side = if raw.is_buyer_maker { Side::Sell } else { Side::Buy };

    TradeEvent::new(
        "binance",
        raw.symbol,
        side,
        price,
        quantity,
        raw.trade_time,
        raw.trade_id,
    )
}

#[derive(Debug, Deserialize)]
struct BinanceTradeFrame {
    #[serde(rename = "e")]
    #[allow(dead_code)]
    event_type: Option<String>,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "t")]
    trade_id: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

/// Wires a `BinanceIngestor` into the `Restartable` trait expected by
/// `RecoveryManager`, carrying the trade sender and shutdown token it needs
/// to call `Ingestor::run`.
pub struct RestartableIngestor {
    ingestor: Arc<BinanceIngestor>,
    tx: mpsc::Sender<TradeEvent>,
    cancel: CancellationToken,
}

impl RestartableIngestor {
    pub fn new(ingestor: Arc<BinanceIngestor>, tx: mpsc::Sender<TradeEvent>, cancel: CancellationToken) -> Self {
        Self { ingestor, tx, cancel }
    }
}

impl Restartable for RestartableIngestor {
    fn restart<'a>(&'a self, on_connected: &'a (dyn Fn() + Send + Sync)) -> BoxFuture<'a, Result<(), String>> {
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        Box::pin(async move {
            self.ingestor
                .run(tx, cancel, on_connected)
                .await
                .map_err(|report| format!("{report:?}"))
        })
    }

    fn name(&self) -> &str {
        self.ingestor.exchange()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_lists_lowercase_trade_streams() {
        let ingestor = BinanceIngestor::new(vec!["BTCUSDT".into(), "ETHUSDT".into()]);
        let frame = ingestor.subscribe_frame();
        assert!(frame.contains("btcusdt@trade"));
        assert!(frame.contains("ethusdt@trade"));
        assert!(frame.contains("\"method\":\"SUBSCRIBE\""));
    }

    #[test]
    fn buyer_maker_flag_maps_to_sell_side() {
        let frame = r#"{"e":"trade","s":"BTCUSDT","p":"42000.00","q":"0.5","T":1704067200000,"t":99,"m":true}"#;
        let trade = parse_trade_frame(frame).unwrap();
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.symbol, "BTCUSDT");
    }

    #[test]
    fn taker_buy_maps_to_buy_side() {
        let frame = r#"{"e":"trade","s":"BTCUSDT","p":"42000.00","q":"0.5","T":1704067200000,"t":99,"m":false}"#;
        let trade = parse_trade_frame(frame).unwrap();
        assert_eq!(trade.side, Side::Buy);
    }

    #[test]
    fn non_trade_frame_is_ignored() {
        let frame = r#"{"result":null,"id":1}"#;
        assert!(parse_trade_frame(frame).is_none());
    }

    #[test]
    fn zero_quantity_trade_is_rejected_by_trade_event_validation() {
        let frame = r#"{"e":"trade","s":"BTCUSDT","p":"42000.00","q":"0","T":1704067200000,"t":99,"m":false}"#;
        assert!(parse_trade_frame(frame).is_none());
    }

    #[test]
    fn subscribe_ack_success_is_not_error() {
        assert!(!is_subscribe_error(r#"{"result":null,"id":1}"#));
    }

    #[test]
    fn subscribe_ack_error_is_detected() {
        assert!(is_subscribe_error(
            r#"{"error":{"code":2,"msg":"Invalid request"},"id":1}"#
        ));
    }

    #[test]
    fn subscribe_ack_error_code_without_nested_error_is_detected() {
        assert!(is_subscribe_error(r#"{"code":-1121,"msg":"Invalid symbol"}"#));
    }

    #[test]
    fn unrelated_frame_is_not_a_subscribe_error() {
        let trade = r#"{"e":"trade","s":"BTCUSDT","p":"42000.00","q":"0.5","T":1704067200000,"t":99,"m":false}"#;
        assert!(!is_subscribe_error(trade));
    }
}
