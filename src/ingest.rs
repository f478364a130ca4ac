pub mod binance;

use error_stack::Report;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::IngestError;
use crate::model::TradeEvent;

/// Abstraction over a venue's trade WebSocket feed.
///
/// Uses `BoxFuture` rather than `async fn` in trait to keep `dyn Ingestor`
/// object-safe, the same reason the teacher's `Exchange` trait does.
pub trait Ingestor: Send + Sync {
    fn exchange(&self) -> &str;

    /// Connect, subscribe to the configured symbols, then stream trades
    /// into the sender for as long as the connection stays healthy.
    /// Returns once the connection drops (`Err`) or `cancel` fires
    /// (`Ok`). Never retries internally -- that's the `RecoveryManager`'s
    /// job, driving this through the `Restartable` trait instead.
    ///
    /// Must call `on_connected` as soon as the subscribe is acknowledged,
    /// independent of when `run` itself returns -- the caller uses it to
    /// flip connection state to live while the session keeps streaming.
    fn run<'a>(
        &'a self,
        tx: mpsc::Sender<TradeEvent>,
        cancel: tokio_util::sync::CancellationToken,
        on_connected: &'a (dyn Fn() + Send + Sync),
    ) -> BoxFuture<'a, Result<(), Report<IngestError>>>;
}
