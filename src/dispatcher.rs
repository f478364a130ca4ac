use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::model::Alert;
use crate::sink::Sink;

/// Rolling-window rate limiter: admits up to `max_events` sends in any
/// trailing `window` of wall-clock time.
///
/// Deliberately not `governor` (kept elsewhere in this crate for REST
/// calls). A leaky/token bucket smooths admission over time and can let a
/// burst through right after a quiet period; the spec calls for a strict
/// rolling window, so admission is just "how many timestamps in the last
/// `window` are there" against a `VecDeque<Instant>`.
pub struct RateLimiter {
    max_events: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            events: Mutex::new(VecDeque::with_capacity(max_events)),
        }
    }

    /// Non-blocking admission check. Records the event if admitted.
    pub fn try_admit(&self) -> bool {
        let now = Instant::now();
        let mut events = self.events.lock();
        while let Some(&front) = events.front() {
            if now.duration_since(front) >= self.window {
                events.pop_front();
            } else {
                break;
            }
        }
        if events.len() < self.max_events {
            events.push_back(now);
            true
        } else {
            false
        }
    }
}

struct Queue {
    alerts: VecDeque<Alert>,
    dropped: u64,
}

/// Bounded FIFO of pending alerts with drop-oldest overflow behaviour.
///
/// `tokio::sync::mpsc` can't drop its oldest queued item when full (a
/// bounded channel just blocks the sender), so the queue is hand-rolled: a
/// `parking_lot::Mutex<VecDeque<Alert>>` plus a `Notify` to wake the single
/// consumer task.
struct AlertQueue {
    inner: Mutex<Queue>,
    notify: Notify,
    capacity: usize,
}

impl AlertQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Queue {
                alerts: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, alert: Alert) {
        let mut q = self.inner.lock();
        if q.alerts.len() >= self.capacity {
            q.alerts.pop_front();
            q.dropped += 1;
        }
        q.alerts.push_back(alert);
        drop(q);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Alert {
        loop {
            {
                let mut q = self.inner.lock();
                if let Some(alert) = q.alerts.pop_front() {
                    return alert;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop, used to drain whatever is already queued once
    /// shutdown has been requested instead of waiting for new arrivals.
    fn try_pop(&self) -> Option<Alert> {
        self.inner.lock().alerts.pop_front()
    }

    fn dropped_count(&self) -> u64 {
        self.inner.lock().dropped
    }

    fn len(&self) -> usize {
        self.inner.lock().alerts.len()
    }
}

/// Delivers alerts from the bounded queue to a `Sink`, gated by a
/// `RateLimiter`, with a single retry after a fixed delay on send failure.
///
/// Rendering happens upstream at enqueue time (`Suppressor::process`), so
/// the dispatcher never re-renders a stale message against fresher state.
pub struct Dispatcher {
    queue: AlertQueue,
    limiter: RateLimiter,
    sink: Box<dyn Sink>,
    retry_delay: Duration,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl Dispatcher {
    pub fn new(sink: Box<dyn Sink>, capacity: usize, limiter: RateLimiter, retry_delay: Duration) -> Self {
        Self {
            queue: AlertQueue::new(capacity),
            limiter,
            sink,
            retry_delay,
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn enqueue(&self, alert: Alert) {
        self.queue.push(alert);
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped_count()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Single-consumer loop: wait for an alert, wait for rate-limit
    /// admission, send; on failure, wait `retry_delay` and retry exactly
    /// once more before giving up on that alert.
    ///
    /// On shutdown this keeps draining whatever is already queued instead
    /// of returning immediately -- `orchestrator::run` bounds the total
    /// drain time externally with a `shutdown_drain_seconds` timeout around
    /// this task, so there's no need to race each sleep against `shutdown`
    /// here too.
    pub async fn run(&self, shutdown: tokio_util::sync::CancellationToken) {
        loop {
            let Some(alert) = self.next_alert(&shutdown).await else {
                return;
            };

            while !self.limiter.try_admit() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            if self.send_once(&alert).await {
                continue;
            }

            tokio::time::sleep(self.retry_delay).await;

            if !self.send_once(&alert).await {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    symbol = alert.event.symbol,
                    "dropping alert after retry exhausted"
                );
            }
        }
    }

    /// Blocks for the next alert unless shutdown has already been
    /// requested, in which case it only drains what's already queued and
    /// never waits for new arrivals.
    async fn next_alert(&self, shutdown: &tokio_util::sync::CancellationToken) -> Option<Alert> {
        if shutdown.is_cancelled() {
            return self.queue.try_pop();
        }
        tokio::select! {
            alert = self.queue.pop() => Some(alert),
            _ = shutdown.cancelled() => self.queue.try_pop(),
        }
    }

    /// Fans the rendered message out to every recipient in the sink's
    /// whitelist. An empty whitelist is a configuration no-op, not a
    /// failure. Counts as sent once at least one recipient succeeded.
    async fn send_once(&self, alert: &Alert) -> bool {
        let recipients = self.sink.whitelist();
        if recipients.is_empty() {
            self.sent.fetch_add(1, Ordering::Relaxed);
            info!(symbol = alert.event.symbol, "alert dispatched (no recipients configured)");
            return true;
        }

        let mut any_ok = false;
        for recipient in recipients {
            match self.sink.send(recipient, alert.rendered_message.as_str()).await {
                Ok(()) => {
                    any_ok = true;
                    info!(symbol = alert.event.symbol, recipient, "alert dispatched");
                }
                Err(report) => {
                    warn!(symbol = alert.event.symbol, recipient, error = ?report, "alert send failed");
                }
            }
        }

        if any_ok {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
        any_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DetectorKind, Side, ThresholdEvent};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn alert() -> Alert {
        Alert {
            event: ThresholdEvent {
                kind: DetectorKind::Single,
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                total_usd: 100.0,
                buy_usd: 100.0,
                sell_usd: 0.0,
                trade_count: 1,
                window_duration_ms: 0,
                observed_at: Utc::now(),
            },
            rendered_message: "test alert".into(),
        }
    }

    #[test]
    fn rate_limiter_admits_up_to_max_then_blocks() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.try_admit());
        assert!(limiter.try_admit());
        assert!(!limiter.try_admit());
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let queue = AlertQueue::new(2);
        for i in 0..3 {
            let mut a = alert();
            a.rendered_message = format!("msg-{i}");
            queue.push(a);
        }
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.len(), 2);
    }

    struct CountingSink {
        calls: Arc<AtomicUsize>,
        fail_first_n: usize,
        recipients: Vec<String>,
    }

    impl Sink for CountingSink {
        fn send<'a>(
            &'a self,
            recipient: &'a str,
            _message: &'a str,
        ) -> futures::future::BoxFuture<'a, Result<(), error_stack::Report<crate::error::SinkError>>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_first_n {
                    Err(error_stack::Report::new(crate::error::SinkError::Delivery {
                        recipient: recipient.into(),
                    }))
                } else {
                    Ok(())
                }
            })
        }

        fn whitelist(&self) -> &[String] {
            &self.recipients
        }
    }

    #[tokio::test]
    async fn dispatcher_delivers_and_counts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Dispatcher::new(
            Box::new(CountingSink {
                calls: calls.clone(),
                fail_first_n: 0,
                recipients: vec!["console".into()],
            }),
            16,
            RateLimiter::new(100, Duration::from_secs(1)),
            Duration::from_millis(10),
        ));
        dispatcher.enqueue(alert());
        let token = tokio_util::sync::CancellationToken::new();
        let inner_token = token.clone();
        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(inner_token).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let _ = handle.await;
        assert_eq!(dispatcher.sent_count(), 1);
    }

    #[tokio::test]
    async fn retries_once_then_gives_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Dispatcher::new(
            Box::new(CountingSink {
                calls: calls.clone(),
                fail_first_n: 999,
                recipients: vec!["console".into()],
            }),
            16,
            RateLimiter::new(100, Duration::from_secs(1)),
            Duration::from_millis(5),
        ));
        dispatcher.enqueue(alert());
        let token = tokio_util::sync::CancellationToken::new();
        let inner_token = token.clone();
        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(inner_token).await }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        let _ = handle.await;
        assert_eq!(dispatcher.failed_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fans_out_to_every_whitelisted_recipient() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Dispatcher::new(
            Box::new(CountingSink {
                calls: calls.clone(),
                fail_first_n: 0,
                recipients: vec!["ops".into(), "oncall".into(), "audit".into()],
            }),
            16,
            RateLimiter::new(100, Duration::from_secs(1)),
            Duration::from_millis(10),
        ));
        dispatcher.enqueue(alert());
        let token = tokio_util::sync::CancellationToken::new();
        let inner_token = token.clone();
        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(inner_token).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let _ = handle.await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.sent_count(), 1);
    }

    /// Cancelling `shutdown` must not drop alerts already sitting in the
    /// queue -- `run` should keep draining them rather than returning on
    /// the first cancellation check.
    #[tokio::test]
    async fn drains_remaining_queue_after_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Dispatcher::new(
            Box::new(CountingSink {
                calls: calls.clone(),
                fail_first_n: 0,
                recipients: vec!["console".into()],
            }),
            16,
            RateLimiter::new(100, Duration::from_secs(1)),
            Duration::from_millis(5),
        ));
        for i in 0..3 {
            let mut a = alert();
            a.rendered_message = format!("queued-{i}");
            dispatcher.enqueue(a);
        }

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel(); // shutdown already requested before the loop starts
        dispatcher.run(token).await;

        assert_eq!(dispatcher.sent_count(), 3);
        assert_eq!(dispatcher.queued_count(), 0);
    }
}
