use std::collections::VecDeque;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::model::{ConnectionState, ErrorSeverity};

const MAX_ERROR_HISTORY: usize = 1000;

/// Anything the `RecoveryManager` can restart on the caller's behalf.
///
/// Breaks what would otherwise be a cyclic reference: the ingestor needs a
/// handle to the thing that decides whether/when to retry it, and the
/// recovery manager needs a handle to the thing it restarts. Instead, the
/// orchestrator wires both sides to this trait object -- the ingestor never
/// holds a `RecoveryManager` and the `RecoveryManager` never holds a
/// concrete ingestor type, only `Arc<dyn Restartable>`.
///
/// An implementation's `restart` makes exactly one connection attempt, then
/// blocks for the lifetime of that single session -- returning `Ok` only
/// once the session ends on its own terms (cancellation or the downstream
/// receiver being dropped), or `Err` if the connection itself failed or
/// dropped. It never retries or backs off internally; all backoff, retry
/// counting, and give-up decisions live here in `RecoveryManager`.
///
/// `restart` must call `on_connected` as soon as the connection is live
/// (e.g. right after a successful subscribe), independent of when the
/// returned future eventually resolves -- for an ingestor that blocks for
/// an entire streaming session, that moment is long before `restart`
/// returns. Without this, `ConnectionState::Connected` would never be
/// observable while the connection is actually up.
pub trait Restartable: Send + Sync {
    fn restart<'a>(&'a self, on_connected: &'a (dyn Fn() + Send + Sync)) -> BoxFuture<'a, Result<(), String>>;
    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct RecordedError {
    pub severity: ErrorSeverity,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    pub critical_threshold: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
            max_attempts: 10,
            critical_threshold: 3,
        }
    }
}

struct Inner {
    state: ConnectionState,
    consecutive_failures: u32,
    total_attempts: u64,
    total_successes: u64,
    started_at: chrono::DateTime<chrono::Utc>,
    last_connected_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Wall-clock start of the attempt currently in flight, cleared once
    /// it resolves (successfully via `mark_connected`, or with failure).
    attempt_started_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Cumulative time spent not connected, accumulated per attempt.
    /// Grounded in `ErrorRecoveryManager._calculate_uptime_percentage`,
    /// which sums each recorded reconnect attempt's duration as downtime.
    downtime: Duration,
    error_history: VecDeque<RecordedError>,
}

/// Tracks connection health for one `Restartable` and drives its
/// exponential-backoff reconnect loop.
///
/// Grounded directly in the `ErrorRecoveryManager` Python class: the same
/// `consecutive_failures` counter, the same `base * 2^(n-1)` backoff capped
/// at `max_backoff`, a critical admin alert once `consecutive_failures`
/// reaches `critical_threshold`, and a final admin alert (then give-up) at
/// `max_attempts`.
pub struct RecoveryManager {
    target: Box<dyn Restartable>,
    config: RecoveryConfig,
    inner: Mutex<Inner>,
}

impl RecoveryManager {
    pub fn new(target: Box<dyn Restartable>, config: RecoveryConfig) -> Self {
        Self {
            target,
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                consecutive_failures: 0,
                total_attempts: 0,
                total_successes: 0,
                started_at: chrono::Utc::now(),
                last_connected_at: None,
                attempt_started_at: None,
                downtime: Duration::ZERO,
                error_history: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
    }

    fn record_error(&self, severity: ErrorSeverity, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.error_history.len() >= MAX_ERROR_HISTORY {
            inner.error_history.pop_front();
        }
        inner.error_history.push_back(RecordedError {
            severity,
            message: message.into(),
            at: chrono::Utc::now(),
        });
    }

    /// Runs the full reconnect loop: keep attempting `target.restart()`
    /// with exponential backoff until `shutdown` fires, until `max_attempts`
    /// is exhausted, or until `restart` itself returns (which, for an
    /// ingestor, means its session ended -- gracefully via cancellation, or
    /// because the channel receiver was dropped). `ConnectionState` becomes
    /// `Connected` the moment `restart` invokes `on_connected`, not when
    /// `restart` eventually resolves.
    pub async fn run(&self, shutdown: tokio_util::sync::CancellationToken) {
        self.set_state(ConnectionState::Connecting);

        loop {
            if shutdown.is_cancelled() {
                self.set_state(ConnectionState::Closed);
                return;
            }

            {
                let mut inner = self.inner.lock();
                inner.total_attempts += 1;
                inner.attempt_started_at = Some(chrono::Utc::now());
            }

            let on_connected = || self.mark_connected();
            match self.target.restart(&on_connected).await {
                Ok(()) => {
                    // Session ended on its own terms (shutdown requested or
                    // downstream gone), not a failure -- stop retrying.
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                Err(reason) => {
                    self.record_attempt_downtime();
                    let attempt = {
                        let mut inner = self.inner.lock();
                        inner.consecutive_failures += 1;
                        inner.consecutive_failures
                    };
                    self.record_error(
                        Self::severity_for(attempt, self.config.critical_threshold),
                        format!("{} restart failed: {reason}", self.target.name()),
                    );

                    if attempt >= self.config.critical_threshold {
                        self.send_critical_alert(attempt, &reason);
                    }

                    if attempt >= self.config.max_attempts {
                        self.send_max_attempts_alert(attempt);
                        self.set_state(ConnectionState::Failed);
                        return;
                    }

                    self.set_state(ConnectionState::Reconnecting);
                    let backoff = self.backoff_for(attempt);
                    warn!(
                        target = self.target.name(),
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        reason,
                        "reconnect attempt failed, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.cancelled() => {
                            self.set_state(ConnectionState::Closed);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Invoked by the `Restartable` target as soon as the connection is
    /// live. Closes out the in-flight attempt's downtime window and flips
    /// the state to `Connected` immediately, regardless of how much longer
    /// `restart` itself keeps running.
    fn mark_connected(&self) {
        let now = chrono::Utc::now();
        {
            let mut inner = self.inner.lock();
            if let Some(started) = inner.attempt_started_at.take() {
                inner.downtime += (now - started).max(chrono::Duration::zero()).to_std().unwrap_or(Duration::ZERO);
            }
            inner.consecutive_failures = 0;
            inner.total_successes += 1;
            inner.last_connected_at = Some(now);
        }
        self.set_state(ConnectionState::Connected);
        info!(target = self.target.name(), "connection established");
    }

    /// Closes out the in-flight attempt's downtime window when `restart`
    /// returned `Err` without ever reaching `mark_connected` -- the whole
    /// attempt was downtime.
    fn record_attempt_downtime(&self) {
        let now = chrono::Utc::now();
        let mut inner = self.inner.lock();
        if let Some(started) = inner.attempt_started_at.take() {
            inner.downtime += (now - started).max(chrono::Duration::zero()).to_std().unwrap_or(Duration::ZERO);
        }
    }

    fn severity_for(consecutive_failures: u32, critical_threshold: u32) -> ErrorSeverity {
        if consecutive_failures >= critical_threshold {
            ErrorSeverity::Critical
        } else if consecutive_failures >= 2 {
            ErrorSeverity::High
        } else {
            ErrorSeverity::Medium
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max_backoff`.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let scaled = self.config.base_backoff.as_secs_f64() * 2f64.powi(exp as i32);
        Duration::from_secs_f64(scaled).min(self.config.max_backoff)
    }

    fn send_critical_alert(&self, attempt: u32, reason: &str) {
        error!(
            target = self.target.name(),
            attempt, reason, "critical: repeated reconnect failures"
        );
    }

    fn send_max_attempts_alert(&self, attempt: u32) {
        error!(
            target = self.target.name(),
            attempt, "giving up: max reconnect attempts exhausted"
        );
    }

    /// Percentage of wall-clock time since the most recent successful
    /// connection that was *not* downtime, matching
    /// `ErrorRecoveryManager._calculate_uptime_percentage`: the window is
    /// `now - last_connected_at`, and `downtime` is the cumulative duration
    /// of every reconnect attempt recorded against that window. Staying
    /// connected with no further failures drives this toward 100%, not away
    /// from it.
    pub fn uptime_percentage(&self) -> f64 {
        let inner = self.inner.lock();
        let Some(last_connected_at) = inner.last_connected_at else {
            return 0.0;
        };
        let total_secs = (chrono::Utc::now() - last_connected_at).num_milliseconds().max(0) as f64 / 1000.0;
        if total_secs <= 0.0 {
            return 100.0;
        }
        let downtime_secs = inner.downtime.as_secs_f64();
        (((total_secs - downtime_secs) / total_secs) * 100.0).clamp(0.0, 100.0)
    }

    pub fn recent_errors(&self) -> Vec<RecordedError> {
        self.inner.lock().error_history.iter().cloned().collect()
    }

    pub fn total_attempts(&self) -> u64 {
        self.inner.lock().total_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Mimics a long-lived ingestor session: on success it signals
    /// `on_connected` immediately, then blocks until `cancel` fires (just
    /// like `BinanceIngestor::run` blocks for the connection's lifetime),
    /// returning `Ok` only once cancelled.
    struct FlakyTarget {
        name: String,
        fail_times: u32,
        attempts: AtomicU32,
        cancel: tokio_util::sync::CancellationToken,
    }

    impl Restartable for FlakyTarget {
        fn restart<'a>(&'a self, on_connected: &'a (dyn Fn() + Send + Sync)) -> BoxFuture<'a, Result<(), String>> {
            Box::pin(async move {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= self.fail_times {
                    Err(format!("attempt {attempt} failed"))
                } else {
                    on_connected();
                    self.cancel.cancelled().await;
                    Ok(())
                }
            })
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let manager = RecoveryManager::new(
            Box::new(FlakyTarget {
                name: "test".into(),
                fail_times: 0,
                attempts: AtomicU32::new(0),
                cancel: tokio_util::sync::CancellationToken::new(),
            }),
            RecoveryConfig {
                base_backoff: Duration::from_secs(2),
                max_backoff: Duration::from_secs(10),
                max_attempts: 10,
                critical_threshold: 3,
            },
        );
        assert_eq!(manager.backoff_for(1), Duration::from_secs(2));
        assert_eq!(manager.backoff_for(2), Duration::from_secs(4));
        assert_eq!(manager.backoff_for(3), Duration::from_secs(8));
        assert_eq!(manager.backoff_for(4), Duration::from_secs(10)); // would be 16, capped
    }

    /// `FlakyTarget` mirrors `BinanceIngestor::run`: once it succeeds it
    /// stays "connected" until cancelled, so `run()` only returns after the
    /// shared token fires. `Connected` is therefore observed while the
    /// session is live, not as the final state once `run()` returns -- at
    /// that point the session has ended and the manager moves to `Closed`.
    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let shutdown = tokio_util::sync::CancellationToken::new();
        let manager = Arc::new(RecoveryManager::new(
            Box::new(FlakyTarget {
                name: "test".into(),
                fail_times: 2,
                attempts: AtomicU32::new(0),
                cancel: shutdown.clone(),
            }),
            RecoveryConfig {
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                max_attempts: 10,
                critical_threshold: 5,
            },
        ));
        let handle = tokio::spawn({
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            async move { manager.run(shutdown).await }
        });

        for _ in 0..100 {
            if manager.state() == ConnectionState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.total_attempts(), 3);

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let manager = RecoveryManager::new(
            Box::new(FlakyTarget {
                name: "test".into(),
                fail_times: u32::MAX,
                attempts: AtomicU32::new(0),
                cancel: tokio_util::sync::CancellationToken::new(),
            }),
            RecoveryConfig {
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                max_attempts: 3,
                critical_threshold: 2,
            },
        );
        let token = tokio_util::sync::CancellationToken::new();
        manager.run(token).await;
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(manager.total_attempts(), 3);
    }

    #[tokio::test]
    async fn shutdown_during_backoff_stops_cleanly() {
        let manager = Arc::new(RecoveryManager::new(
            Box::new(FlakyTarget {
                name: "test".into(),
                fail_times: u32::MAX,
                attempts: AtomicU32::new(0),
                cancel: tokio_util::sync::CancellationToken::new(),
            }),
            RecoveryConfig {
                base_backoff: Duration::from_secs(30),
                max_backoff: Duration::from_secs(60),
                max_attempts: 100,
                critical_threshold: 50,
            },
        ));
        let token = tokio_util::sync::CancellationToken::new();
        let inner_token = token.clone();
        let handle = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run(inner_token).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Closed);
    }
}
