use error_stack::Report;
use futures::future::BoxFuture;
use tracing::info;

use crate::error::SinkError;

/// Delivery target for rendered alert text.
///
/// Matches the `Restartable` pattern rather than pulling in `async-trait`:
/// the teacher's own `Notifier` trait is synchronous, but alert delivery
/// here is genuinely I/O-bound (webhook, bot API, ...), so the trait
/// returns a boxed future the way `Restartable::restart` does.
pub trait Sink: Send + Sync {
    /// Deliver `message` to a single `recipient` drawn from `whitelist()`.
    /// The dispatcher calls this once per configured recipient, so a sink
    /// never needs to fan out internally.
    fn send<'a>(&'a self, recipient: &'a str, message: &'a str) -> BoxFuture<'a, Result<(), Report<SinkError>>>;

    /// Configured recipients this sink fans a message out to. An empty
    /// whitelist means "no recipients configured" -- the dispatcher still
    /// counts the send as attempted but the sink itself decides whether
    /// that's a no-op success or an error.
    fn whitelist(&self) -> &[String];
}

/// Logs alerts instead of delivering them anywhere. Useful standalone and
/// as the always-available fallback sink.
pub struct TerminalSink {
    recipients: Vec<String>,
}

impl TerminalSink {
    pub fn new(recipients: Vec<String>) -> Self {
        Self { recipients }
    }
}

impl Sink for TerminalSink {
    fn send<'a>(&'a self, recipient: &'a str, message: &'a str) -> BoxFuture<'a, Result<(), Report<SinkError>>> {
        Box::pin(async move {
            info!(recipient, message, "ALERT");
            Ok(())
        })
    }

    fn whitelist(&self) -> &[String] {
        &self.recipients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminal_sink_always_succeeds() {
        let sink = TerminalSink::new(vec!["console".into()]);
        assert!(sink.send("console", "hello").await.is_ok());
    }

    #[test]
    fn whitelist_reflects_configured_recipients() {
        let sink = TerminalSink::new(vec!["a".into(), "b".into()]);
        assert_eq!(sink.whitelist(), &["a".to_string(), "b".to_string()]);
    }
}
