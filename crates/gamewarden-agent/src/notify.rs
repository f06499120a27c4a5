use std::io::Write;

use tokio::sync::mpsc;

/// Outward messages about a server's lifecycle. `channel` is whatever the
/// front-end passed to `start`; the supervisor never interprets it.
///
/// Implementations must not block for long: they are called from the
/// per-instance dispatcher.
pub trait Notifier: Send + Sync {
    fn notify(&self, channel: &str, message: &str) -> anyhow::Result<()>;
}

/// Sends `message`, logging instead of propagating delivery failures.
pub(crate) fn deliver(notifier: &dyn Notifier, channel: &str, message: &str) {
    if let Err(e) = notifier.notify(channel, message) {
        tracing::warn!(channel, error = %format!("{e:#}"), "notification failed");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, channel: &str, message: &str) -> anyhow::Result<()> {
        tracing::info!(channel, message, "notification");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, channel: &str, message: &str) -> anyhow::Result<()> {
        self.tx
            .send(Notification {
                channel: channel.to_string(),
                message: message.to_string(),
            })
            .map_err(|_| anyhow::anyhow!("notification receiver dropped"))
    }
}

/// Console front-end: prints `[channel] message`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn notify(&self, channel: &str, message: &str) -> anyhow::Result<()> {
        let mut out = std::io::stdout().lock();
        for line in message.lines() {
            writeln!(out, "[{channel}] {line}")?;
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl Notifier for Failing {
        fn notify(&self, _channel: &str, _message: &str) -> anyhow::Result<()> {
            anyhow::bail!("webhook unreachable")
        }
    }

    #[test]
    fn channel_notifier_forwards_messages() {
        let (n, mut rx) = ChannelNotifier::new();
        n.notify("general", "Server is live").unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Notification {
                channel: "general".to_string(),
                message: "Server is live".to_string(),
            }
        );
    }

    #[test]
    fn closed_channel_is_an_error() {
        let (n, rx) = ChannelNotifier::new();
        drop(rx);
        assert!(n.notify("general", "hello").is_err());
    }

    #[test]
    fn deliver_swallows_failures() {
        deliver(&Failing, "general", "hello");
    }
}
