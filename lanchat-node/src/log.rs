//! Leveled log events handed to an injected observer.
//!
//! The node never formats or persists log lines itself. The composing root picks a
//! [`LogSink`]: usually a [`ChannelSink`] whose queue it drains, for instance with
//! [`forward_to_tracing`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub time: DateTime<Utc>,
    pub message: String,
}

/// Receiver of log events. Must not block.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);

    fn log(&self, level: LogLevel, message: String) {
        self.emit(LogEvent {
            level,
            time: Utc::now(),
            message,
        });
    }

    fn debug(&self, message: String) {
        self.log(LogLevel::Debug, message)
    }

    fn info(&self, message: String) {
        self.log(LogLevel::Info, message)
    }

    fn warn(&self, message: String) {
        self.log(LogLevel::Warn, message)
    }

    fn error(&self, message: String) {
        self.log(LogLevel::Error, message)
    }
}

/// Shared handle passed to every component.
pub type Logger = Arc<dyn LogSink>;

/// Pushes events onto an unbounded queue owned by the caller.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelSink {
    fn emit(&self, event: LogEvent) {
        // Receiver gone means nobody is watching; drop the event.
        let _ = self.tx.send(event);
    }
}

/// Discards everything.
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _event: LogEvent) {}
}

pub fn null() -> Logger {
    Arc::new(NullSink)
}

/// Render queued events through `tracing` until cancelled or the queue closes.
pub async fn forward_to_tracing(
    mut rx: mpsc::UnboundedReceiver<LogEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            e = rx.recv() => match e {
                Some(e) => e,
                None => break,
            },
        };
        match event.level {
            LogLevel::Debug => tracing::debug!("{}", event.message),
            LogLevel::Info => tracing::info!("{}", event.message),
            LogLevel::Warn => tracing::warn!("{}", event.message),
            LogLevel::Error => tracing::error!("{}", event.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_preserves_order_and_level() {
        let (sink, mut rx) = ChannelSink::new();
        sink.info("first".into());
        sink.error("second".into());
        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert_eq!((a.level, a.message.as_str()), (LogLevel::Info, "first"));
        assert_eq!((b.level, b.message.as_str()), (LogLevel::Error, "second"));
        assert!(a.time <= b.time);
    }

    #[test]
    fn emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.warn("nobody listens".into());
    }

    #[tokio::test]
    async fn forwarder_stops_when_queue_closes() {
        let (sink, rx) = ChannelSink::new();
        sink.debug("x".into());
        drop(sink);
        forward_to_tracing(rx, CancellationToken::new()).await;
    }
}
