// Fire-and-forget event notifications
pub mod telegram;

pub use telegram::TelegramNotifier;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    OrderPlaced,
    OrderRejected,
    PositionOpened,
    PositionClosed,
    StopLossHit,
    TargetHit,
    Info,
    Error,
    Fatal,
}

impl EventKind {
    pub fn title(&self) -> &'static str {
        match self {
            EventKind::OrderPlaced => "\u{1F4E4} Order Placed",
            EventKind::OrderRejected => "\u{26D4} Order Rejected",
            EventKind::PositionOpened => "\u{1F4C8} Position Opened",
            EventKind::PositionClosed => "\u{1F4C9} Position Closed",
            EventKind::StopLossHit => "\u{26A0}\u{FE0F} Stop Loss Hit",
            EventKind::TargetHit => "\u{1F4B0} Target Hit",
            EventKind::Info => "\u{2139}\u{FE0F} Info",
            EventKind::Error => "\u{1F6A8} Error",
            EventKind::Fatal => "\u{1F534} FATAL",
        }
    }
}

/// An event keyed by kind with a string payload mapping.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub payload: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.payload.insert(key.to_string(), value.to_string());
        self
    }
}

/// Receives trading events. Implementations must not assume delivery:
/// the core tolerates failures and keeps trading.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> Result<()>;
}

/// Fallback notifier that writes events to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &Event) -> Result<()> {
        tracing::info!(kind = ?event.kind, payload = ?event.payload, "event");
        Ok(())
    }
}

/// Deliver an event, logging instead of failing if the notifier is down.
pub async fn emit(notifier: &dyn Notifier, event: Event) {
    if let Err(e) = notifier.notify(&event).await {
        tracing::warn!(error = %e, kind = ?event.kind, "notification dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        let event = Event::new(EventKind::Info).with("message", "session started");
        assert!(LogNotifier.notify(&event).await.is_ok());
    }

    #[tokio::test]
    async fn test_emit_swallows_failures() {
        struct Broken;

        #[async_trait]
        impl Notifier for Broken {
            async fn notify(&self, _event: &Event) -> Result<()> {
                Err(crate::Error::Notify("down".to_string()))
            }
        }

        // Must not panic or propagate
        emit(&Broken, Event::new(EventKind::Error).with("error", "x")).await;
    }

    #[test]
    fn test_payload_ordering_is_stable() {
        let event = Event::new(EventKind::OrderPlaced)
            .with("symbol", "BANKNIFTY25JAN48100CE")
            .with("quantity", 15);
        let keys: Vec<_> = event.payload.keys().cloned().collect();
        assert_eq!(keys, vec!["quantity", "symbol"]);
    }
}
