use crate::error::SinkError;
use tokio::sync::mpsc;

/// Transport d'un abonné. La livraison est synchrone et ne doit jamais
/// bloquer : un transport lent met en file ou échoue.
pub trait EventSink: Send + Sync {
    fn deliver(&self, envelope: &str) -> Result<(), SinkError>;

    fn describe(&self) -> String {
        "sink".into()
    }
}

/// Sink vers un canal mpsc (pompé par la tâche WebSocket du client)
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Crée le sink et le récepteur associé
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, envelope: &str) -> Result<(), SinkError> {
        self.tx.send(envelope.to_string()).map_err(|_| SinkError::Closed)
    }

    fn describe(&self) -> String {
        "channel".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_fails_once_receiver_dropped() {
        let (sink, mut rx) = ChannelSink::pair();
        sink.deliver("{}").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "{}");

        drop(rx);
        assert!(matches!(sink.deliver("{}"), Err(SinkError::Closed)));
    }
}
