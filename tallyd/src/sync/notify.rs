use tokio::sync::broadcast;

/// Advisory hint that some durable state changed. Carries no data on
/// purpose: subscribers re-read authoritative state from the store instead
/// of trusting message payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeHint {
    QueueChanged,
    ConflictsChanged,
}

#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeHint>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeHint> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; a hint with no listeners is simply dropped.
    pub fn publish(&self, hint: ChangeHint) {
        let _ = self.tx.send(hint);
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_hints() {
        let notifier = ChangeNotifier::default();
        let mut rx = notifier.subscribe();
        notifier.publish(ChangeHint::QueueChanged);
        notifier.publish(ChangeHint::ConflictsChanged);
        assert_eq!(rx.recv().await.unwrap(), ChangeHint::QueueChanged);
        assert_eq!(rx.recv().await.unwrap(), ChangeHint::ConflictsChanged);
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let notifier = ChangeNotifier::default();
        notifier.publish(ChangeHint::QueueChanged);
    }
}
