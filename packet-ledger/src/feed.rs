//! Live event delivery to in-process consumers

use crate::events::LedgerEvent;
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Fan-out of committed events to subscribers
///
/// Events are published while the committing packet's lock is still held,
/// so every subscriber sees each packet's events in `packet_seq` order.
/// Publishers share a read lock; subscribers whose receiver was dropped are
/// pruned after the publish that noticed it.
#[derive(Debug, Default)]
pub struct EventFeed {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<LedgerEvent>>>,
}

impl EventFeed {
    /// Empty feed
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber; it receives events published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LedgerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Deliver committed events to every live subscriber
    pub fn publish(&self, events: &[LedgerEvent]) {
        let closed = {
            let subscribers = self.subscribers.read();
            let mut closed = false;
            for tx in subscribers.iter() {
                closed |= !events.iter().all(|event| tx.send(event.clone()).is_ok());
            }
            closed
        };

        if closed {
            self.subscribers.write().retain(|tx| !tx.is_closed());
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}
