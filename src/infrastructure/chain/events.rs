//! Broadcast event publisher

use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::chain::{ChainEvent, EventPublisher};

/// Fans lifecycle events out to every live subscriber.
///
/// Slow subscribers lag and lose the oldest events; publishing with no
/// subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<ChainEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastEventPublisher {
    fn publish(&self, event: ChainEvent) {
        debug!(
            chain_id = %event.chain_id,
            chain = %event.chain_name,
            event = ?event.kind,
            "Publishing chain event"
        );
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }
}
