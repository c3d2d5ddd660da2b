//! Single-process bus over one `tokio::sync::broadcast` channel.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::{BroadcastBus, BusMessage, BUS_CAPACITY};

/// Cloneable; every clone shares the same channel, so several gateway
/// instances in one process (tests) behave like a cluster.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Arc<BusMessage>>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus for LocalBus {
    fn publish(&self, message: BusMessage) {
        // No receivers yet is fine.
        let _ = self.sender.send(Arc::new(message));
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<BusMessage>> {
        self.sender.subscribe()
    }
}
