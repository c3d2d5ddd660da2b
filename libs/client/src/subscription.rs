//! Per-event subscriptions. A [`Subscription`] stops receiving as soon as it
//! is dropped.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    by_event: Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Value>)>>>,
}

impl Subscribers {
    pub(crate) fn subscribe(self: &Arc<Self>, event: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.by_event
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, tx));
        Subscription {
            id,
            event: event.to_string(),
            rx,
            subscribers: Arc::clone(self),
        }
    }

    /// Hand `payload` to every live subscriber of `event`.
    pub(crate) fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let mut by_event = self.by_event.lock();
        let Some(subs) = by_event.get_mut(event) else {
            return 0;
        };
        subs.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        let delivered = subs.len();
        if subs.is_empty() {
            by_event.remove(event);
        }
        delivered
    }

    fn unsubscribe(&self, event: &str, id: u64) {
        let mut by_event = self.by_event.lock();
        if let Some(subs) = by_event.get_mut(event) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                by_event.remove(event);
            }
        }
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.by_event.lock().get(event).map_or(0, Vec::len)
    }
}

/// Stream of payloads for one event name.
pub struct Subscription {
    id: u64,
    event: String,
    rx: mpsc::UnboundedReceiver<Value>,
    subscribers: Arc<Subscribers>,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next payload, or `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.unsubscribe(&self.event, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_only_matching_event() {
        let subs = Arc::new(Subscribers::default());
        let mut typing = subs.subscribe("comment:typing");
        let mut chat = subs.subscribe("chat:message:new");

        assert_eq!(subs.dispatch("comment:typing", &json!({"isTyping": true})), 1);
        assert_eq!(typing.recv().await, Some(json!({"isTyping": true})));
        assert!(chat.rx.try_recv().is_err());
    }

    #[test]
    fn drop_unsubscribes() {
        let subs = Arc::new(Subscribers::default());
        let a = subs.subscribe("online:count");
        let b = subs.subscribe("online:count");
        assert_eq!(subs.count("online:count"), 2);

        drop(a);
        assert_eq!(subs.count("online:count"), 1);
        assert_eq!(subs.dispatch("online:count", &json!({"count": 3})), 1);

        drop(b);
        assert_eq!(subs.count("online:count"), 0);
        assert_eq!(subs.dispatch("online:count", &json!({"count": 3})), 0);
    }
}
