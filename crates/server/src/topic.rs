//! Topics and their subscriber sets
//!
//! A topic owns a map of live subscribers. Each subscriber entry holds the
//! sending half of an unbounded channel; the subscription transport owns the
//! receiving half and performs the actual socket writes. Fan-out therefore
//! never blocks on a slow client: a failed send means the transport is gone
//! and the subscriber is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use herald_protocol::Message;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identifies a subscriber within one topic
pub type SubscriberId = u64;

struct Subscriber {
    sender: mpsc::UnboundedSender<Arc<Message>>,
    user_id: Option<String>,
    cancel: CancellationToken,
}

struct TopicInner {
    next_id: SubscriberId,
    subscribers: HashMap<SubscriberId, Subscriber>,
}

/// A named message channel, created on first use
pub struct Topic {
    id: String,
    inner: Mutex<TopicInner>,
    last_access: Mutex<Instant>,
}

impl Topic {
    /// Create an empty topic
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            inner: Mutex::new(TopicInner {
                next_id: 0,
                subscribers: HashMap::new(),
            }),
            last_access: Mutex::new(Instant::now()),
        }
    }

    /// Topic id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a live subscriber; returns its id within this topic
    pub fn subscribe(
        &self,
        sender: mpsc::UnboundedSender<Arc<Message>>,
        user_id: Option<String>,
        cancel: CancellationToken,
    ) -> SubscriberId {
        *self.last_access.lock() = Instant::now();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                sender,
                user_id,
                cancel,
            },
        );
        id
    }

    /// Remove a subscriber; idempotent
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.lock().subscribers.remove(&id);
    }

    /// Deliver a message to every live subscriber.
    ///
    /// Takes a snapshot of the subscriber set under the lock, then sends
    /// outside it. A failed send unsubscribes that subscriber and is logged,
    /// but does not abort fan-out.
    pub fn publish(&self, message: Arc<Message>) {
        *self.last_access.lock() = Instant::now();
        let snapshot: Vec<(SubscriberId, mpsc::UnboundedSender<Arc<Message>>)> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .iter()
                .map(|(id, s)| (*id, s.sender.clone()))
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }
        tracing::trace!(topic = %self.id, subscribers = snapshot.len(), "forwarding message");
        for (id, sender) in snapshot {
            if sender.send(Arc::clone(&message)).is_err() {
                tracing::debug!(topic = %self.id, subscriber = id, "subscriber gone, removing");
                self.unsubscribe(id);
            }
        }
    }

    /// Cancel the subscriptions of a user so their transports return
    /// cleanly (permission changes, shutdown)
    pub fn cancel_subscribers(&self, user_id: &str) {
        let cancels: Vec<CancellationToken> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .values()
                .filter(|s| s.user_id.as_deref() == Some(user_id))
                .map(|s| s.cancel.clone())
                .collect()
        };
        for cancel in cancels {
            cancel.cancel();
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Whether this topic is eligible for eviction: no subscribers and no
    /// activity within the grace period
    pub fn stale(&self, grace: Duration) -> bool {
        self.subscriber_count() == 0 && self.last_access.lock().elapsed() > grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber() -> (
        mpsc::UnboundedSender<Arc<Message>>,
        mpsc::UnboundedReceiver<Arc<Message>>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_subscriber_ids_are_unique() {
        let topic = Topic::new("alerts");
        let (tx, _rx) = subscriber();
        let a = topic.subscribe(tx.clone(), None, CancellationToken::new());
        let b = topic.subscribe(tx, None, CancellationToken::new());
        assert_ne!(a, b);
        assert_eq!(topic.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let topic = Topic::new("alerts");
        let (tx, mut rx) = subscriber();
        topic.subscribe(tx, None, CancellationToken::new());
        for i in 0..10 {
            let mut m = Message::new("alerts");
            m.message = format!("msg-{i}");
            topic.publish(Arc::new(m));
        }
        for i in 0..10 {
            let m = rx.recv().await.unwrap();
            assert_eq!(m.message, format!("msg-{i}"));
        }
    }

    #[tokio::test]
    async fn test_failed_send_unsubscribes() {
        let topic = Topic::new("alerts");
        let (tx, rx) = subscriber();
        topic.subscribe(tx, None, CancellationToken::new());
        drop(rx);
        topic.publish(Arc::new(Message::new("alerts")));
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_does_not_abort_fanout() {
        let topic = Topic::new("alerts");
        let (dead_tx, dead_rx) = subscriber();
        let (live_tx, mut live_rx) = subscriber();
        topic.subscribe(dead_tx, None, CancellationToken::new());
        topic.subscribe(live_tx, None, CancellationToken::new());
        drop(dead_rx);
        topic.publish(Arc::new(Message::new("alerts")));
        assert!(live_rx.recv().await.is_some());
        assert_eq!(topic.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let topic = Topic::new("alerts");
        let (tx, _rx) = subscriber();
        let id = topic.subscribe(tx, None, CancellationToken::new());
        topic.unsubscribe(id);
        topic.unsubscribe(id);
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_subscribers_matches_user() {
        let topic = Topic::new("alerts");
        let (tx, _rx1) = subscriber();
        let user_cancel = CancellationToken::new();
        topic.subscribe(tx, Some("u_1".to_string()), user_cancel.clone());
        let (tx, _rx2) = subscriber();
        let anon_cancel = CancellationToken::new();
        topic.subscribe(tx, None, anon_cancel.clone());

        topic.cancel_subscribers("u_1");
        assert!(user_cancel.is_cancelled());
        assert!(!anon_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_stale() {
        let topic = Topic::new("alerts");
        std::thread::sleep(Duration::from_millis(5));
        assert!(topic.stale(Duration::ZERO));
        assert!(!topic.stale(Duration::from_secs(3600)));
        let (tx, _rx) = subscriber();
        topic.subscribe(tx, None, CancellationToken::new());
        assert!(!topic.stale(Duration::ZERO));
    }
}
