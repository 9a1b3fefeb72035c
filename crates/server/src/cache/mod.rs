//! The message cache
//!
//! Durable store of published messages, backing replay (`since=`), delayed
//! delivery and retention. Three variants share one contract:
//!
//! - [`NopCache`]: caching disabled, everything is a no-op
//! - [`MemCache`]: in-memory, lost on restart
//! - [`SqliteCache`]: on-disk via SQLite, with optional write batching
//!
//! Delayed messages are stored with `published = false` and flipped by
//! [`MessageCache::mark_published`] once the delayed sender has fired them;
//! that flip is always durable before the sender considers the message done.

mod mem;
mod nop;
mod sqlite;

use async_trait::async_trait;
use herald_protocol::{Message, SinceMarker};
use thiserror::Error;

pub use mem::MemCache;
pub use nop::NopCache;
pub use sqlite::SqliteCache;

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// No message with the requested id
    #[error("message not found")]
    NotFound,

    /// Underlying database error
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// The cache has been shut down
    #[error("message cache is closed")]
    Closed,
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Contract shared by all message cache variants
#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Store a message. Delayed messages are stored unpublished; all others
    /// are stored published.
    async fn add_message(&self, message: &Message) -> Result<()>;

    /// Fetch a single message by id
    async fn message(&self, id: &str) -> Result<Message>;

    /// Messages of a topic, newest-last, selected by the since marker.
    /// Unpublished (scheduled) messages are excluded unless requested.
    async fn messages(
        &self,
        topic: &str,
        since: &SinceMarker,
        include_scheduled: bool,
    ) -> Result<Vec<Message>>;

    /// Delayed messages that are due: `time <= now` and not yet published
    async fn messages_due(&self) -> Result<Vec<Message>>;

    /// Mark a message delivered so the delayed sender never fires it again
    async fn mark_published(&self, id: &str) -> Result<()>;

    /// Topic ids with cached messages, used to rehydrate the registry on
    /// startup
    async fn topics(&self) -> Result<Vec<String>>;

    /// Number of cached messages for a topic
    async fn message_count(&self, topic: &str) -> Result<usize>;

    /// Total attachment bytes currently stored by a sender or user, for
    /// quota accounting
    async fn attachment_bytes_used(&self, sender: &str, user: Option<&str>) -> Result<u64>;

    /// Ids of messages whose attachments have expired
    async fn attachments_expired(&self, now: i64) -> Result<Vec<String>>;

    /// Remove messages that expired before `now`
    async fn prune(&self, now: i64) -> Result<()>;

    /// Flush pending writes and shut down
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::Utc;
    use herald_protocol::{Attachment, Message};

    /// A published message with body and expiry, for cache tests
    pub fn message(topic: &str, body: &str) -> Message {
        let mut m = Message::new(topic);
        m.message = body.to_string();
        m.expires = m.time + 3600;
        m
    }

    /// A delayed message due `offset` seconds from now
    pub fn delayed_message(topic: &str, body: &str, offset: i64) -> Message {
        let mut m = message(topic, body);
        m.time = Utc::now().timestamp() + offset;
        m.expires = m.time + 3600;
        m
    }

    /// A message with a stored attachment of `size` bytes
    pub fn attachment_message(topic: &str, sender: &str, size: i64, expires: i64) -> Message {
        let mut m = message(topic, "file incoming");
        m.sender = sender.parse().unwrap();
        m.attachment = Some(Attachment {
            name: "file.bin".to_string(),
            content_type: "application/octet-stream".to_string(),
            size,
            expires,
            url: format!("https://example.com/file/{}", m.id),
            owner: format!("ip:{sender}"),
        });
        m
    }
}

/// Shared conformance tests run against every cache variant
#[cfg(test)]
macro_rules! cache_conformance_tests {
    ($make:expr) => {
        use chrono::Utc;
        use herald_protocol::SinceMarker;

        use $crate::cache::testutil;
        use $crate::cache::{CacheError, MessageCache};

        #[tokio::test]
        async fn test_add_and_fetch_message() {
            let cache = $make.await;
            let m = testutil::message("alerts", "hello");
            cache.add_message(&m).await.unwrap();
            let got = cache.message(&m.id).await.unwrap();
            assert_eq!(got.id, m.id);
            assert_eq!(got.message, "hello");
            assert_eq!(got.topic, "alerts");
        }

        #[tokio::test]
        async fn test_message_not_found() {
            let cache = $make.await;
            let err = cache.message("doesNotExist").await.unwrap_err();
            assert!(matches!(err, CacheError::NotFound));
        }

        #[tokio::test]
        async fn test_messages_since_all_and_none() {
            let cache = $make.await;
            for i in 0..3 {
                cache
                    .add_message(&testutil::message("alerts", &format!("m{i}")))
                    .await
                    .unwrap();
            }
            cache.add_message(&testutil::message("other", "x")).await.unwrap();

            let all = cache.messages("alerts", &SinceMarker::All, false).await.unwrap();
            assert_eq!(all.len(), 3);
            assert_eq!(all[0].message, "m0");
            assert_eq!(all[2].message, "m2");

            let none = cache.messages("alerts", &SinceMarker::None, false).await.unwrap();
            assert!(none.is_empty());
        }

        #[tokio::test]
        async fn test_messages_since_id() {
            let cache = $make.await;
            let m0 = testutil::message("alerts", "m0");
            let m1 = testutil::message("alerts", "m1");
            let m2 = testutil::message("alerts", "m2");
            for m in [&m0, &m1, &m2] {
                cache.add_message(m).await.unwrap();
            }
            let newer = cache
                .messages("alerts", &SinceMarker::Id(m0.id.clone()), false)
                .await
                .unwrap();
            assert_eq!(newer.len(), 2);
            assert_eq!(newer[0].message, "m1");
            assert_eq!(newer[1].message, "m2");
        }

        #[tokio::test]
        async fn test_messages_since_time() {
            let cache = $make.await;
            let mut old = testutil::message("alerts", "old");
            old.time = Utc::now().timestamp() - 1000;
            cache.add_message(&old).await.unwrap();
            cache.add_message(&testutil::message("alerts", "new")).await.unwrap();

            let since = SinceMarker::Time(Utc::now().timestamp() - 10);
            let recent = cache.messages("alerts", &since, false).await.unwrap();
            assert_eq!(recent.len(), 1);
            assert_eq!(recent[0].message, "new");
        }

        #[tokio::test]
        async fn test_scheduled_messages_hidden_until_requested() {
            let cache = $make.await;
            cache.add_message(&testutil::message("alerts", "now")).await.unwrap();
            cache
                .add_message(&testutil::delayed_message("alerts", "later", 600))
                .await
                .unwrap();

            let visible = cache.messages("alerts", &SinceMarker::All, false).await.unwrap();
            assert_eq!(visible.len(), 1);
            let with_scheduled = cache.messages("alerts", &SinceMarker::All, true).await.unwrap();
            assert_eq!(with_scheduled.len(), 2);
        }

        #[tokio::test]
        async fn test_delayed_message_lifecycle() {
            let cache = $make.await;
            let due = testutil::delayed_message("alerts", "due", -5);
            let pending = testutil::delayed_message("alerts", "pending", 600);
            cache.add_message(&due).await.unwrap();
            cache.add_message(&pending).await.unwrap();

            let ready = cache.messages_due().await.unwrap();
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].id, due.id);

            cache.mark_published(&due.id).await.unwrap();
            assert!(cache.messages_due().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_topics_and_counts() {
            let cache = $make.await;
            cache.add_message(&testutil::message("a", "1")).await.unwrap();
            cache.add_message(&testutil::message("a", "2")).await.unwrap();
            cache.add_message(&testutil::message("b", "3")).await.unwrap();

            let mut topics = cache.topics().await.unwrap();
            topics.sort();
            assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);
            assert_eq!(cache.message_count("a").await.unwrap(), 2);
            assert_eq!(cache.message_count("b").await.unwrap(), 1);
            assert_eq!(cache.message_count("c").await.unwrap(), 0);
        }

        #[tokio::test]
        async fn test_prune_removes_expired() {
            let cache = $make.await;
            let mut expired = testutil::message("alerts", "old");
            expired.expires = Utc::now().timestamp() - 10;
            cache.add_message(&expired).await.unwrap();
            cache.add_message(&testutil::message("alerts", "fresh")).await.unwrap();

            cache.prune(Utc::now().timestamp()).await.unwrap();
            let left = cache.messages("alerts", &SinceMarker::All, true).await.unwrap();
            assert_eq!(left.len(), 1);
            assert_eq!(left[0].message, "fresh");
        }

        #[tokio::test]
        async fn test_attachment_accounting() {
            let cache = $make.await;
            let future = Utc::now().timestamp() + 3600;
            cache
                .add_message(&testutil::attachment_message("alerts", "1.2.3.4", 100, future))
                .await
                .unwrap();
            cache
                .add_message(&testutil::attachment_message("alerts", "1.2.3.4", 50, future))
                .await
                .unwrap();
            cache
                .add_message(&testutil::attachment_message("alerts", "5.6.7.8", 30, future))
                .await
                .unwrap();

            assert_eq!(cache.attachment_bytes_used("1.2.3.4", None).await.unwrap(), 150);
            assert_eq!(cache.attachment_bytes_used("5.6.7.8", None).await.unwrap(), 30);
            assert_eq!(cache.attachment_bytes_used("9.9.9.9", None).await.unwrap(), 0);
        }

        #[tokio::test]
        async fn test_attachments_expired() {
            let cache = $make.await;
            let now = Utc::now().timestamp();
            let gone = testutil::attachment_message("alerts", "1.2.3.4", 10, now - 60);
            let kept = testutil::attachment_message("alerts", "1.2.3.4", 10, now + 3600);
            cache.add_message(&gone).await.unwrap();
            cache.add_message(&kept).await.unwrap();

            let expired = cache.attachments_expired(now).await.unwrap();
            assert_eq!(expired, vec![gone.id.clone()]);
        }
    };
}

#[cfg(test)]
pub(crate) use cache_conformance_tests;
