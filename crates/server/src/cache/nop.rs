//! No-op message cache, used when caching is disabled
//!
//! Messages are still fanned out to live subscribers; nothing is retained,
//! so replay, polling and delayed delivery are effectively off.

use async_trait::async_trait;
use herald_protocol::{Message, SinceMarker};

use super::{CacheError, MessageCache, Result};

/// The disabled cache
#[derive(Debug, Default)]
pub struct NopCache;

impl NopCache {
    /// Create a nop cache
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageCache for NopCache {
    async fn add_message(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    async fn message(&self, _id: &str) -> Result<Message> {
        Err(CacheError::NotFound)
    }

    async fn messages(
        &self,
        _topic: &str,
        _since: &SinceMarker,
        _include_scheduled: bool,
    ) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn messages_due(&self) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn mark_published(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn topics(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn message_count(&self, _topic: &str) -> Result<usize> {
        Ok(0)
    }

    async fn attachment_bytes_used(&self, _sender: &str, _user: Option<&str>) -> Result<u64> {
        Ok(0)
    }

    async fn attachments_expired(&self, _now: i64) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn prune(&self, _now: i64) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testutil;

    #[tokio::test]
    async fn test_nothing_is_retained() {
        let cache = NopCache::new();
        let m = testutil::message("alerts", "hello");
        cache.add_message(&m).await.unwrap();
        assert!(matches!(cache.message(&m.id).await, Err(CacheError::NotFound)));
        assert!(cache.messages("alerts", &SinceMarker::All, true).await.unwrap().is_empty());
        assert!(cache.messages_due().await.unwrap().is_empty());
        assert!(cache.topics().await.unwrap().is_empty());
    }
}
