//! In-memory message cache
//!
//! Used when no cache file is configured. Messages survive for the
//! configured retention but are lost on restart.

use async_trait::async_trait;
use chrono::Utc;
use herald_protocol::{Message, SinceMarker};
use parking_lot::Mutex;

use super::{CacheError, MessageCache, Result};

struct Entry {
    message: Message,
    published: bool,
}

/// Message cache backed by process memory
#[derive(Default)]
pub struct MemCache {
    entries: Mutex<Vec<Entry>>,
}

impl MemCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageCache for MemCache {
    async fn add_message(&self, message: &Message) -> Result<()> {
        let published = message.time <= Utc::now().timestamp();
        self.entries.lock().push(Entry {
            message: message.clone(),
            published,
        });
        Ok(())
    }

    async fn message(&self, id: &str) -> Result<Message> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.message.id == id)
            .map(|e| e.message.clone())
            .ok_or(CacheError::NotFound)
    }

    async fn messages(
        &self,
        topic: &str,
        since: &SinceMarker,
        include_scheduled: bool,
    ) -> Result<Vec<Message>> {
        if since.is_none() {
            return Ok(Vec::new());
        }
        let entries = self.entries.lock();
        // Id markers select by insertion order across topics, like the
        // on-disk variant; an unknown id falls back to a full replay
        let start_index = match since {
            SinceMarker::Id(id) => entries
                .iter()
                .position(|e| e.message.id == *id)
                .map(|i| i + 1)
                .unwrap_or(0),
            _ => 0,
        };
        let mut result = Vec::new();
        for entry in entries.iter().skip(start_index) {
            if entry.message.topic != topic {
                continue;
            }
            if !entry.published && !include_scheduled {
                continue;
            }
            if let SinceMarker::Time(t) = since
                && entry.message.time < *t
            {
                continue;
            }
            result.push(entry.message.clone());
        }
        Ok(result)
    }

    async fn messages_due(&self) -> Result<Vec<Message>> {
        let now = Utc::now().timestamp();
        let mut due: Vec<Message> = self
            .entries
            .lock()
            .iter()
            .filter(|e| !e.published && e.message.time <= now)
            .map(|e| e.message.clone())
            .collect();
        due.sort_by_key(|m| m.time);
        Ok(due)
    }

    async fn mark_published(&self, id: &str) -> Result<()> {
        if let Some(entry) = self.entries.lock().iter_mut().find(|e| e.message.id == id) {
            entry.published = true;
        }
        Ok(())
    }

    async fn topics(&self) -> Result<Vec<String>> {
        let mut topics: Vec<String> = self
            .entries
            .lock()
            .iter()
            .map(|e| e.message.topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        Ok(topics)
    }

    async fn message_count(&self, topic: &str) -> Result<usize> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.message.topic == topic)
            .count())
    }

    async fn attachment_bytes_used(&self, sender: &str, user: Option<&str>) -> Result<u64> {
        let now = Utc::now().timestamp();
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| {
                e.message.sender.to_string() == sender
                    || (user.is_some() && e.message.user.as_deref() == user)
            })
            .filter_map(|e| e.message.attachment.as_ref())
            .filter(|a| a.expires > now)
            .map(|a| a.size as u64)
            .sum())
    }

    async fn attachments_expired(&self, now: i64) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| {
                e.message
                    .attachment
                    .as_ref()
                    .is_some_and(|a| a.size > 0 && a.expires > 0 && a.expires <= now)
            })
            .map(|e| e.message.id.clone())
            .collect())
    }

    async fn prune(&self, now: i64) -> Result<()> {
        self.entries
            .lock()
            .retain(|e| e.message.expires == 0 || e.message.expires > now);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
