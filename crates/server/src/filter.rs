//! Subscription filters
//!
//! Subscribers can narrow the stream by id, title, message, priority list
//! and tags. Filters apply to `message` events only; `open` and
//! `keepalive` always pass.

use herald_protocol::{DEFAULT_PRIORITY, Event, Message, parse_priority};

use crate::error::{Result, ServerError};
use crate::util::{Params, split_no_empty};

/// Parsed subscription filters
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueryFilter {
    /// Exact message id
    pub id: String,
    /// Exact message body
    pub message: String,
    /// Exact title
    pub title: String,
    /// Accepted priorities (empty accepts all)
    pub priority: Vec<u8>,
    /// Tags the message must all carry
    pub tags: Vec<String>,
}

impl QueryFilter {
    /// Parse filters from request parameters
    pub fn parse(params: &Params<'_>) -> Result<Self> {
        let mut priority = Vec::new();
        for p in split_no_empty(&params.get(&["x-priority", "priority", "prio", "p"]), ',') {
            let parsed = parse_priority(&p)
                .map_err(|e| ServerError::FilterInvalid(e.to_string()))?;
            priority.push(parsed);
        }
        Ok(Self {
            id: params.get(&["x-id", "id"]),
            message: params.get(&["x-message", "message", "m"]),
            title: params.get(&["x-title", "title", "t"]),
            priority,
            tags: split_no_empty(&params.get(&["x-tags", "tags", "tag", "ta"]), ','),
        })
    }

    /// Whether a message passes this filter
    pub fn pass(&self, m: &Message) -> bool {
        if m.event != Event::Message {
            // Filters only apply to messages
            return true;
        }
        if !self.id.is_empty() && m.id != self.id {
            return false;
        }
        if !self.message.is_empty() && m.message != self.message {
            return false;
        }
        if !self.title.is_empty() && m.title != self.title {
            return false;
        }
        let priority = if m.priority == 0 { DEFAULT_PRIORITY } else { m.priority };
        if !self.priority.is_empty() && !self.priority.contains(&priority) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().all(|t| m.tags.contains(t)) {
            return false;
        }
        true
    }
}
