//! External relay contracts: mobile push, outbound mail, upstream forwarding
//!
//! The concrete transports (FCM, SMTP) live outside the broker. The core
//! only defines the handoff contract and implements the one relay it owns:
//! forwarding poll requests to an upstream server so mobile clients behind
//! a hosted instance still get woken up.

use std::time::Duration;

use async_trait::async_trait;
use herald_protocol::Message;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::visitor::Visitor;

/// Relay handoff failure
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RelayError(pub String);

/// Mobile push handoff. Called fire-and-forget after fan-out; also used by
/// the keepaliver to refresh relay-side connections via control topics.
#[async_trait]
pub trait PushRelay: Send + Sync {
    /// Hand a message to the push transport
    async fn send(&self, visitor: &Visitor, message: &Message) -> Result<(), RelayError>;
}

/// Outbound e-mail handoff, one recipient per call
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send a copy of the message to `to`
    async fn send(&self, visitor: &Visitor, message: &Message, to: &str) -> Result<(), RelayError>;
}

/// Forwards poll requests to an upstream server.
///
/// The upstream topic is the SHA-256 of this server's topic URL, so the
/// upstream learns neither topic names nor message content.
pub struct UpstreamForwarder {
    base_url: String,
    upstream_base_url: String,
    client: reqwest::Client,
}

impl UpstreamForwarder {
    /// Create a forwarder; outbound calls time out after 10 seconds
    pub fn new(base_url: &str, upstream_base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            upstream_base_url: upstream_base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Derive the upstream topic for one of our topics
    pub fn upstream_topic(&self, topic: &str) -> String {
        let topic_url = format!("{}/{}", self.base_url, topic);
        let hash = Sha256::digest(topic_url.as_bytes());
        format!("{hash:x}")
    }

    /// Fire a poll request for a message; failures are logged, never fatal
    pub async fn forward_poll_request(&self, message: &Message) {
        let url = format!(
            "{}/{}",
            self.upstream_base_url,
            self.upstream_topic(&message.topic)
        );
        tracing::debug!(message_id = %message.id, url = %url, "forwarding poll request");
        let result = self
            .client
            .post(&url)
            .header("X-Poll-ID", &message.id)
            .body("")
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(
                    message_id = %message.id,
                    status = %response.status(),
                    "poll request forwarding rejected"
                );
            }
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "poll request forwarding failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_topic_is_stable_hash() {
        let f = UpstreamForwarder::new("https://push.example.com/", "https://upstream.example.com");
        let a = f.upstream_topic("alerts");
        let b = f.upstream_topic("alerts");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(f.upstream_topic("other"), a);
    }
}
