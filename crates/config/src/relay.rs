//! External relay settings: mobile push, outbound mail, upstream forwarding

use std::time::Duration;

use serde::Deserialize;

/// Mobile push relay settings. The relay itself is an external
/// collaborator; the server only needs to know whether one is configured
/// and which control topics to keep alive.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Credentials file for the push relay; empty disables the relay
    pub key_file: String,

    /// Topic used to keep relay connections alive
    pub control_topic: String,

    /// Topic used to trigger relay-side polling
    pub poll_topic: String,

    /// Cadence of control-topic keepalives
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Cadence of poll-topic keepalives
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            key_file: String::new(),
            control_topic: "~control".to_string(),
            poll_topic: "~poll".to_string(),
            keepalive_interval: Duration::from_secs(3 * 3600),
            poll_interval: Duration::from_secs(20 * 60),
        }
    }
}

/// Outbound mail settings. Only the presence of a sender address matters
/// to the core; the transport is an external collaborator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// SMTP relay address (`host:port`); empty disables e-mail copies
    pub sender_addr: String,

    /// `From` address of outgoing mail
    pub sender_from: String,
}

impl SmtpConfig {
    /// Whether e-mail copies are enabled
    pub fn enabled(&self) -> bool {
        !self.sender_addr.is_empty()
    }
}

/// Upstream server to which poll requests are forwarded (for iOS-style
/// push wakeups on self-hosted instances).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the upstream server; empty disables forwarding
    pub base_url: String,
}
