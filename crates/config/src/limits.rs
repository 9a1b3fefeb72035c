//! Per-visitor rate limits

use std::time::Duration;

use serde::Deserialize;

/// Token-bucket and quota settings applied to every visitor.
///
/// Buckets start full at `*_burst` and regain one token every
/// `*_replenish`; the bandwidth bucket regains its full capacity once per
/// day.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Message bucket capacity
    pub message_burst: u64,

    /// One message token is regained this often
    #[serde(with = "humantime_serde")]
    pub message_replenish: Duration,

    /// E-mail bucket capacity
    pub email_burst: u64,

    /// One e-mail token is regained this often
    #[serde(with = "humantime_serde")]
    pub email_replenish: Duration,

    /// Auth-failure bucket capacity
    pub auth_failure_burst: u64,

    /// One auth-failure token is regained this often
    #[serde(with = "humantime_serde")]
    pub auth_failure_replenish: Duration,

    /// Concurrent subscriptions per visitor
    pub subscription_limit: i64,

    /// Attachment bandwidth per visitor per day, in bytes (upload + download)
    pub attachment_bandwidth_limit: u64,

    /// Idle visitors are evicted after this long
    #[serde(with = "humantime_serde")]
    pub visitor_retention: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            message_burst: 60,
            message_replenish: Duration::from_secs(5),
            email_burst: 16,
            email_replenish: Duration::from_secs(3600),
            auth_failure_burst: 30,
            auth_failure_replenish: Duration::from_secs(60),
            subscription_limit: 30,
            attachment_bandwidth_limit: 500 * 1024 * 1024,
            visitor_retention: Duration::from_secs(30 * 60),
        }
    }
}
