//! Core server settings

use std::time::Duration;

use serde::Deserialize;

/// Server-wide settings: listeners, topic policy, scheduling intervals.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Externally visible base URL (e.g. `https://push.example.com`).
    /// Required for attachments and upstream forwarding.
    pub base_url: String,

    /// HTTP listen address
    pub listen_http: String,

    /// Trust `X-Forwarded-For` for the visitor address
    pub behind_proxy: bool,

    /// Value of the `Access-Control-Allow-Origin` response header
    pub access_control_allow_origin: String,

    /// Topic ids that may never be used
    pub disallowed_topics: Vec<String>,

    /// Upper bound on the number of topics the server will create
    pub total_topic_limit: usize,

    /// Maximum message body size in bytes; larger bodies become attachments
    pub message_limit: usize,

    /// Smallest accepted publish delay; shorter delays are raised to this
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,

    /// Largest accepted publish delay; longer delays are lowered to this
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Interval between keepalive events on live subscriptions
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Interval between manager runs (pruning, stats)
    #[serde(with = "humantime_serde")]
    pub manager_interval: Duration,

    /// Interval between delayed-sender runs
    #[serde(with = "humantime_serde")]
    pub delayed_sender_interval: Duration,

    /// Grace period before an empty topic is eligible for eviction
    #[serde(with = "humantime_serde")]
    pub topic_retention: Duration,

    /// Daily visitor stats reset time, `HH:MM` in UTC
    pub visitor_stats_reset_time: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            listen_http: "0.0.0.0:8080".to_string(),
            behind_proxy: false,
            access_control_allow_origin: "*".to_string(),
            disallowed_topics: ["docs", "static", "file", "app", "account", "settings", "signup", "login", "v1"]
                .map(String::from)
                .to_vec(),
            total_topic_limit: 15_000,
            message_limit: 4096,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3 * 24 * 3600),
            keepalive_interval: Duration::from_secs(45),
            manager_interval: Duration::from_secs(60),
            delayed_sender_interval: Duration::from_secs(10),
            topic_retention: Duration::from_secs(15 * 60),
            visitor_stats_reset_time: "00:00".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parse `visitor_stats_reset_time` into (hour, minute)
    pub fn stats_reset_time(&self) -> Option<(u32, u32)> {
        let (h, m) = self.visitor_stats_reset_time.split_once(':')?;
        let h: u32 = h.parse().ok()?;
        let m: u32 = m.parse().ok()?;
        (h < 24 && m < 60).then_some((h, m))
    }
}
