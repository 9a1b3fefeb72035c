//! Visitors: the rate-limit and accounting identity
//!
//! A visitor is keyed `ip:<addr>` for anonymous clients and `user:<uid>`
//! once authenticated. The server owns all visitors; requests hold an
//! `Arc` for their lifetime only. Idle visitors with no subscriptions are
//! evicted by the manager.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use herald_config::Config;
use parking_lot::{Mutex, RwLock};

use crate::cache::MessageCache;
use crate::ratelimit::TokenBucket;

/// Compute the registry key for an (ip, user) identity
pub fn visitor_id(ip: IpAddr, user: Option<&str>) -> String {
    match user {
        Some(uid) => format!("user:{uid}"),
        None => format!("ip:{ip}"),
    }
}

/// Effective limits of a visitor, fixed at creation from config
#[derive(Debug, Clone)]
pub struct VisitorLimits {
    /// How long published messages live
    pub message_expiry: Duration,
    /// How long attachments live
    pub attachment_expiry: Duration,
    /// Total attachment bytes a visitor may have stored
    pub attachment_total_size: u64,
    /// Largest single attachment
    pub attachment_file_size: u64,
    /// Attachment bandwidth per day
    pub attachment_bandwidth: u64,
    /// Concurrent subscriptions
    pub subscription_limit: i64,
}

/// Point-in-time consumption counters of a visitor
#[derive(Debug, Clone, Default)]
pub struct VisitorStats {
    /// Messages published since the last daily reset
    pub messages: u64,
    /// E-mails sent since the last daily reset
    pub emails: u64,
    /// Attachment bytes currently stored
    pub attachment_total_size: u64,
    /// Attachment bytes still available
    pub attachment_total_size_remaining: u64,
}

/// Limits plus stats, as consumed by the attachment quota checks
#[derive(Debug, Clone)]
pub struct VisitorInfo {
    pub limits: VisitorLimits,
    pub stats: VisitorStats,
}

/// A single rate-limit identity
pub struct Visitor {
    id: String,
    ip: IpAddr,
    user_id: RwLock<Option<String>>,
    message_bucket: TokenBucket,
    email_bucket: TokenBucket,
    auth_bucket: TokenBucket,
    bandwidth_bucket: Arc<TokenBucket>,
    subscriptions: AtomicI64,
    messages: AtomicU64,
    emails: AtomicU64,
    seen: Mutex<Instant>,
    limits: VisitorLimits,
}

impl Visitor {
    /// Create a visitor for an (ip, user) identity with limits from config
    pub fn new(config: &Config, ip: IpAddr, user: Option<&str>) -> Self {
        let limits = VisitorLimits {
            message_expiry: config.cache.duration,
            attachment_expiry: config.attachments.expiry_duration,
            attachment_total_size: config.attachments.total_size_limit,
            attachment_file_size: config.attachments.file_size_limit,
            attachment_bandwidth: config.limits.attachment_bandwidth_limit,
            subscription_limit: config.limits.subscription_limit,
        };
        Self {
            id: visitor_id(ip, user),
            ip,
            user_id: RwLock::new(user.map(String::from)),
            message_bucket: TokenBucket::new(config.limits.message_burst, config.limits.message_replenish),
            email_bucket: TokenBucket::new(config.limits.email_burst, config.limits.email_replenish),
            auth_bucket: TokenBucket::new(
                config.limits.auth_failure_burst,
                config.limits.auth_failure_replenish,
            ),
            bandwidth_bucket: Arc::new(TokenBucket::with_refill(
                config.limits.attachment_bandwidth_limit,
                config.limits.attachment_bandwidth_limit,
                Duration::from_secs(24 * 3600),
            )),
            subscriptions: AtomicI64::new(0),
            messages: AtomicU64::new(0),
            emails: AtomicU64::new(0),
            seen: Mutex::new(Instant::now()),
            limits,
        }
    }

    /// Registry key of this visitor
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Source address of this visitor
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Owning user id, if authenticated
    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }

    /// Re-bind the user; called on every registry lookup so an identity
    /// that authenticates mid-flight is updated
    pub fn set_user_id(&self, user: Option<&str>) {
        *self.user_id.write() = user.map(String::from);
    }

    /// Record activity
    pub fn keepalive(&self) {
        *self.seen.lock() = Instant::now();
    }

    /// Consume one message token; also counts toward daily stats
    pub fn message_allowed(&self) -> bool {
        self.message_bucket.allow()
    }

    /// Consume one e-mail token
    pub fn email_allowed(&self) -> bool {
        self.email_bucket.allow()
    }

    /// Consume one auth-failure token
    pub fn auth_allowed(&self) -> bool {
        self.auth_bucket.allow()
    }

    /// Consume `n` bytes of attachment bandwidth
    pub fn bandwidth_allowed(&self, n: u64) -> bool {
        self.bandwidth_bucket.allow_n(n)
    }

    /// The bandwidth bucket, shared with attachment limiter chains
    pub fn bandwidth_limiter(&self) -> Arc<TokenBucket> {
        Arc::clone(&self.bandwidth_bucket)
    }

    /// Reserve a subscription slot; false when the limit is reached
    pub fn add_subscription(&self) -> bool {
        let prev = self.subscriptions.fetch_add(1, Ordering::SeqCst);
        if prev >= self.limits.subscription_limit {
            self.subscriptions.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Release a subscription slot
    pub fn remove_subscription(&self) {
        self.subscriptions.fetch_sub(1, Ordering::SeqCst);
    }

    /// Count a published message
    pub fn incr_messages(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a sent e-mail
    pub fn incr_emails(&self) {
        self.emails.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero the visible counters and refill buckets (daily reset)
    pub fn reset_stats(&self) {
        self.messages.store(0, Ordering::Relaxed);
        self.emails.store(0, Ordering::Relaxed);
        self.message_bucket.reset();
        self.email_bucket.reset();
    }

    /// Whether this visitor can be evicted
    pub fn stale(&self, retention: Duration) -> bool {
        self.subscriptions.load(Ordering::SeqCst) <= 0 && self.seen.lock().elapsed() > retention
    }

    /// Effective limits
    pub fn limits(&self) -> &VisitorLimits {
        &self.limits
    }

    /// Current consumption, including attachment bytes from the cache
    pub async fn stats(&self, cache: &dyn MessageCache) -> VisitorStats {
        let user = self.user_id();
        let used = cache
            .attachment_bytes_used(&self.ip.to_string(), user.as_deref())
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(visitor = %self.id, error = %e, "attachment size lookup failed");
                0
            });
        VisitorStats {
            messages: self.messages.load(Ordering::Relaxed),
            emails: self.emails.load(Ordering::Relaxed),
            attachment_total_size: used,
            attachment_total_size_remaining: self.limits.attachment_total_size.saturating_sub(used),
        }
    }

    /// Limits plus stats in one call
    pub async fn info(&self, cache: &dyn MessageCache) -> VisitorInfo {
        VisitorInfo {
            limits: self.limits.clone(),
            stats: self.stats(cache).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCache;
    use std::net::Ipv4Addr;

    fn test_visitor() -> Visitor {
        let config = Config::default();
        Visitor::new(&config, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), None)
    }

    #[test]
    fn test_visitor_id() {
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(visitor_id(ip, None), "ip:1.2.3.4");
        assert_eq!(visitor_id(ip, Some("u_abc")), "user:u_abc");
    }

    #[test]
    fn test_message_bucket_exhausts() {
        let v = test_visitor();
        let burst = Config::default().limits.message_burst;
        for _ in 0..burst {
            assert!(v.message_allowed());
        }
        assert!(!v.message_allowed());
    }

    #[test]
    fn test_subscription_limit() {
        let v = test_visitor();
        let limit = Config::default().limits.subscription_limit;
        for _ in 0..limit {
            assert!(v.add_subscription());
        }
        assert!(!v.add_subscription());
        v.remove_subscription();
        assert!(v.add_subscription());
    }

    #[test]
    fn test_user_rebinding() {
        let v = test_visitor();
        assert_eq!(v.user_id(), None);
        v.set_user_id(Some("u_1"));
        assert_eq!(v.user_id(), Some("u_1".to_string()));
        v.set_user_id(None);
        assert_eq!(v.user_id(), None);
    }

    #[test]
    fn test_stale_requires_idle_and_no_subscriptions() {
        let v = test_visitor();
        std::thread::sleep(Duration::from_millis(5));
        assert!(v.stale(Duration::ZERO));
        assert!(!v.stale(Duration::from_secs(3600)));
        v.add_subscription();
        assert!(!v.stale(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_stats_after_reset() {
        let v = test_visitor();
        v.incr_messages();
        v.incr_messages();
        v.incr_emails();
        let cache = MemCache::new();
        let stats = v.stats(&cache).await;
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.emails, 1);
        v.reset_stats();
        let stats = v.stats(&cache).await;
        assert_eq!(stats.messages, 0);
        assert_eq!(stats.emails, 0);
    }
}
