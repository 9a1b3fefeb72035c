//! Herald Server
//!
//! The message-flow engine of the Herald notification broker: topics and
//! their live subscribers, per-visitor rate limiting, the publish pipeline,
//! four subscription transports, the message cache and the background
//! workers that drive retention and delayed delivery.
//!
//! # Usage
//!
//! ```ignore
//! use herald_config::Config;
//! use herald_server::Server;
//!
//! let config = Config::from_file("herald.toml")?;
//! let server = Server::new(config).await?;
//! server.run().await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! publisher ──> routes ──> publish pipeline ──┬─> topic fan-out ──> transports
//!                                             ├─> message cache (replay/delay)
//!                                             ├─> attachment cache
//!                                             └─> relays (push, mail, upstream)
//! subscriber ─> routes ──> transports ──> cache backfill + live subscription
//! ```

pub mod auth;
pub mod cache;
pub mod error;
pub mod file_cache;
pub mod filter;
pub mod matrix;
pub mod publish;
pub mod ratelimit;
pub mod relay;
pub mod routes;
pub mod subscribe;
pub mod topic;
pub mod util;
pub mod visitor;
pub mod workers;
pub mod ws;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use herald_config::Config;
use herald_protocol::valid_topic_id;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use auth::{AllowAll, Authenticator, Authorizer, Permission};
pub use cache::{MemCache, MessageCache, NopCache, SqliteCache};
pub use error::{Result, ServerError};
pub use relay::{Mailer, PushRelay, RelayError, UpstreamForwarder};
pub use routes::build_router;
pub use topic::Topic;
pub use visitor::Visitor;

use file_cache::FileCache;

/// The Herald server: owns topics, visitors and the caches
pub struct Server {
    pub(crate) config: Config,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    visitors: Mutex<HashMap<String, Arc<Visitor>>>,
    messages: AtomicU64,
    pub(crate) cache: Arc<dyn MessageCache>,
    pub(crate) file_cache: Option<FileCache>,
    pub(crate) mailer: Option<Arc<dyn Mailer>>,
    pub(crate) push: Option<Arc<dyn PushRelay>>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) upstream: Option<UpstreamForwarder>,
    pub(crate) shutdown: CancellationToken,
}

impl Server {
    /// Create a server from configuration.
    ///
    /// Picks the cache variant (`duration = 0` → nop, no file → memory,
    /// file → SQLite), opens the attachment cache and rehydrates the topic
    /// registry from cached messages.
    pub async fn new(config: Config) -> Result<Self> {
        let cache: Arc<dyn MessageCache> = if config.cache.duration.is_zero() {
            Arc::new(NopCache::new())
        } else if config.cache.file.is_empty() {
            Arc::new(MemCache::new())
        } else {
            Arc::new(
                SqliteCache::new(
                    &config.cache.file,
                    config.cache.batch_size,
                    config.cache.batch_timeout,
                )
                .await?,
            )
        };
        let file_cache = if config.attachments.enabled() {
            Some(
                FileCache::new(&config.attachments.cache_dir, config.attachments.total_size_limit)
                    .map_err(ServerError::internal)?,
            )
        } else {
            None
        };
        let upstream = if config.upstream.base_url.is_empty() {
            None
        } else {
            Some(UpstreamForwarder::new(
                &config.server.base_url,
                &config.upstream.base_url,
            ))
        };

        let mut topics = HashMap::new();
        for id in cache.topics().await? {
            topics.insert(id.clone(), Arc::new(Topic::new(&id)));
        }
        if !topics.is_empty() {
            tracing::info!(topics = topics.len(), "rehydrated topics from cache");
        }

        Ok(Self {
            config,
            topics: Mutex::new(topics),
            visitors: Mutex::new(HashMap::new()),
            messages: AtomicU64::new(0),
            cache,
            file_cache,
            mailer: None,
            push: None,
            authenticator: None,
            authorizer: Arc::new(AllowAll),
            upstream,
            shutdown: CancellationToken::new(),
        })
    }

    /// Install a mobile push relay
    pub fn with_push(mut self, relay: Arc<dyn PushRelay>) -> Self {
        self.push = Some(relay);
        self
    }

    /// Install an outbound mailer
    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Install a credential verification hook
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Replace the topic permission hook (default: allow everything)
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Token cancelled on shutdown; workers and transports select on it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop listeners, close transports and flush the cache
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind the listener, start the workers and serve until shutdown.
    ///
    /// A bind failure is fatal; everything later is handled per-request.
    pub async fn run(self) -> Result<()> {
        let server = Arc::new(self);
        let listener = TcpListener::bind(&server.config.server.listen_http)
            .await
            .map_err(ServerError::internal)?;
        tracing::info!(addr = %server.config.server.listen_http, "listening");

        workers::spawn(Arc::clone(&server));

        let app = routes::build_router(Arc::clone(&server));
        let shutdown = server.shutdown.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::internal)?;

        tracing::info!("shutting down, flushing cache");
        server.cache.close().await?;
        Ok(())
    }

    /// Get or create the visitor for an (ip, user) identity. Updates
    /// `last seen` and re-binds the user on every call.
    pub fn visitor(&self, ip: IpAddr, user: Option<&str>) -> Arc<Visitor> {
        let id = visitor::visitor_id(ip, user);
        let mut visitors = self.visitors.lock();
        if let Some(v) = visitors.get(&id) {
            v.keepalive();
            v.set_user_id(user);
            return Arc::clone(v);
        }
        let v = Arc::new(Visitor::new(&self.config, ip, user));
        visitors.insert(id, Arc::clone(&v));
        v
    }

    /// Resolve a comma-separated topic list, lazily creating topics.
    ///
    /// Rejects invalid and disallowed ids and honors the server-wide topic
    /// limit.
    pub fn topics_from(&self, list: &str) -> Result<Vec<Arc<Topic>>> {
        let ids = util::split_no_empty(list, ',');
        if ids.is_empty() {
            return Err(ServerError::TopicInvalid);
        }
        let mut topics = self.topics.lock();
        let mut result = Vec::with_capacity(ids.len());
        for id in &ids {
            if !valid_topic_id(id) {
                return Err(ServerError::TopicInvalid);
            }
            if self.config.server.disallowed_topics.contains(id) {
                return Err(ServerError::TopicDisallowed);
            }
            if !topics.contains_key(id) {
                if topics.len() >= self.config.server.total_topic_limit {
                    return Err(ServerError::TooManyTopics);
                }
                topics.insert(id.clone(), Arc::new(Topic::new(id)));
            }
            result.push(Arc::clone(&topics[id]));
        }
        Ok(result)
    }

    /// Resolve a single topic id
    pub fn topic(&self, id: &str) -> Result<Arc<Topic>> {
        Ok(self.topics_from(id)?.remove(0))
    }

    /// A topic that already exists, without creating it
    pub fn existing_topic(&self, id: &str) -> Option<Arc<Topic>> {
        self.topics.lock().get(id).cloned()
    }

    /// Cancel all subscriptions of a user across topics (permission
    /// changes)
    pub fn cancel_user_subscribers(&self, user_id: &str) {
        let topics: Vec<Arc<Topic>> = self.topics.lock().values().cloned().collect();
        for topic in topics {
            topic.cancel_subscribers(user_id);
        }
    }

    /// Count a published message
    pub(crate) fn incr_messages(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages published since startup
    pub fn messages_published(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Snapshot of all visitors, for the manager and the stats resetter
    pub(crate) fn visitors_snapshot(&self) -> Vec<(String, Arc<Visitor>)> {
        self.visitors
            .lock()
            .iter()
            .map(|(id, v)| (id.clone(), Arc::clone(v)))
            .collect()
    }

    /// Drop the given visitors if they are still stale
    pub(crate) fn evict_visitors(&self, ids: &[String]) -> usize {
        let retention = self.config.limits.visitor_retention;
        let mut visitors = self.visitors.lock();
        let before = visitors.len();
        for id in ids {
            if let Some(v) = visitors.get(id)
                && v.stale(retention)
            {
                visitors.remove(id);
            }
        }
        before - visitors.len()
    }

    /// Snapshot of all topics, for the manager
    pub(crate) fn topics_snapshot(&self) -> Vec<Arc<Topic>> {
        self.topics.lock().values().cloned().collect()
    }

    /// Drop the given topics if they are still empty and stale
    pub(crate) fn evict_topics(&self, ids: &[String]) -> usize {
        let grace = self.config.server.topic_retention;
        let mut topics = self.topics.lock();
        let before = topics.len();
        for id in ids {
            if let Some(t) = topics.get(id)
                && t.stale(grace)
            {
                topics.remove(id);
            }
        }
        before - topics.len()
    }

    /// Number of live topics
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    /// Number of tracked visitors
    pub fn visitor_count(&self) -> usize {
        self.visitors.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    pub(crate) async fn test_server() -> Arc<Server> {
        let config = Config::from_str("").unwrap();
        Arc::new(Server::new(config).await.unwrap())
    }

    #[tokio::test]
    async fn test_visitor_identity() {
        let server = test_server().await;
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let a = server.visitor(ip, None);
        let b = server.visitor(ip, None);
        assert_eq!(a.id(), b.id());
        assert_eq!(server.visitor_count(), 1);

        let c = server.visitor(ip, Some("u_1"));
        assert_eq!(c.id(), "user:u_1");
        assert_eq!(server.visitor_count(), 2);
    }

    #[tokio::test]
    async fn test_topics_from_validates() {
        let server = test_server().await;
        let topics = server.topics_from("alerts,backups").unwrap();
        assert_eq!(topics.len(), 2);
        assert!(matches!(server.topics_from("bad/topic"), Err(ServerError::TopicInvalid)));
        assert!(matches!(server.topics_from(""), Err(ServerError::TopicInvalid)));
        assert!(matches!(server.topics_from("docs"), Err(ServerError::TopicDisallowed)));
    }

    #[tokio::test]
    async fn test_topic_limit() {
        let mut config = Config::from_str("").unwrap();
        config.server.total_topic_limit = 2;
        let server = Server::new(config).await.unwrap();
        server.topic("one").unwrap();
        server.topic("two").unwrap();
        assert!(matches!(server.topic("three"), Err(ServerError::TooManyTopics)));
        // Existing topics still resolve
        server.topic("one").unwrap();
    }

    #[tokio::test]
    async fn test_cancel_user_subscribers() {
        use tokio::sync::mpsc;
        use tokio_util::sync::CancellationToken;

        let server = test_server().await;
        let topic = server.topic("alerts").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        topic.subscribe(tx, Some("u_1".to_string()), cancel.clone());

        server.cancel_user_subscribers("u_1");
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_existing_topic() {
        let server = test_server().await;
        assert!(server.existing_topic("alerts").is_none());
        server.topic("alerts").unwrap();
        assert!(server.existing_topic("alerts").is_some());
    }
}
