//! Background workers
//!
//! Long-lived tasks spawned at startup: the manager (pruning and stats),
//! the daily stats resetter, the delayed sender and the relay keepaliver.
//! All of them select on the server's shutdown token and log their errors
//! instead of dying; none holds a registry lock across I/O.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use herald_protocol::Message;

use crate::Server;
use crate::cache::CacheError;
use crate::visitor::Visitor;

/// Spawn all workers for a running server
pub fn spawn(server: Arc<Server>) {
    tokio::spawn(run_manager(Arc::clone(&server)));
    tokio::spawn(run_stats_resetter(Arc::clone(&server)));
    tokio::spawn(run_delayed_sender(Arc::clone(&server)));
    tokio::spawn(run_relay_keepaliver(server));
}

/// Prune expired messages, attachments, idle visitors and stale topics
async fn run_manager(server: Arc<Server>) {
    let interval = server.config.server.manager_interval;
    loop {
        tokio::select! {
            _ = server.shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => exec_manager(&server).await,
        }
    }
}

pub(crate) async fn exec_manager(server: &Arc<Server>) {
    let now = Utc::now().timestamp();

    // Attachment blobs whose expiry passed; rows follow via prune below
    if let Some(file_cache) = &server.file_cache {
        match server.cache.attachments_expired(now).await {
            Ok(ids) if !ids.is_empty() => file_cache.remove(&ids).await,
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "expired attachment lookup failed"),
        }
    }
    if let Err(e) = server.cache.prune(now).await {
        tracing::warn!(error = %e, "message prune failed");
    }

    // Idle visitors: pick candidates from a snapshot, evict under the lock
    let retention = server.config.limits.visitor_retention;
    let stale_visitors: Vec<String> = server
        .visitors_snapshot()
        .into_iter()
        .filter(|(_, v)| v.stale(retention))
        .map(|(id, _)| id)
        .collect();
    let evicted_visitors = server.evict_visitors(&stale_visitors);

    // Empty topics past the grace period, unless they still hold messages
    let grace = server.config.server.topic_retention;
    let mut stale_topics = Vec::new();
    for topic in server.topics_snapshot() {
        if !topic.stale(grace) {
            continue;
        }
        match server.cache.message_count(topic.id()).await {
            Ok(0) => stale_topics.push(topic.id().to_string()),
            Ok(_) => {}
            Err(e) => tracing::warn!(topic = %topic.id(), error = %e, "message count failed"),
        }
    }
    let evicted_topics = server.evict_topics(&stale_topics);

    tracing::debug!(
        messages_published = server.messages_published(),
        visitors = server.visitor_count(),
        topics = server.topic_count(),
        evicted_visitors,
        evicted_topics,
        "manager finished"
    );
}

/// Zero all visitor counters at the configured UTC time, once a day
async fn run_stats_resetter(server: Arc<Server>) {
    let (hour, minute) = server
        .config
        .server
        .stats_reset_time()
        .unwrap_or((0, 0));
    loop {
        let wait = duration_until_next(hour, minute);
        tracing::debug!(seconds = wait.as_secs(), "stats resetter sleeping");
        tokio::select! {
            _ = server.shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {
                tracing::info!("resetting all visitor stats (daily task)");
                for (_, visitor) in server.visitors_snapshot() {
                    visitor.reset_stats();
                }
            }
        }
    }
}

fn duration_until_next(hour: u32, minute: u32) -> std::time::Duration {
    let now = Utc::now();
    let today = now.date_naive().and_hms_opt(hour, minute, 0).unwrap_or_default();
    let mut next = Utc.from_utc_datetime(&today);
    if next <= now {
        next += chrono::Duration::days(1);
    }
    (next - now).to_std().unwrap_or(std::time::Duration::from_secs(60))
}

/// Fire delayed messages that have come due
async fn run_delayed_sender(server: Arc<Server>) {
    let interval = server.config.server.delayed_sender_interval;
    loop {
        tokio::select! {
            _ = server.shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = send_delayed_messages(&server).await {
                    tracing::warn!(error = %e, "delayed send cycle failed");
                }
            }
        }
    }
}

pub(crate) async fn send_delayed_messages(server: &Arc<Server>) -> Result<(), CacheError> {
    let due = server.cache.messages_due().await?;
    for message in due {
        let visitor = server.visitor(message.sender, message.user.as_deref());
        if let Err(e) = send_delayed_message(server, &visitor, &message).await {
            tracing::warn!(message_id = %message.id, error = %e, "delayed message send failed");
        }
    }
    Ok(())
}

async fn send_delayed_message(
    server: &Arc<Server>,
    visitor: &Arc<Visitor>,
    message: &Message,
) -> Result<(), CacheError> {
    tracing::debug!(message_id = %message.id, topic = %message.topic, "sending delayed message");
    // A topic with no subscribers at fire time is fine; the message is
    // marked published regardless (fire-and-forget)
    if let Some(topic) = server.existing_topic(&message.topic) {
        topic.publish(Arc::new(message.clone()));
    }
    if let Some(push) = server.push.clone() {
        let v = Arc::clone(visitor);
        let m = message.clone();
        tokio::spawn(async move {
            if let Err(e) = push.send(&v, &m).await {
                tracing::warn!(message_id = %m.id, error = %e, "push relay handoff failed");
            }
        });
    }
    if server.upstream.is_some() {
        let server = Arc::clone(server);
        let m = message.clone();
        tokio::spawn(async move {
            if let Some(upstream) = &server.upstream {
                upstream.forward_poll_request(&m).await;
            }
        });
    }
    // Durable before the message counts as done, or it would fire again
    server.cache.mark_published(&message.id).await
}

/// Keep relay-side connections alive by pushing synthetic keepalives to
/// the control topics
async fn run_relay_keepaliver(server: Arc<Server>) {
    let Some(push) = server.push.clone() else {
        return;
    };
    // A synthetic visitor, not registered anywhere
    let visitor = Visitor::new(
        &server.config,
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        None,
    );
    let keepalive = server.config.push.keepalive_interval;
    let poll = server.config.push.poll_interval;
    loop {
        tokio::select! {
            _ = server.shutdown.cancelled() => return,
            _ = tokio::time::sleep(keepalive) => {
                let m = Message::keepalive(&server.config.push.control_topic);
                if let Err(e) = push.send(&visitor, &m).await {
                    tracing::warn!(error = %e, "relay control keepalive failed");
                }
            }
            _ = tokio::time::sleep(poll) => {
                let m = Message::keepalive(&server.config.push.poll_topic);
                if let Err(e) = push.send(&visitor, &m).await {
                    tracing::warn!(error = %e, "relay poll keepalive failed");
                }
            }
        }
    }
}
