//! HTTP subscription transports: ndjson, SSE and raw
//!
//! All three share one lifecycle: check the subscription limit, resolve
//! topics, register a live subscriber on each, then emit `open` →
//! backfill → live messages, with keepalives whenever the stream has been
//! idle for the keepalive interval. Termination (client disconnect,
//! per-user cancellation, shutdown) always unsubscribes from every topic.
//!
//! Only the encoding differs per transport; the WebSocket flavor lives in
//! [`crate::ws`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, header};
use axum::response::Response;
use bytes::Bytes;
use herald_protocol::{Event, Message, SinceMarker, parse_since};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Server;
use crate::error::{Result, ServerError};
use crate::filter::QueryFilter;
use crate::topic::{SubscriberId, Topic};
use crate::util::Params;
use crate::visitor::Visitor;

/// Per-transport message encoding
pub type Encoder = fn(&Message) -> String;

/// One JSON object per line (`application/x-ndjson`)
pub fn encode_json_line(m: &Message) -> String {
    let json = serde_json::to_string(m).unwrap_or_default();
    format!("{json}\n")
}

/// Server-sent events. Non-message events carry an explicit `event:` line
/// so a browser's `onmessage` only fires for real messages.
pub fn encode_sse(m: &Message) -> String {
    let json = serde_json::to_string(m).unwrap_or_default();
    if m.event != Event::Message {
        format!("event: {}\ndata: {json}\n\n", m.event)
    } else {
        format!("data: {json}\n\n")
    }
}

/// Just the message body, newlines flattened. Other events emit a blank
/// line as the keepalive signal.
pub fn encode_raw(m: &Message) -> String {
    if m.event == Event::Message {
        format!("{}\n", m.message.replace('\n', " "))
    } else {
        "\n".to_string()
    }
}

/// Parsed subscription options shared by all transports
pub struct SubscribeParams {
    pub poll: bool,
    pub since: SinceMarker,
    pub scheduled: bool,
    pub filters: QueryFilter,
}

impl SubscribeParams {
    /// Parse poll/since/scheduled/filter options
    pub fn parse(params: &Params<'_>) -> Result<Self> {
        let poll = params.get_bool(false, &["x-poll", "poll", "po"]);
        let scheduled = params.get_bool(false, &["x-scheduled", "scheduled", "sched"]);
        let since = parse_since(&params.get(&["x-since", "since", "si"]), poll)
            .map_err(|e| ServerError::SinceInvalid(e.to_string()))?;
        let filters = QueryFilter::parse(params)?;
        Ok(Self {
            poll,
            since,
            scheduled,
            filters,
        })
    }
}

/// Releases the visitor's subscription slot when the transport ends
pub struct SubscriptionGuard {
    visitor: Arc<Visitor>,
}

impl SubscriptionGuard {
    /// Reserve a slot, failing when the visitor is at its limit
    pub fn acquire(visitor: &Arc<Visitor>) -> Result<Self> {
        if !visitor.add_subscription() {
            return Err(ServerError::TooManySubscriptions);
        }
        Ok(Self {
            visitor: Arc::clone(visitor),
        })
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.visitor.remove_subscription();
    }
}

/// Cached messages across topics, merged and sorted by time
pub async fn backfill_messages(
    server: &Arc<Server>,
    topics: &[Arc<Topic>],
    since: &SinceMarker,
    scheduled: bool,
) -> Result<Vec<Message>> {
    if since.is_none() {
        return Ok(Vec::new());
    }
    let mut messages = Vec::new();
    for topic in topics {
        messages.extend(server.cache.messages(topic.id(), since, scheduled).await?);
    }
    messages.sort_by_key(|m| m.time);
    Ok(messages)
}

/// Serve a streaming subscription over plain HTTP.
pub async fn handle_subscribe_http(
    server: &Arc<Server>,
    visitor: Arc<Visitor>,
    raw_topics: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    content_type: &'static str,
    encoder: Encoder,
) -> Result<Response> {
    let guard = SubscriptionGuard::acquire(&visitor)?;
    let topics = server.topics_from(raw_topics)?;
    let params = SubscribeParams::parse(&Params::new(headers, query))?;

    if params.poll {
        let messages =
            backfill_messages(server, &topics, &params.since, params.scheduled).await?;
        let mut body = String::new();
        for m in &messages {
            if params.filters.pass(m) {
                body.push_str(&encoder(m));
            }
        }
        drop(guard);
        return stream_response(content_type, Body::from(body));
    }

    tracing::debug!(visitor = %visitor.id(), topics = %raw_topics, "stream connection opened");

    // Register before the backfill query so no message can fall between
    // backfill and live delivery
    let (tx, rx) = mpsc::unbounded_channel::<Arc<Message>>();
    let cancel = CancellationToken::new();
    let registrations: Vec<(Arc<Topic>, SubscriberId)> = topics
        .iter()
        .map(|t| {
            let id = t.subscribe(tx.clone(), visitor.user_id(), cancel.clone());
            (Arc::clone(t), id)
        })
        .collect();

    let backfill =
        match backfill_messages(server, &topics, &params.since, params.scheduled).await {
            Ok(backfill) => backfill,
            Err(e) => {
                for (topic, id) in &registrations {
                    topic.unsubscribe(*id);
                }
                return Err(e);
            }
        };

    let (body_tx, body_rx) = mpsc::channel::<std::result::Result<Bytes, std::convert::Infallible>>(16);
    let session = SubscribeSession {
        server: Arc::clone(server),
        visitor,
        raw_topics: raw_topics.to_string(),
        filters: params.filters,
        encoder,
        registrations,
        cancel,
        rx,
        backfill,
        _guard: guard,
    };
    tokio::spawn(session.run(body_tx));

    let stream = futures_util::stream::unfold(body_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    stream_response(content_type, Body::from_stream(stream))
}

fn stream_response(content_type: &'static str, body: Body) -> Result<Response> {
    Response::builder()
        .header(header::CONTENT_TYPE, format!("{content_type}; charset=utf-8"))
        .body(body)
        .map_err(ServerError::internal)
}

struct SubscribeSession {
    server: Arc<Server>,
    visitor: Arc<Visitor>,
    raw_topics: String,
    filters: QueryFilter,
    encoder: Encoder,
    registrations: Vec<(Arc<Topic>, SubscriberId)>,
    cancel: CancellationToken,
    rx: mpsc::UnboundedReceiver<Arc<Message>>,
    backfill: Vec<Message>,
    // Held so the visitor's subscription slot is released when the
    // session ends
    _guard: SubscriptionGuard,
}

impl SubscribeSession {
    async fn run(
        mut self,
        body_tx: mpsc::Sender<std::result::Result<Bytes, std::convert::Infallible>>,
    ) {
        let keepalive = self.server.config.server.keepalive_interval;
        let shutdown = self.server.shutdown.clone();

        let open = Message::open(&self.raw_topics);
        let backfill = std::mem::take(&mut self.backfill);
        let mut alive = Self::send(&body_tx, &self.filters, self.encoder, &open).await;
        if alive {
            for m in &backfill {
                if !Self::send(&body_tx, &self.filters, self.encoder, m).await {
                    alive = false;
                    break;
                }
            }
        }

        while alive {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                received = self.rx.recv() => match received {
                    Some(m) => {
                        alive = Self::send(&body_tx, &self.filters, self.encoder, &m).await;
                    }
                    None => break,
                },
                _ = tokio::time::sleep(keepalive) => {
                    self.visitor.keepalive();
                    let m = Message::keepalive(&self.raw_topics);
                    alive = Self::send(&body_tx, &self.filters, self.encoder, &m).await;
                }
            }
        }

        for (topic, id) in &self.registrations {
            topic.unsubscribe(*id);
        }
        tracing::debug!(visitor = %self.visitor.id(), topics = %self.raw_topics, "stream connection closed");
    }

    /// Encode and push one event; false when the client is gone
    async fn send(
        body_tx: &mpsc::Sender<std::result::Result<Bytes, std::convert::Infallible>>,
        filters: &QueryFilter,
        encoder: Encoder,
        m: &Message,
    ) -> bool {
        if !filters.pass(m) {
            return true;
        }
        body_tx
            .send(Ok(Bytes::from(encoder(m))))
            .await
            .is_ok()
    }
}
