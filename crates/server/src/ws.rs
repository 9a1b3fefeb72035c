//! WebSocket subscription transport
//!
//! One JSON message per text frame. Two cooperating tasks per connection:
//! the reader services only control frames (tiny read limit) and enforces
//! the pong deadline; the writer owns the socket sink, so live messages,
//! backfill and pings are naturally serialized. Normal close codes are not
//! errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{
    CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code,
};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use herald_protocol::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Server;
use crate::error::Result;
use crate::filter::QueryFilter;
use crate::subscribe::{SubscribeParams, SubscriptionGuard, backfill_messages};
use crate::topic::{SubscriberId, Topic};
use crate::util::Params;
use crate::visitor::Visitor;

/// Per-write deadline
const WS_WRITE_WAIT: Duration = Duration::from_secs(2);

/// We only ever receive pings/pongs
const WS_READ_LIMIT: usize = 64;

/// Slack beyond the keepalive interval before a silent peer is dropped
const WS_PONG_WAIT: Duration = Duration::from_secs(15);

/// Accept a WebSocket subscription.
///
/// Everything that can fail (limits, topic resolution, parameters, the
/// backfill query) happens before the upgrade, so errors still reach the
/// client as regular HTTP responses. After the upgrade, errors are only
/// logged.
pub async fn handle_subscribe_ws(
    server: &Arc<Server>,
    visitor: Arc<Visitor>,
    raw_topics: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let guard = SubscriptionGuard::acquire(&visitor)?;
    let topics = server.topics_from(raw_topics)?;
    let params = SubscribeParams::parse(&Params::new(headers, query))?;

    if params.poll {
        let backfill =
            backfill_messages(server, &topics, &params.since, params.scheduled).await?;
        let filters = params.filters;
        return Ok(ws.max_message_size(WS_READ_LIMIT).on_upgrade(move |mut socket| async move {
            let _guard = guard;
            for m in &backfill {
                if filters.pass(m) && send_json(&mut socket, m).await.is_err() {
                    return;
                }
            }
            let _ = socket.send(close_normal("poll complete")).await;
        }));
    }

    tracing::debug!(visitor = %visitor.id(), topics = %raw_topics, "websocket connection opened");

    let (tx, rx) = mpsc::unbounded_channel::<Arc<Message>>();
    let cancel = CancellationToken::new();
    let registrations: Vec<(Arc<Topic>, SubscriberId)> = topics
        .iter()
        .map(|t| {
            let id = t.subscribe(tx.clone(), visitor.user_id(), cancel.clone());
            (Arc::clone(t), id)
        })
        .collect();

    let backfill = match backfill_messages(server, &topics, &params.since, params.scheduled).await
    {
        Ok(backfill) => backfill,
        Err(e) => {
            for (topic, id) in &registrations {
                topic.unsubscribe(*id);
            }
            return Err(e);
        }
    };

    let session = WsSession {
        server: Arc::clone(server),
        visitor,
        raw_topics: raw_topics.to_string(),
        filters: params.filters,
        registrations,
        cancel,
        rx,
        backfill,
        _guard: guard,
    };
    Ok(ws
        .max_message_size(WS_READ_LIMIT)
        .on_upgrade(move |socket| session.run(socket)))
}

struct WsSession {
    server: Arc<Server>,
    visitor: Arc<Visitor>,
    raw_topics: String,
    filters: QueryFilter,
    registrations: Vec<(Arc<Topic>, SubscriberId)>,
    cancel: CancellationToken,
    rx: mpsc::UnboundedReceiver<Arc<Message>>,
    backfill: Vec<Message>,
    _guard: SubscriptionGuard,
}

impl WsSession {
    async fn run(mut self, socket: WebSocket) {
        let keepalive = self.server.config.server.keepalive_interval;
        let pong_wait = keepalive + WS_PONG_WAIT;
        let shutdown = self.server.shutdown.clone();
        let done = CancellationToken::new();

        let (mut sink, mut stream) = socket.split();

        // Writer: owns the sink; messages, backfill and pings never
        // interleave
        let writer = {
            let done = done.clone();
            let cancel = self.cancel.clone();
            let filters = self.filters.clone();
            let visitor = Arc::clone(&self.visitor);
            let raw_topics = self.raw_topics.clone();
            let backfill = std::mem::take(&mut self.backfill);
            let mut rx = self.rx;
            tokio::spawn(async move {
                let open = Message::open(&raw_topics);
                if write_filtered(&mut sink, &filters, &open).await.is_err() {
                    done.cancel();
                    return;
                }
                for m in &backfill {
                    if write_filtered(&mut sink, &filters, m).await.is_err() {
                        done.cancel();
                        return;
                    }
                }
                loop {
                    tokio::select! {
                        _ = done.cancelled() => break,
                        _ = cancel.cancelled() => {
                            tracing::debug!("cancel received, closing subscriber connection");
                            let _ = sink.send(close_normal("subscription was canceled")).await;
                            break;
                        }
                        _ = shutdown.cancelled() => {
                            let _ = sink.send(close_normal("server is shutting down")).await;
                            break;
                        }
                        received = rx.recv() => match received {
                            Some(m) => {
                                if write_filtered(&mut sink, &filters, &m).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        _ = tokio::time::sleep(keepalive) => {
                            visitor.keepalive();
                            tracing::trace!("sending websocket ping");
                            let ping = WsMessage::Ping(Vec::new().into());
                            if timed_send(&mut sink, ping).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                done.cancel();
            })
        };

        // Reader: only control frames arrive (pong replies); any frame
        // refreshes the read deadline
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                frame = tokio::time::timeout(pong_wait, stream.next()) => match frame {
                    Ok(Some(Ok(_))) => continue,
                    Ok(Some(Err(e))) => {
                        // Normal closes happen a lot and are not errors
                        tracing::debug!(error = %e, "websocket read ended");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::debug!(visitor = %self.visitor.id(), "websocket pong deadline missed");
                        break;
                    }
                },
            }
        }
        done.cancel();
        let _ = writer.await;

        for (topic, id) in &self.registrations {
            topic.unsubscribe(*id);
        }
        tracing::debug!(visitor = %self.visitor.id(), topics = %self.raw_topics, "websocket connection closed");
    }
}

fn close_normal(reason: &'static str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static(reason),
    }))
}

async fn send_json(socket: &mut WebSocket, m: &Message) -> std::result::Result<(), axum::Error> {
    let json = serde_json::to_string(m).unwrap_or_default();
    tokio::time::timeout(WS_WRITE_WAIT, socket.send(WsMessage::Text(json.into())))
        .await
        .map_err(|_| axum::Error::new(std::io::Error::other("write timeout")))?
}

async fn write_filtered(
    sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    filters: &QueryFilter,
    m: &Message,
) -> std::result::Result<(), axum::Error> {
    if !filters.pass(m) {
        return Ok(());
    }
    let json = serde_json::to_string(m).unwrap_or_default();
    timed_send(sink, WsMessage::Text(json.into())).await
}

async fn timed_send(
    sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    message: WsMessage,
) -> std::result::Result<(), axum::Error> {
    tokio::time::timeout(WS_WRITE_WAIT, sink.send(message))
        .await
        .map_err(|_| axum::Error::new(std::io::Error::other("write timeout")))?
}
