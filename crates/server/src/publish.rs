//! The publish pipeline
//!
//! One entry point for every way a message can arrive: `PUT|POST /topic`,
//! the JSON body form on `/`, the `GET /topic/publish` shorthand and the
//! Matrix adapter. Parses options from headers and query aliases,
//! classifies the body (text vs. attachment vs. binary), persists, fans
//! out and hands off to the relays.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use herald_protocol::{
    Attachment, EMPTY_MESSAGE_BODY, ENCODING_BASE64, Event, Message, default_attachment_body,
    parse_actions, parse_future_time, parse_priority, valid_topic_id,
};
use serde::Deserialize;

use crate::Server;
use crate::auth::Permission;
use crate::error::{Result, ServerError};
use crate::ratelimit::{FixedLimiter, Limiter};
use crate::util::{Params, PeekedBody, detect_content_type, filename_from_url, peek_body,
    read_body_limited, split_no_empty};
use crate::visitor::Visitor;

fn is_web_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Options parsed from the request, controlling what happens besides
/// fan-out
struct PublishOptions {
    cache: bool,
    push: bool,
    email: String,
    unifiedpush: bool,
}

/// Run the full publish pipeline; returns the stored message.
pub async fn publish(
    server: &Arc<Server>,
    visitor: &Arc<Visitor>,
    topic_id: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: Body,
) -> Result<Message> {
    let topic = server.topic(topic_id)?;
    if !server
        .authorizer
        .authorize(visitor.user_id().as_deref(), topic.id(), Permission::Write)
    {
        return Err(ServerError::Forbidden);
    }
    if !visitor.message_allowed() {
        return Err(ServerError::TooManyMessages);
    }
    let peeked = peek_body(body, server.config.server.message_limit).await?;

    let params = Params::new(headers, query);
    let mut message = Message::new(topic.id());
    let options = parse_publish_params(server, visitor, &params, &mut message)?;
    if !message.poll_id.is_empty() {
        message = Message::poll_request(topic.id(), &message.poll_id);
    }
    message.sender = visitor.ip();
    message.user = visitor.user_id();
    message.expires = message.time + server.config.cache.duration.as_secs() as i64;

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    handle_body(server, visitor, &mut message, peeked, content_length, options.unifiedpush).await?;
    if message.message.is_empty() {
        message.message = EMPTY_MESSAGE_BODY.to_string();
    }

    let delayed = message.is_delayed();
    tracing::debug!(
        message_id = %message.id,
        topic = %message.topic,
        visitor = %visitor.id(),
        delayed,
        unifiedpush = options.unifiedpush,
        "received message"
    );

    if options.cache {
        server.cache.add_message(&message).await?;
    }
    if !delayed {
        topic.publish(Arc::new(message.clone()));
        dispatch_relays(server, visitor, &message, &options);
    }

    visitor.incr_messages();
    server.incr_messages();
    Ok(message)
}

/// Fire-and-forget handoffs to push, mail and the upstream server
fn dispatch_relays(
    server: &Arc<Server>,
    visitor: &Arc<Visitor>,
    message: &Message,
    options: &PublishOptions,
) {
    if options.push && let Some(push) = server.push.clone() {
        let v = Arc::clone(visitor);
        let m = message.clone();
        tokio::spawn(async move {
            if let Err(e) = push.send(&v, &m).await {
                tracing::warn!(message_id = %m.id, error = %e, "push relay handoff failed");
            }
        });
    }
    if !options.email.is_empty() && let Some(mailer) = server.mailer.clone() {
        let v = Arc::clone(visitor);
        let m = message.clone();
        let to = options.email.clone();
        tokio::spawn(async move {
            if let Err(e) = mailer.send(&v, &m, &to).await {
                tracing::warn!(message_id = %m.id, email = %to, error = %e, "mail handoff failed");
            } else {
                v.incr_emails();
            }
        });
    }
    if let Some(server) = server_with_upstream(server) {
        let m = message.clone();
        tokio::spawn(async move {
            if let Some(upstream) = &server.upstream {
                upstream.forward_poll_request(&m).await;
            }
        });
    }
}

fn server_with_upstream(server: &Arc<Server>) -> Option<Arc<Server>> {
    server.upstream.is_some().then(|| Arc::clone(server))
}

fn parse_publish_params(
    server: &Arc<Server>,
    visitor: &Arc<Visitor>,
    params: &Params<'_>,
    m: &mut Message,
) -> Result<PublishOptions> {
    let mut cache = params.get_bool(true, &["x-cache", "cache"]);
    let mut push = params.get_bool(true, &["x-firebase", "firebase"]);
    m.title = params.get(&["x-title", "title", "t"]);
    m.click = params.get(&["x-click", "click"]);

    let icon = params.get(&["x-icon", "icon"]);
    if !icon.is_empty() {
        if !is_web_url(&icon) {
            return Err(ServerError::UrlInvalid);
        }
        m.icon = icon;
    }

    let filename = params.get(&["x-filename", "filename", "file", "f"]);
    let attach = params.get(&["x-attach", "attach", "a"]);
    if !attach.is_empty() || !filename.is_empty() {
        m.attachment = Some(Attachment::default());
    }
    if let Some(attachment) = m.attachment.as_mut() {
        attachment.name = filename;
        if !attach.is_empty() {
            if !is_web_url(&attach) {
                return Err(ServerError::UrlInvalid);
            }
            if attachment.name.is_empty() {
                attachment.name = filename_from_url(&attach).unwrap_or_default();
            }
            if attachment.name.is_empty() {
                attachment.name = "attachment".to_string();
            }
            attachment.url = attach;
        }
    }

    let mut email = params.get(&["x-email", "x-e-mail", "email", "e-mail", "mail", "e"]);
    if !email.is_empty() {
        if !visitor.email_allowed() {
            return Err(ServerError::TooManyEmails);
        }
        if server.mailer.is_none() {
            return Err(ServerError::EmailDisabled);
        }
    }

    let body_param = params.get(&["x-message", "message", "m"]).replace("\\n", "\n");
    if !body_param.is_empty() {
        m.message = body_param;
    }

    m.priority = parse_priority(&params.get(&["x-priority", "priority", "prio", "p"]))
        .map_err(|e| ServerError::PriorityInvalid(e.to_string()))?;

    let tags = params.get(&["x-tags", "tags", "tag", "ta"]);
    if !tags.is_empty() {
        m.tags = split_no_empty(&tags, ',');
    }

    let delay = params.get(&["x-delay", "delay", "x-at", "at", "x-in", "in"]);
    if !delay.is_empty() {
        if !cache {
            return Err(ServerError::DelayNoCache);
        }
        if !email.is_empty() {
            // The e-mail address cannot be stored with the message
            return Err(ServerError::DelayNoEmail);
        }
        let now = Utc::now().timestamp();
        let at = parse_future_time(&delay, now)
            .map_err(|e| ServerError::DelayInvalid(e.to_string()))?;
        let min = now + server.config.server.min_delay.as_secs() as i64;
        let max = now + server.config.server.max_delay.as_secs() as i64;
        m.time = at.clamp(min, max);
    }

    let actions = params.get(&["x-actions", "actions", "action"]);
    if !actions.is_empty() {
        m.actions = parse_actions(&actions)
            .map_err(|e| ServerError::ActionsInvalid(e.to_string()))?;
    }

    let mut unifiedpush = params.get_bool(false, &["x-unifiedpush", "unifiedpush", "up"]);
    if unifiedpush {
        push = false;
    }

    m.poll_id = params.get(&["x-poll-id", "poll-id"]);
    if !m.poll_id.is_empty() {
        unifiedpush = false;
        cache = false;
        email = String::new();
    }

    Ok(PublishOptions {
        cache,
        push,
        email,
        unifiedpush,
    })
}

/// Decide whether the body is the message or an attachment.
///
/// Exclusive ladder, first match wins:
/// 1. poll-request event: body is discarded
/// 2. unifiedpush: inline if UTF-8, else base64
/// 3. external attachment URL set: body is the text message
/// 4. attachment name set: body is stored as the attachment
/// 5. body fits the limit and is UTF-8: text message
/// 6. everything else: stored as an attachment
async fn handle_body(
    server: &Arc<Server>,
    visitor: &Arc<Visitor>,
    m: &mut Message,
    peeked: PeekedBody,
    content_length: Option<u64>,
    unifiedpush: bool,
) -> Result<()> {
    if m.event == Event::PollRequest {
        return Ok(());
    }
    if unifiedpush {
        return body_as_binary_message(m, &peeked);
    }
    let has_external_url = m.attachment.as_ref().is_some_and(|a| !a.url.is_empty());
    if has_external_url {
        return body_as_text_message(m, &peeked);
    }
    let has_name = m.attachment.as_ref().is_some_and(|a| !a.name.is_empty());
    if has_name {
        return body_as_attachment(server, visitor, m, peeked, content_length).await;
    }
    if !peeked.limit_reached && std::str::from_utf8(&peeked.peeked).is_ok() {
        return body_as_text_message(m, &peeked);
    }
    body_as_attachment(server, visitor, m, peeked, content_length).await
}

/// UnifiedPush: inline UTF-8 as-is, base64-encode anything binary
fn body_as_binary_message(m: &mut Message, peeked: &PeekedBody) -> Result<()> {
    match std::str::from_utf8(&peeked.peeked) {
        Ok(text) => m.message = text.to_string(), // do not trim
        Err(_) => {
            m.message = base64::engine::general_purpose::STANDARD.encode(&peeked.peeked);
            m.encoding = ENCODING_BASE64.to_string();
        }
    }
    Ok(())
}

fn body_as_text_message(m: &mut Message, peeked: &PeekedBody) -> Result<()> {
    let text = std::str::from_utf8(&peeked.peeked).map_err(|_| ServerError::MessageNotUtf8)?;
    if !text.is_empty() {
        // An empty body must not override ?message= (publish via GET)
        m.message = text.trim().to_string();
    }
    if m.message.is_empty()
        && let Some(attachment) = &m.attachment
        && !attachment.name.is_empty()
    {
        m.message = default_attachment_body(&attachment.name);
    }
    Ok(())
}

async fn body_as_attachment(
    server: &Arc<Server>,
    visitor: &Arc<Visitor>,
    m: &mut Message,
    peeked: PeekedBody,
    content_length: Option<u64>,
) -> Result<()> {
    let Some(file_cache) = &server.file_cache else {
        return Err(ServerError::AttachmentsDisallowed);
    };
    if server.config.server.base_url.is_empty() {
        return Err(ServerError::AttachmentsDisallowed);
    }
    let info = visitor.info(server.cache.as_ref()).await;
    let attachment_expires =
        Utc::now().timestamp() + info.limits.attachment_expiry.as_secs() as i64;
    if m.time > attachment_expires {
        return Err(ServerError::AttachmentExpiryBeforeDelivery);
    }
    // Early do-not-trust check against the declared length; the limiter
    // chain below enforces the hard limit
    if let Some(length) = content_length
        && (length > info.stats.attachment_total_size_remaining
            || length > info.limits.attachment_file_size)
    {
        return Err(ServerError::AttachmentTooLarge);
    }

    let attachment = m.attachment.get_or_insert_with(Attachment::default);
    attachment.expires = attachment_expires;
    attachment.owner = visitor.id().to_string();
    let (content_type, ext) = detect_content_type(&peeked.peeked, &attachment.name);
    attachment.content_type = content_type;
    attachment.url = format!(
        "{}/file/{}{ext}",
        server.config.server.base_url.trim_end_matches('/'),
        m.id
    );
    if attachment.name.is_empty() {
        attachment.name = format!("attachment{ext}");
    }
    if m.message.is_empty() {
        m.message = default_attachment_body(&attachment.name);
    }

    let bandwidth = visitor.bandwidth_limiter();
    let file_limit = FixedLimiter::new(info.limits.attachment_file_size);
    let quota_limit = FixedLimiter::new(info.stats.attachment_total_size_remaining);
    let limiters: [&dyn Limiter; 3] = [bandwidth.as_ref(), &file_limit, &quota_limit];

    let leftover: Bytes = peeked.leftover;
    let rest = futures_util::stream::once(async move { Ok::<Bytes, axum::Error>(leftover) })
        .chain(peeked.rest);
    let size = file_cache
        .write(&m.id, &peeked.peeked, Box::pin(rest), &limiters)
        .await?;
    if let Some(attachment) = m.attachment.as_mut() {
        attachment.size = size;
    }
    Ok(())
}

/// The JSON body form: `PUT|POST /` with the topic inside the body.
///
/// Translated into the header form and run through the same pipeline.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PublishRequest {
    pub topic: String,
    pub message: String,
    pub title: String,
    pub priority: u8,
    pub tags: Vec<String>,
    pub click: String,
    pub icon: String,
    pub attach: String,
    pub filename: String,
    pub email: String,
    pub delay: String,
    pub actions: Vec<herald_protocol::Action>,
}

/// Parse a JSON publish body and run the pipeline
pub async fn publish_json(
    server: &Arc<Server>,
    visitor: &Arc<Visitor>,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: Body,
) -> Result<Message> {
    // 2x the message limit to account for JSON format overhead
    let raw = read_body_limited(body, server.config.server.message_limit * 2).await?;
    let request: PublishRequest =
        serde_json::from_slice(&raw).map_err(|e| ServerError::BodyInvalid(e.to_string()))?;
    if !valid_topic_id(&request.topic) {
        return Err(ServerError::TopicInvalid);
    }

    let mut translated = headers.clone();
    let mut set = |name: &'static str, value: &str| {
        if !value.is_empty()
            && let Ok(value) = HeaderValue::from_str(value)
        {
            translated.insert(HeaderName::from_static(name), value);
        }
    };
    set("x-title", &request.title);
    if request.priority != 0 {
        set("x-priority", &request.priority.to_string());
    }
    set("x-tags", &request.tags.join(","));
    set("x-click", &request.click);
    set("x-icon", &request.icon);
    set("x-attach", &request.attach);
    set("x-filename", &request.filename);
    set("x-email", &request.email);
    set("x-delay", &request.delay);
    if !request.actions.is_empty() {
        let actions = serde_json::to_string(&request.actions)
            .map_err(|e| ServerError::BodyInvalid(e.to_string()))?;
        set("x-actions", &actions);
    }
    // The translated request must not inherit the JSON body length
    translated.remove("content-length");

    let message = if request.message.is_empty() {
        EMPTY_MESSAGE_BODY.to_string()
    } else {
        request.message
    };
    publish(
        server,
        visitor,
        &request.topic,
        &translated,
        query,
        Body::from(message),
    )
    .await
}

#[cfg(test)]
#[path = "publish_test.rs"]
mod publish_test;
