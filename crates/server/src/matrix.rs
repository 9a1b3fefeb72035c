//! Matrix push gateway adapter
//!
//! Translates `POST /_matrix/push/v1/notify` requests into UnifiedPush
//! publishes: the topic is taken from the device pushkey (which is one of
//! our topic URLs) and the whole notification JSON becomes the message
//! body. Responses follow the Matrix push spec: a `rejected` list naming
//! pushkeys the homeserver should drop.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use herald_protocol::valid_topic_id;
use serde::{Deserialize, Serialize};

use crate::Server;
use crate::error::{Result, ServerError};
use crate::publish::publish;
use crate::util::read_body_limited;
use crate::visitor::Visitor;

#[derive(Debug, Deserialize)]
struct MatrixRequest {
    notification: Option<MatrixNotification>,
}

#[derive(Debug, Deserialize)]
struct MatrixNotification {
    #[serde(default)]
    devices: Vec<MatrixDevice>,
}

#[derive(Debug, Deserialize)]
struct MatrixDevice {
    #[serde(default)]
    pushkey: String,
}

/// Matrix push response: pushkeys the homeserver should unregister
#[derive(Debug, Serialize)]
struct MatrixResponse {
    rejected: Vec<String>,
}

/// `GET /_matrix/push/v1/notify`: gateway discovery
pub fn discovery(server: &Arc<Server>) -> Result<Response> {
    if server.config.server.base_url.is_empty() {
        return Err(ServerError::internal(std::io::Error::other(
            "base_url must be configured for the Matrix gateway",
        )));
    }
    Ok(Json(serde_json::json!({"unifiedpush": {"gateway": "matrix"}})).into_response())
}

/// `POST /_matrix/push/v1/notify`: publish from Matrix JSON.
///
/// A pushkey that does not belong to this server (or names an invalid
/// topic) is answered with HTTP 200 and the pushkey in `rejected`, so the
/// homeserver unregisters it. Transient failures keep the regular error
/// shape instead; rejecting would permanently kill the pusher.
pub async fn handle_matrix_publish(
    server: &Arc<Server>,
    visitor: &Arc<Visitor>,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: Body,
) -> Response {
    let raw = match read_body_limited(body, server.config.server.message_limit).await {
        Ok(raw) => raw,
        Err(e) => return e.into_response(),
    };
    let pushkey = match parse_pushkey(&raw) {
        Ok(pushkey) => pushkey,
        Err(e) => return e.into_response(),
    };
    let topic = match topic_from_pushkey(&server.config.server.base_url, &pushkey) {
        Some(topic) => topic,
        None => {
            tracing::debug!(pushkey = %pushkey, "rejecting foreign or invalid pushkey");
            return Json(MatrixResponse {
                rejected: vec![pushkey],
            })
            .into_response();
        }
    };

    let mut query = query.clone();
    query.insert("up".to_string(), "1".to_string());
    match publish(server, visitor, &topic, headers, &query, Body::from(raw)).await {
        Ok(_) => Json(MatrixResponse { rejected: vec![] }).into_response(),
        Err(e) => {
            tracing::debug!(pushkey = %pushkey, error = %e, "matrix publish failed");
            e.into_response()
        }
    }
}

fn parse_pushkey(raw: &[u8]) -> Result<String> {
    let request: MatrixRequest = serde_json::from_slice(raw)
        .map_err(|e| ServerError::BodyInvalid(format!("not a Matrix notification: {e}")))?;
    let pushkey = request
        .notification
        .and_then(|n| n.devices.into_iter().next())
        .map(|d| d.pushkey)
        .unwrap_or_default();
    if pushkey.is_empty() {
        return Err(ServerError::BodyInvalid(
            "notification carries no device pushkey".to_string(),
        ));
    }
    Ok(pushkey)
}

/// Extract our topic from a pushkey like
/// `https://push.example.com/upAbc123?up=1`; `None` if the pushkey does
/// not belong to this server
fn topic_from_pushkey(base_url: &str, pushkey: &str) -> Option<String> {
    let base = format!("{}/", base_url.trim_end_matches('/'));
    let rest = pushkey.strip_prefix(&base)?;
    let topic = rest.split(['?', '/']).next().unwrap_or("");
    valid_topic_id(topic).then(|| topic.to_string())
}
