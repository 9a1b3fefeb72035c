//! Request dispatcher
//!
//! Routes, middleware composition and the thin handlers that bind a
//! request to a visitor and hand off to the pipeline modules. Composition
//! order (outermost first): CORS → authenticate → authorize(topic, perm) →
//! handler. Specific paths always win over generic topic paths.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use futures_util::StreamExt;
use herald_protocol::Message;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{Permission, extract_ip, read_auth_value};
use crate::error::{Result, ServerError};
use crate::subscribe::{encode_json_line, encode_raw, encode_sse, handle_subscribe_http};
use crate::util::{detect_content_type, split_no_empty};
use crate::visitor::Visitor;
use crate::{Server, matrix, publish, ws};

/// Build the complete router
pub fn build_router(server: Arc<Server>) -> Router {
    let cors = cors_layer(&server.config.server.access_control_allow_origin);
    Router::new()
        .route("/v1/health", get(handle_health))
        .route(
            "/_matrix/push/v1/notify",
            get(handle_matrix_discovery).post(handle_matrix_notify),
        )
        .route("/file/{file}", get(handle_file).head(handle_file))
        .route("/", axum::routing::put(handle_publish_json).post(handle_publish_json))
        .route(
            "/{topic}",
            get(handle_topic_get)
                .put(handle_publish_topic)
                .post(handle_publish_topic),
        )
        .route("/{topic}/json", get(handle_subscribe_json))
        .route("/{topic}/sse", get(handle_subscribe_sse))
        .route("/{topic}/raw", get(handle_subscribe_raw))
        .route("/{topic}/ws", get(handle_subscribe_ws))
        .route("/{topic}/auth", get(handle_topic_auth))
        .route("/{topic}/publish", get(handle_publish_get))
        .route("/{topic}/send", get(handle_publish_get))
        .route("/{topic}/trigger", get(handle_publish_get))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&server),
            visitor_middleware,
        ))
        .layer(cors)
        .with_state(server)
}

fn cors_layer(allow_origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::PUT,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any);
    if allow_origin == "*" {
        layer.allow_origin(Any)
    } else {
        match allow_origin.parse::<HeaderValue>() {
            Ok(origin) => layer.allow_origin(origin),
            Err(_) => layer.allow_origin(Any),
        }
    }
}

/// Bind the request to a visitor: resolve the source address, verify
/// credentials if any were sent, and stash the visitor for the handlers.
/// Always resolves a visitor, even when rejecting, so failures are
/// rate-limited per identity.
async fn visitor_middleware(
    State(server): State<Arc<Server>>,
    mut req: Request,
    next: Next,
) -> Response {
    let ip = extract_ip(&req, server.config.server.behind_proxy);
    let query_auth = query_param(req.uri().query(), &["authorization", "auth"]);
    let auth_value = match read_auth_value(req.headers(), query_auth.as_deref()) {
        Ok(value) => value,
        Err(e) => return e.into_response(),
    };

    let visitor = if auth_value.is_empty() {
        server.visitor(ip, None)
    } else {
        let anonymous = server.visitor(ip, None);
        let Some(authenticator) = server.authenticator.clone() else {
            return ServerError::Unauthorized.into_response();
        };
        if !anonymous.auth_allowed() {
            return ServerError::TooManyAuthFailures.into_response();
        }
        match authenticator.authenticate(&auth_value).await {
            Ok(user) => server.visitor(ip, Some(&user)),
            Err(()) => {
                tracing::debug!(visitor = %anonymous.id(), "authentication failed");
                return ServerError::Unauthorized.into_response();
            }
        }
    };
    req.extensions_mut().insert(visitor);
    next.run(req).await
}

/// Minimal query lookup for the middleware, which runs before the Query
/// extractor
fn query_param(query: Option<&str>, names: &[&str]) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if names.contains(&key) && !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

/// Check the permission hook for every topic in a comma-separated list
fn authorize(server: &Server, visitor: &Visitor, topics: &str, permission: Permission) -> Result<()> {
    let user = visitor.user_id();
    for topic in split_no_empty(topics, ',') {
        if !server.authorizer.authorize(user.as_deref(), &topic, permission) {
            tracing::debug!(visitor = %visitor.id(), topic = %topic, "access not authorized");
            return Err(ServerError::Forbidden);
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse { healthy: true })
}

async fn handle_publish_topic(
    State(server): State<Arc<Server>>,
    Extension(visitor): Extension<Arc<Visitor>>,
    Path(topic): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Message>> {
    let message = publish::publish(&server, &visitor, &topic, &headers, &query, body).await?;
    Ok(Json(message))
}

/// `GET /{topic}/publish|send|trigger`: publish with query parameters only
async fn handle_publish_get(
    State(server): State<Arc<Server>>,
    Extension(visitor): Extension<Arc<Visitor>>,
    Path(topic): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Message>> {
    let message =
        publish::publish(&server, &visitor, &topic, &headers, &query, Body::empty()).await?;
    Ok(Json(message))
}

/// `PUT|POST /`: publish with the topic inside a JSON body
async fn handle_publish_json(
    State(server): State<Arc<Server>>,
    Extension(visitor): Extension<Arc<Visitor>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Message>> {
    // The topic is only known after the body is parsed; write
    // authorization happens inside the pipeline
    let message = publish::publish_json(&server, &visitor, &headers, &query, body).await?;
    Ok(Json(message))
}

async fn handle_subscribe_json(
    State(server): State<Arc<Server>>,
    Extension(visitor): Extension<Arc<Visitor>>,
    Path(topics): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response> {
    authorize(&server, &visitor, &topics, Permission::Read)?;
    handle_subscribe_http(
        &server,
        visitor,
        &topics,
        &headers,
        &query,
        "application/x-ndjson",
        encode_json_line,
    )
    .await
}

async fn handle_subscribe_sse(
    State(server): State<Arc<Server>>,
    Extension(visitor): Extension<Arc<Visitor>>,
    Path(topics): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response> {
    authorize(&server, &visitor, &topics, Permission::Read)?;
    handle_subscribe_http(
        &server,
        visitor,
        &topics,
        &headers,
        &query,
        "text/event-stream",
        encode_sse,
    )
    .await
}

async fn handle_subscribe_raw(
    State(server): State<Arc<Server>>,
    Extension(visitor): Extension<Arc<Visitor>>,
    Path(topics): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response> {
    authorize(&server, &visitor, &topics, Permission::Read)?;
    handle_subscribe_http(
        &server,
        visitor,
        &topics,
        &headers,
        &query,
        "text/plain",
        encode_raw,
    )
    .await
}

async fn handle_subscribe_ws(
    State(server): State<Arc<Server>>,
    Extension(visitor): Extension<Arc<Visitor>>,
    Path(topics): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    upgrade: std::result::Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
) -> Result<Response> {
    let upgrade = upgrade.map_err(|_| ServerError::WebSocketUpgradeExpected)?;
    authorize(&server, &visitor, &topics, Permission::Read)?;
    ws::handle_subscribe_ws(&server, visitor, &topics, &headers, &query, upgrade).await
}

/// `GET /{topic}/auth`: 200 if the visitor may read the topic
async fn handle_topic_auth(
    State(server): State<Arc<Server>>,
    Extension(visitor): Extension<Arc<Visitor>>,
    Path(topics): Path<String>,
) -> Result<Json<SuccessResponse>> {
    // Resolve first so invalid topics are 400, not 403
    server.topics_from(&topics)?;
    authorize(&server, &visitor, &topics, Permission::Read)?;
    Ok(Json(SuccessResponse { success: true }))
}

/// `GET /{topic}`: UnifiedPush discovery; the web app is not served here
async fn handle_topic_get(
    Path(_topic): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response> {
    let unifiedpush = matches!(
        query.get("up").or_else(|| query.get("unifiedpush")).map(String::as_str),
        Some("1") | Some("yes") | Some("true")
    );
    if unifiedpush {
        return Ok(Json(serde_json::json!({"unifiedpush": {"version": 1}})).into_response());
    }
    Err(ServerError::NotFound)
}

async fn handle_matrix_discovery(State(server): State<Arc<Server>>) -> Result<Response> {
    matrix::discovery(&server)
}

async fn handle_matrix_notify(
    State(server): State<Arc<Server>>,
    Extension(visitor): Extension<Arc<Visitor>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    matrix::handle_matrix_publish(&server, &visitor, &headers, &query, body).await
}

/// `GET|HEAD /file/{id}`: download an attachment.
///
/// Bandwidth is accounted to the uploader, not the downloader, so one
/// uploader cannot multiply their quota through many downloaders. Reads
/// that race a batched cache write are retried briefly.
async fn handle_file(
    State(server): State<Arc<Server>>,
    Extension(visitor): Extension<Arc<Visitor>>,
    Path(file): Path<String>,
    request: Request,
) -> Result<Response> {
    let Some(file_cache) = &server.file_cache else {
        return Err(ServerError::NotFound);
    };
    let id = file.split('.').next().unwrap_or("");
    if !herald_protocol::valid_message_id(id) {
        return Err(ServerError::NotFound);
    }
    let size = file_cache.stat(id).await?;
    let head_only = request.method() == Method::HEAD;
    if head_only {
        return Response::builder()
            .header(header::CONTENT_LENGTH, size)
            .body(Body::empty())
            .map_err(ServerError::internal);
    }

    // Find the message to associate bandwidth with the uploader. If the
    // cache batches writes, the row may trail the file briefly.
    let message = fetch_message_with_retry(&server, id).await?;
    let uploader = match message.user.as_deref() {
        Some(user) => server.visitor(message.sender, Some(user)),
        None if !message.sender.is_unspecified() => server.visitor(message.sender, None),
        None => Arc::clone(&visitor),
    };
    if !uploader.bandwidth_allowed(size) {
        return Err(ServerError::TooMuchBandwidth);
    }

    let (mut blob, _) = file_cache.open(id).await?;
    let mut head = vec![0u8; 512.min(size as usize)];
    blob.read_exact(&mut head).await.map_err(ServerError::internal)?;
    let (content_type, _) = detect_content_type(&head, &file);

    let head_bytes = bytes::Bytes::from(head);
    let rest = tokio_util::io::ReaderStream::new(blob);
    let stream = futures_util::stream::once(async move {
        Ok::<bytes::Bytes, std::io::Error>(head_bytes)
    })
    .chain(rest);

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(stream))
        .map_err(ServerError::internal)
}

async fn fetch_message_with_retry(server: &Arc<Server>, id: &str) -> Result<Message> {
    let mut delays = [0u64, 100, 300, 600].into_iter();
    let retry = !server.config.cache.batch_timeout.is_zero();
    loop {
        match server.cache.message(id).await {
            Ok(message) => return Ok(message),
            Err(crate::cache::CacheError::NotFound) if retry => match delays.next() {
                Some(delay) => {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                None => return Err(ServerError::NotFound),
            },
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "routes_test.rs"]
mod routes_test;
