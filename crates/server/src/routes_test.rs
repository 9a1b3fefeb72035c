//! Router tests
//!
//! End-to-end over the axum router with `tower::ServiceExt::oneshot`.
//! Streaming transports are covered in poll mode (which terminates); the
//! live-loop behavior is tested at the topic/transport layer.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use herald_config::Config;
use tower::ServiceExt;

use crate::{Permission, Server, build_router};

async fn test_app() -> Router {
    app_with(|_| {}).await
}

async fn app_with(mutate: impl FnOnce(&mut Config)) -> Router {
    let mut config = Config::default();
    mutate(&mut config);
    let server = Arc::new(Server::new(config).await.unwrap());
    build_router(server)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// =============================================================================
// Health and discovery
// =============================================================================

#[tokio::test]
async fn test_health() {
    let app = test_app().await;
    let response = app.oneshot(get("/v1/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["healthy"], true);
}

#[tokio::test]
async fn test_unifiedpush_topic_discovery() {
    let app = test_app().await;
    let response = app.oneshot(get("/alerts?up=1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["unifiedpush"]["version"], 1);
}

#[tokio::test]
async fn test_topic_get_without_up_is_not_found() {
    let app = test_app().await;
    let response = app.oneshot(get("/alerts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Publish
// =============================================================================

#[tokio::test]
async fn test_publish_plain() {
    let app = test_app().await;
    let response = app.oneshot(post("/alerts", "hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["event"], "message");
    assert_eq!(json["topic"], "alerts");
    assert_eq!(json["message"], "hello");
    assert_eq!(json["id"].as_str().unwrap().len(), 12);
}

#[tokio::test]
async fn test_publish_with_headers() {
    let app = test_app().await;
    let request = Request::builder()
        .method("PUT")
        .uri("/alerts")
        .header("X-Title", "t")
        .header("X-Priority", "5")
        .header("X-Tags", "warning,skull")
        .body(Body::from("boom"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["title"], "t");
    assert_eq!(json["priority"], 5);
    assert_eq!(json["tags"], serde_json::json!(["warning", "skull"]));
}

#[tokio::test]
async fn test_publish_json_form() {
    let app = test_app().await;
    let response = app
        .oneshot(post("/", r#"{"topic":"alerts","message":"from json"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["topic"], "alerts");
    assert_eq!(json["message"], "from json");
}

#[tokio::test]
async fn test_publish_get_shorthand() {
    let app = test_app().await;
    let response = app
        .oneshot(get("/alerts/trigger?message=ping&priority=high"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["message"], "ping");
    assert_eq!(json["priority"], 4);
}

#[tokio::test]
async fn test_publish_invalid_topic() {
    let app = test_app().await;
    let response = app.oneshot(post("/has%20space", "x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], 40001);
    assert_eq!(json["http"], 400);
}

#[tokio::test]
async fn test_publish_disallowed_topic() {
    let app = test_app().await;
    let response = app.oneshot(post("/docs", "x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], 40002);
}

#[tokio::test]
async fn test_publish_rate_limited() {
    let app = app_with(|c| c.limits.message_burst = 1).await;
    let response = app.clone().oneshot(post("/alerts", "1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.oneshot(post("/alerts", "2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let json = body_json(response).await;
    assert_eq!(json["code"], 42901);
    assert!(json["link"].is_string());
}

#[tokio::test]
async fn test_forbidden_with_deny_authorizer() {
    struct DenyAll;
    impl crate::Authorizer for DenyAll {
        fn authorize(&self, _u: Option<&str>, _t: &str, _p: Permission) -> bool {
            false
        }
    }
    let server = Arc::new(
        Server::new(Config::default())
            .await
            .unwrap()
            .with_authorizer(Arc::new(DenyAll)),
    );
    let app = build_router(server);
    let response = app.clone().oneshot(post("/alerts", "x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = app.oneshot(get("/alerts/auth")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_auth_header_without_authenticator() {
    let app = test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/alerts")
        .header("Authorization", "Basic dXNlcjpwYXNz")
        .body(Body::from("x"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Subscribe (poll mode)
// =============================================================================

#[tokio::test]
async fn test_live_subscribe_open_then_message() {
    use futures_util::StreamExt;
    use std::time::Duration;

    let server = Arc::new(Server::new(Config::default()).await.unwrap());
    let app = build_router(Arc::clone(&server));

    let response = app.clone().oneshot(get("/alerts/json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut stream = response.into_body().into_data_stream();

    // First line is the open event
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("open event")
        .unwrap()
        .unwrap();
    let open: serde_json::Value = serde_json::from_slice(&first).unwrap();
    assert_eq!(open["event"], "open");
    assert_eq!(open["topic"], "alerts");

    // A publish on the same server reaches the live stream
    let response = app.oneshot(post("/alerts", "hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("live message")
        .unwrap()
        .unwrap();
    let message: serde_json::Value = serde_json::from_slice(&second).unwrap();
    assert_eq!(message["event"], "message");
    assert_eq!(message["message"], "hello");
    assert_eq!(message["topic"], "alerts");
}

#[tokio::test]
async fn test_poll_json_returns_backfill_in_order() {
    let app = test_app().await;
    app.clone().oneshot(post("/alerts", "first")).await.unwrap();
    app.clone().oneshot(post("/alerts", "second")).await.unwrap();
    app.clone().oneshot(post("/other", "elsewhere")).await.unwrap();

    let response = app.oneshot(get("/alerts/json?poll=1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("application/x-ndjson")
    );
    let body = body_string(response).await;
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(first["message"], "first");
    assert_eq!(second["message"], "second");
}

#[tokio::test]
async fn test_poll_multi_topic() {
    let app = test_app().await;
    app.clone().oneshot(post("/a", "in a")).await.unwrap();
    app.clone().oneshot(post("/b", "in b")).await.unwrap();
    let response = app.oneshot(get("/a,b/json?poll=1")).await.unwrap();
    let body = body_string(response).await;
    assert_eq!(body.lines().count(), 2);
}

#[tokio::test]
async fn test_poll_with_filter() {
    let app = test_app().await;
    app.clone().oneshot(post("/alerts", "keep")).await.unwrap();
    app.clone().oneshot(post("/alerts", "drop")).await.unwrap();
    let response = app
        .oneshot(get("/alerts/json?poll=1&message=keep"))
        .await
        .unwrap();
    let body = body_string(response).await;
    assert_eq!(body.lines().count(), 1);
    assert!(body.contains("keep"));
}

#[tokio::test]
async fn test_poll_sse_encoding() {
    let app = test_app().await;
    app.clone().oneshot(post("/alerts", "hello")).await.unwrap();
    let response = app.oneshot(get("/alerts/sse?poll=1")).await.unwrap();
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let body = body_string(response).await;
    assert!(body.starts_with("data: "));
    assert!(body.contains("\"message\":\"hello\""));
}

#[tokio::test]
async fn test_poll_raw_encoding() {
    let app = test_app().await;
    app.clone().oneshot(post("/alerts", "line one")).await.unwrap();
    let response = app.oneshot(get("/alerts/raw?poll=1")).await.unwrap();
    let body = body_string(response).await;
    assert_eq!(body, "line one\n");
}

#[tokio::test]
async fn test_subscribe_invalid_since() {
    let app = test_app().await;
    let response = app.oneshot(get("/alerts/json?poll=1&since=banana")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_subscription_limit() {
    let app = app_with(|c| c.limits.subscription_limit = 0).await;
    let response = app.oneshot(get("/alerts/json?poll=1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let json = body_json(response).await;
    assert_eq!(json["code"], 42902);
}

#[tokio::test]
async fn test_ws_without_upgrade_is_rejected() {
    let app = test_app().await;
    let response = app.oneshot(get("/alerts/ws")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], 40016);
}

#[tokio::test]
async fn test_topic_auth_success() {
    let app = test_app().await;
    let response = app.oneshot(get("/alerts/auth")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
}

// =============================================================================
// Matrix
// =============================================================================

#[tokio::test]
async fn test_matrix_publish() {
    let app = app_with(|c| c.server.base_url = "https://push.example.com".to_string()).await;
    let notification = serde_json::json!({
        "notification": {
            "devices": [{"pushkey": "https://push.example.com/upAbc123?up=1"}]
        }
    });
    let response = app
        .clone()
        .oneshot(post("/_matrix/push/v1/notify", &notification.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["rejected"], serde_json::json!([]));

    // The notification is now retrievable on the pushkey topic
    let response = app.oneshot(get("/upAbc123/json?poll=1")).await.unwrap();
    let body = body_string(response).await;
    assert_eq!(body.lines().count(), 1);
}

#[tokio::test]
async fn test_matrix_foreign_pushkey_rejected() {
    let app = app_with(|c| c.server.base_url = "https://push.example.com".to_string()).await;
    let notification = serde_json::json!({
        "notification": {
            "devices": [{"pushkey": "https://other.example.com/topic?up=1"}]
        }
    });
    let response = app
        .oneshot(post("/_matrix/push/v1/notify", &notification.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(
        json["rejected"],
        serde_json::json!(["https://other.example.com/topic?up=1"])
    );
}

#[tokio::test]
async fn test_matrix_discovery() {
    let app = app_with(|c| c.server.base_url = "https://push.example.com".to_string()).await;
    let response = app.oneshot(get("/_matrix/push/v1/notify")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["unifiedpush"]["gateway"], "matrix");
}

// =============================================================================
// Files
// =============================================================================

#[tokio::test]
async fn test_file_not_found_without_attachments() {
    let app = test_app().await;
    let response = app.oneshot(get("/file/abcDEF123456.txt")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_attachment_roundtrip_over_http() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_str().unwrap().to_string();
    let app = app_with(move |c| {
        c.server.base_url = "https://push.example.com".to_string();
        c.server.message_limit = 8;
        c.attachments.cache_dir = dir;
    })
    .await;

    let response = app
        .clone()
        .oneshot(post("/alerts", "a body too long to stay inline"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let id = json["id"].as_str().unwrap().to_string();
    assert_eq!(json["attachment"]["name"], "attachment.txt");

    let response = app.oneshot(get(&format!("/file/{id}.txt"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    let body = body_string(response).await;
    assert_eq!(body, "a body too long to stay inline");
}

#[tokio::test]
async fn test_cors_preflight_always_allowed() {
    let app = test_app().await;
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/alerts")
        .header("origin", "https://web.example.com")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("access-control-allow-methods"));
    assert!(response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let app = test_app().await;
    let response = app.oneshot(get("/alerts/teleport")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
