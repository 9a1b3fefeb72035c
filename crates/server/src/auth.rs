//! Authentication and authorization hooks
//!
//! Credential management is not the broker's business; it only binds an
//! incoming request to a visitor and asks pluggable hooks whether that
//! identity may read or write a topic. The default deployment runs with
//! [`AllowAll`].

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use base64::Engine;

use crate::error::{Result, ServerError};

/// What a caller wants to do with a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Subscribe, poll, download attachments
    Read,
    /// Publish
    Write,
}

/// Topic permission hook
pub trait Authorizer: Send + Sync {
    /// Whether `user` (None for anonymous) may access `topic`
    fn authorize(&self, user: Option<&str>, topic: &str, permission: Permission) -> bool;
}

/// The default policy: everything is allowed
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _user: Option<&str>, _topic: &str, _permission: Permission) -> bool {
        true
    }
}

/// Credential verification hook. Implementations check Basic or Bearer
/// values and return the user id.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify an `Authorization` header value; `Err` means the credentials
    /// were rejected
    async fn authenticate(&self, authorization: &str) -> std::result::Result<String, ()>;
}

/// Read the raw `Authorization` value from the header, or from the
/// `?auth=...` query parameter used by WebSocket clients that cannot set
/// headers. The query form is base64 of the full header value.
pub fn read_auth_value(headers: &HeaderMap, query_auth: Option<&str>) -> Result<String> {
    if let Some(encoded) = query_auth
        && !encoded.is_empty()
    {
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|_| ServerError::Unauthorized)?;
        let value = String::from_utf8(decoded).map_err(|_| ServerError::Unauthorized)?;
        return Ok(value.trim().to_string());
    }
    Ok(headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_string())
}

/// Resolve the visitor address, honoring `X-Forwarded-For` when the server
/// sits behind a proxy
pub fn extract_ip<B>(req: &Request<B>, behind_proxy: bool) -> IpAddr {
    if behind_proxy
        && let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next_back()
        && let Ok(ip) = first.trim().parse()
    {
        return ip;
    }
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return connect_info.0.ip();
    }
    IpAddr::from([127, 0, 0, 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.authorize(None, "alerts", Permission::Read));
        assert!(AllowAll.authorize(Some("u_1"), "alerts", Permission::Write));
    }

    #[test]
    fn test_read_auth_value_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        assert_eq!(read_auth_value(&headers, None).unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_read_auth_value_query_overrides() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic ignored".parse().unwrap());
        // base64url("Basic dXNlcjpwYXNz")
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("Basic dXNlcjpwYXNz");
        assert_eq!(
            read_auth_value(&headers, Some(&encoded)).unwrap(),
            "Basic dXNlcjpwYXNz"
        );
    }

    #[test]
    fn test_read_auth_value_bad_base64() {
        let headers = HeaderMap::new();
        assert!(read_auth_value(&headers, Some("%%%")).is_err());
    }

    #[test]
    fn test_extract_ip_prefers_forwarded_when_proxied() {
        let req = Request::builder()
            .header("x-forwarded-for", "9.9.9.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_ip(&req, true), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(extract_ip(&req, false), "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
