//! Request parameter helpers, body peeking and content sniffing

use std::collections::HashMap;

use axum::body::Body;
use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::StreamExt;

use crate::error::{Result, ServerError};

/// Unified access to publish/subscribe options.
///
/// Every option can be supplied as a header (`X-Title: t`) or as a
/// lowercase query parameter (`?title=t`); headers win. Aliases are checked
/// in order.
pub struct Params<'a> {
    headers: &'a HeaderMap,
    query: &'a HashMap<String, String>,
}

impl<'a> Params<'a> {
    /// Wrap headers and parsed query parameters
    pub fn new(headers: &'a HeaderMap, query: &'a HashMap<String, String>) -> Self {
        Self { headers, query }
    }

    /// First non-empty value among the aliases, headers before query
    pub fn get(&self, aliases: &[&str]) -> String {
        for alias in aliases {
            if let Some(value) = self.headers.get(*alias)
                && let Ok(value) = value.to_str()
                && !value.trim().is_empty()
            {
                return value.trim().to_string();
            }
        }
        for alias in aliases {
            if let Some(value) = self.query.get(*alias)
                && !value.trim().is_empty()
            {
                return value.trim().to_string();
            }
        }
        String::new()
    }

    /// Boolean option: `1`, `yes`, `true` are true; `0`, `no`, `false` are
    /// false; anything else (including absence) yields the default
    pub fn get_bool(&self, default: bool, aliases: &[&str]) -> bool {
        match self.get(aliases).to_lowercase().as_str() {
            "1" | "yes" | "true" => true,
            "0" | "no" | "false" => false,
            _ => default,
        }
    }
}

/// Split a string, dropping empty segments
pub fn split_no_empty(s: &str, sep: char) -> Vec<String> {
    s.split(sep)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// A request body peeked up to a limit
pub struct PeekedBody {
    /// The first bytes of the body, at most the peek limit
    pub peeked: Vec<u8>,
    /// Whether the body continues beyond the peeked bytes
    pub limit_reached: bool,
    /// Bytes of the current chunk beyond the limit
    pub leftover: Bytes,
    /// The unread remainder of the body
    pub rest: axum::body::BodyDataStream,
}

/// Read up to `limit` bytes from the body without consuming the rest.
///
/// The peeked bytes drive body classification; if the body turns out to be
/// an attachment, `leftover` and `rest` are streamed to disk after them.
pub async fn peek_body(body: Body, limit: usize) -> Result<PeekedBody> {
    let mut stream = body.into_data_stream();
    let mut peeked: Vec<u8> = Vec::new();
    let mut leftover = Bytes::new();
    let mut limit_reached = false;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ServerError::internal)?;
        if peeked.len() + chunk.len() > limit {
            let take = limit - peeked.len();
            peeked.extend_from_slice(&chunk[..take]);
            leftover = chunk.slice(take..);
            limit_reached = true;
            break;
        }
        peeked.extend_from_slice(&chunk);
    }
    Ok(PeekedBody {
        peeked,
        limit_reached,
        leftover,
        rest: stream,
    })
}

/// Read an entire body, failing if it exceeds `limit` bytes
pub async fn read_body_limited(body: Body, limit: usize) -> Result<Vec<u8>> {
    let peeked = peek_body(body, limit).await?;
    if peeked.limit_reached {
        return Err(ServerError::BodyInvalid(format!(
            "body larger than {limit} bytes"
        )));
    }
    Ok(peeked.peeked)
}

/// Sniff a content type from the first bytes of a blob, refining the file
/// extension from a filename hint when one is available.
///
/// Returns `(content_type, extension)`; the extension includes the dot or
/// is empty.
pub fn detect_content_type(head: &[u8], filename: &str) -> (String, String) {
    let sniffed: Option<(&str, &str)> = if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(("image/png", ".png"))
    } else if head.starts_with(b"\xff\xd8\xff") {
        Some(("image/jpeg", ".jpg"))
    } else if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        Some(("image/gif", ".gif"))
    } else if head.starts_with(b"%PDF-") {
        Some(("application/pdf", ".pdf"))
    } else if head.starts_with(b"PK\x03\x04") {
        Some(("application/zip", ".zip"))
    } else if head.starts_with(b"\x1f\x8b") {
        Some(("application/gzip", ".gz"))
    } else if head.len() >= 12 && &head[4..12] == b"ftypmp42" {
        Some(("video/mp4", ".mp4"))
    } else {
        None
    };
    if let Some((content_type, ext)) = sniffed {
        return (content_type.to_string(), ext.to_string());
    }
    // Prefer the filename extension for unrecognized magic
    let hint_ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 16 && ext.bytes().all(|b| b.is_ascii_alphanumeric()));
    if std::str::from_utf8(head).is_ok() {
        let ext = hint_ext.map(|e| format!(".{e}")).unwrap_or_else(|| ".txt".to_string());
        ("text/plain; charset=utf-8".to_string(), ext)
    } else {
        let ext = hint_ext.map(|e| format!(".{e}")).unwrap_or_else(|| ".bin".to_string());
        ("application/octet-stream".to_string(), ext)
    }
}

/// Derive an attachment name from an external URL, like the final path
/// segment of `https://example.com/a/x.jpg`
pub fn filename_from_url(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest)?;
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme);
    let name = path.rsplit('/').next().unwrap_or("");
    (!name.is_empty() && name != path).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn params_fixture() -> (HeaderMap, HashMap<String, String>) {
        let mut headers = HeaderMap::new();
        headers.insert("x-title", HeaderValue::from_static("from-header"));
        let mut query = HashMap::new();
        query.insert("title".to_string(), "from-query".to_string());
        query.insert("priority".to_string(), "5".to_string());
        (headers, query)
    }

    #[test]
    fn test_params_header_wins() {
        let (headers, query) = params_fixture();
        let params = Params::new(&headers, &query);
        assert_eq!(params.get(&["x-title", "title", "t"]), "from-header");
        assert_eq!(params.get(&["x-priority", "priority", "p"]), "5");
        assert_eq!(params.get(&["x-click", "click"]), "");
    }

    #[test]
    fn test_params_bool() {
        let mut headers = HeaderMap::new();
        headers.insert("x-cache", HeaderValue::from_static("no"));
        let mut query = HashMap::new();
        query.insert("up".to_string(), "1".to_string());
        let params = Params::new(&headers, &query);
        assert!(!params.get_bool(true, &["x-cache", "cache"]));
        assert!(params.get_bool(false, &["x-unifiedpush", "unifiedpush", "up"]));
        assert!(params.get_bool(true, &["x-firebase", "firebase"]));
        assert!(!params.get_bool(false, &["x-poll", "poll"]));
    }

    #[test]
    fn test_split_no_empty() {
        assert_eq!(split_no_empty("a,b,,c", ','), vec!["a", "b", "c"]);
        assert_eq!(split_no_empty(" , ", ','), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_peek_body_small() {
        let peeked = peek_body(Body::from("hello"), 100).await.unwrap();
        assert_eq!(peeked.peeked, b"hello");
        assert!(!peeked.limit_reached);
        assert!(peeked.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_peek_body_limit_reached() {
        let peeked = peek_body(Body::from("0123456789"), 4).await.unwrap();
        assert_eq!(peeked.peeked, b"0123");
        assert!(peeked.limit_reached);
        assert_eq!(&peeked.leftover[..], b"456789");
    }

    #[test]
    fn test_detect_content_type_magic() {
        let (ct, ext) = detect_content_type(b"\x89PNG\r\n\x1a\nxxxx", "");
        assert_eq!(ct, "image/png");
        assert_eq!(ext, ".png");
        let (ct, ext) = detect_content_type(b"\xff\xd8\xffdddd", "photo");
        assert_eq!(ct, "image/jpeg");
        assert_eq!(ext, ".jpg");
    }

    #[test]
    fn test_detect_content_type_fallbacks() {
        let (ct, ext) = detect_content_type(b"plain old text", "notes.md");
        assert_eq!(ct, "text/plain; charset=utf-8");
        assert_eq!(ext, ".md");
        let (ct, ext) = detect_content_type(&[0x00, 0xff, 0x10], "");
        assert_eq!(ct, "application/octet-stream");
        assert_eq!(ext, ".bin");
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://example.com/files/x.jpg?size=large"),
            Some("x.jpg".to_string())
        );
        assert_eq!(filename_from_url("https://example.com/"), None);
        assert_eq!(filename_from_url("https://example.com"), None);
    }
}
