//! Server error types
//!
//! Every error carries an HTTP status and a stable numeric code so clients
//! can match on behavior without parsing messages. Responses are JSON:
//!
//! ```json
//! {"code":42901,"http":429,"error":"rate limit reached: too many messages"}
//! ```

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheError;
use crate::file_cache::FileCacheError;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server errors, each mapped to an HTTP status and a stable code
#[derive(Debug, Error)]
pub enum ServerError {
    /// Topic id does not match the topic regex
    #[error("invalid topic: path is not a valid topic id")]
    TopicInvalid,

    /// Topic id is reserved by configuration
    #[error("topic is disallowed")]
    TopicDisallowed,

    /// Priority is not 1-5
    #[error("invalid priority: {0}")]
    PriorityInvalid(String),

    /// Delay cannot be parsed
    #[error("invalid delay: {0}")]
    DelayInvalid(String),

    /// Delay requires the message to be cached
    #[error("delayed messages cannot be disabled from the cache")]
    DelayNoCache,

    /// Delay cannot be combined with an e-mail copy
    #[error("delayed messages cannot be sent via e-mail")]
    DelayNoEmail,

    /// Actions cannot be parsed
    #[error("invalid actions: {0}")]
    ActionsInvalid(String),

    /// Attach or icon URL is not http(s)
    #[error("invalid URL: must start with http:// or https://")]
    UrlInvalid,

    /// Since marker cannot be parsed
    #[error("invalid since value: {0}")]
    SinceInvalid(String),

    /// Filter parameters cannot be parsed
    #[error("invalid filter: {0}")]
    FilterInvalid(String),

    /// Message body is not UTF-8 where text is required
    #[error("message body must be valid UTF-8")]
    MessageNotUtf8,

    /// Request body is not the expected JSON shape
    #[error("invalid request body: {0}")]
    BodyInvalid(String),

    /// E-mail copies requested but no mailer is configured
    #[error("e-mail notifications are not enabled")]
    EmailDisabled,

    /// Attachments requested but the file cache is not configured
    #[error("attachments are not enabled")]
    AttachmentsDisallowed,

    /// Attachment would expire before its delayed delivery
    #[error("attachment expires before the message would be delivered")]
    AttachmentExpiryBeforeDelivery,

    /// WebSocket route hit without an upgrade header
    #[error("websocket upgrade expected")]
    WebSocketUpgradeExpected,

    /// Attachment exceeds a size or quota limit
    #[error("attachment too large or attachment quota reached")]
    AttachmentTooLarge,

    /// Authentication failed or is required
    #[error("unauthorized")]
    Unauthorized,

    /// Authorization denied
    #[error("forbidden")]
    Forbidden,

    /// Message or file does not exist
    #[error("not found")]
    NotFound,

    /// Message bucket exhausted
    #[error("rate limit reached: too many messages")]
    TooManyMessages,

    /// Subscription limit reached
    #[error("rate limit reached: too many active subscriptions")]
    TooManySubscriptions,

    /// E-mail bucket exhausted
    #[error("rate limit reached: too many e-mails")]
    TooManyEmails,

    /// Auth-failure bucket exhausted
    #[error("rate limit reached: too many authentication failures")]
    TooManyAuthFailures,

    /// Bandwidth bucket exhausted
    #[error("rate limit reached: attachment bandwidth exhausted")]
    TooMuchBandwidth,

    /// Server-wide topic limit reached
    #[error("rate limit reached: too many topics")]
    TooManyTopics,

    /// Anything unexpected
    #[error("internal server error")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ServerError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TopicInvalid
            | Self::TopicDisallowed
            | Self::PriorityInvalid(_)
            | Self::DelayInvalid(_)
            | Self::DelayNoCache
            | Self::DelayNoEmail
            | Self::ActionsInvalid(_)
            | Self::UrlInvalid
            | Self::SinceInvalid(_)
            | Self::FilterInvalid(_)
            | Self::MessageNotUtf8
            | Self::BodyInvalid(_)
            | Self::EmailDisabled
            | Self::AttachmentsDisallowed
            | Self::AttachmentExpiryBeforeDelivery
            | Self::WebSocketUpgradeExpected => StatusCode::BAD_REQUEST,
            Self::AttachmentTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::TooManyMessages
            | Self::TooManySubscriptions
            | Self::TooManyEmails
            | Self::TooManyAuthFailures
            | Self::TooMuchBandwidth
            | Self::TooManyTopics => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable numeric code for this error
    pub fn code(&self) -> u32 {
        match self {
            Self::TopicInvalid => 40001,
            Self::TopicDisallowed => 40002,
            Self::PriorityInvalid(_) => 40003,
            Self::DelayInvalid(_) => 40004,
            Self::DelayNoCache => 40005,
            Self::DelayNoEmail => 40006,
            Self::ActionsInvalid(_) => 40007,
            Self::UrlInvalid => 40008,
            Self::SinceInvalid(_) => 40009,
            Self::FilterInvalid(_) => 40010,
            Self::MessageNotUtf8 => 40011,
            Self::BodyInvalid(_) => 40012,
            Self::EmailDisabled => 40013,
            Self::AttachmentsDisallowed => 40014,
            Self::AttachmentExpiryBeforeDelivery => 40015,
            Self::WebSocketUpgradeExpected => 40016,
            Self::AttachmentTooLarge => 41301,
            Self::Unauthorized => 40101,
            Self::Forbidden => 40301,
            Self::NotFound => 40401,
            Self::TooManyMessages => 42901,
            Self::TooManySubscriptions => 42902,
            Self::TooManyEmails => 42903,
            Self::TooManyAuthFailures => 42904,
            Self::TooMuchBandwidth => 42905,
            Self::TooManyTopics => 42906,
            Self::Internal(_) => 50001,
        }
    }

    /// Docs link shown to clients, where one exists
    pub fn link(&self) -> Option<&'static str> {
        match self {
            Self::TooManyMessages
            | Self::TooManySubscriptions
            | Self::TooManyEmails
            | Self::TooManyAuthFailures
            | Self::TooMuchBandwidth
            | Self::TooManyTopics => Some("https://docs.herald.sh/limits"),
            Self::AttachmentTooLarge => Some("https://docs.herald.sh/attachments"),
            _ => None,
        }
    }

    /// Wrap an unexpected error
    pub fn internal<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Internal(Box::new(err))
    }
}

impl From<CacheError> for ServerError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound => Self::NotFound,
            other => Self::internal(other),
        }
    }
}

impl From<FileCacheError> for ServerError {
    fn from(err: FileCacheError) -> Self {
        match err {
            FileCacheError::LimitReached => Self::AttachmentTooLarge,
            FileCacheError::NotFound => Self::NotFound,
            other => Self::internal(other),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Stable numeric code (machine-readable)
    pub code: u32,
    /// HTTP status
    pub http: u16,
    /// Error message (human-readable)
    pub error: String,
    /// Docs link, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<&'static str>,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            http: status.as_u16(),
            error: self.to_string(),
            link: self.link(),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::warn!(code = body.code, error = %body.error, "request failed");
        } else {
            tracing::debug!(code = body.code, status = %status, error = %body.error, "request rejected");
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_taxonomy() {
        assert_eq!(ServerError::TopicInvalid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ServerError::EmailDisabled.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ServerError::AttachmentTooLarge.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ServerError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ServerError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ServerError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ServerError::TooManyMessages.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_codes_are_unique() {
        let errors = [
            ServerError::TopicInvalid,
            ServerError::TopicDisallowed,
            ServerError::DelayNoCache,
            ServerError::DelayNoEmail,
            ServerError::UrlInvalid,
            ServerError::MessageNotUtf8,
            ServerError::EmailDisabled,
            ServerError::AttachmentsDisallowed,
            ServerError::AttachmentExpiryBeforeDelivery,
            ServerError::AttachmentTooLarge,
            ServerError::Unauthorized,
            ServerError::Forbidden,
            ServerError::NotFound,
            ServerError::TooManyMessages,
            ServerError::TooManySubscriptions,
            ServerError::TooManyEmails,
            ServerError::TooManyAuthFailures,
            ServerError::TooMuchBandwidth,
            ServerError::TooManyTopics,
        ];
        let mut codes: Vec<u32> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_cache_not_found_maps_to_404() {
        let err: ServerError = CacheError::NotFound.into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
