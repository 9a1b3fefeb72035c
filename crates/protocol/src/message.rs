//! The message model
//!
//! A [`Message`] is immutable once published. The JSON shape is shared by
//! all transports and by the message cache; internal routing fields
//! (`sender`, `user`, `poll_id`) are never serialized to subscribers.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::LazyLock;

use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;

use crate::action::Action;

/// Length of a message id (URL-safe, alphanumeric)
pub const MESSAGE_ID_LENGTH: usize = 12;

/// Body used when a publish request carries no message at all
pub const EMPTY_MESSAGE_BODY: &str = "triggered";

/// Generic body used for poll-request events
pub const POLL_REQUEST_BODY: &str = "New message";

/// Encoding marker for base64-encoded binary bodies
pub const ENCODING_BASE64: &str = "base64";

/// Default body when a message only carries an attachment
pub fn default_attachment_body(name: &str) -> String {
    format!("You received a file: {name}")
}

// Topic ids must stay in sync with the subscribe path routing.
static TOPIC_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[-_A-Za-z0-9]{1,64}$").expect("valid regex"));

/// Check whether a string is a valid topic id (1-64 chars, `[-_A-Za-z0-9]`)
pub fn valid_topic_id(id: &str) -> bool {
    TOPIC_ID_REGEX.is_match(id)
}

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a fresh random message id
pub fn random_id() -> String {
    let mut rng = rand::rng();
    (0..MESSAGE_ID_LENGTH)
        .map(|_| ID_CHARSET[rng.random_range(0..ID_CHARSET.len())] as char)
        .collect()
}

/// Check whether a string looks like a message id
pub fn valid_message_id(id: &str) -> bool {
    id.len() == MESSAGE_ID_LENGTH && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Event kind of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Sent once when a subscription is established
    Open,
    /// Periodic no-op to keep the connection alive
    Keepalive,
    /// A regular message
    Message,
    /// Instructs clients to poll an upstream server for the real message
    PollRequest,
}

impl Event {
    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Keepalive => "keepalive",
            Self::Message => "message",
            Self::PollRequest => "poll_request",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attachment record carried by a message
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Attachment {
    /// File name shown to the client
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Detected content type
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub content_type: String,

    /// Size in bytes (zero for external URLs)
    #[serde(skip_serializing_if = "is_zero")]
    pub size: i64,

    /// Unix seconds after which the file may be deleted (zero for external URLs)
    #[serde(skip_serializing_if = "is_zero")]
    pub expires: i64,

    /// Download URL
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Visitor id of the uploader, for bandwidth accounting
    #[serde(skip)]
    pub owner: String,
}

/// A single published message, immutable once it left the publish pipeline
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Opaque 12-char identifier
    pub id: String,

    /// Unix seconds when the message becomes eligible for delivery
    pub time: i64,

    /// Unix seconds after which the message may be pruned
    #[serde(skip_serializing_if = "is_zero")]
    pub expires: i64,

    /// Event kind
    pub event: Event,

    /// Topic id
    pub topic: String,

    /// Priority 1-5; zero (omitted) for non-message events
    #[serde(skip_serializing_if = "is_zero_u8")]
    pub priority: u8,

    /// Emoji tags
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// URL opened when the notification is clicked
    #[serde(skip_serializing_if = "String::is_empty")]
    pub click: String,

    /// Icon URL
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icon: String,

    /// Action buttons
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,

    /// Attached file, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,

    /// Message title
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,

    /// Message body
    pub message: String,

    /// `base64` if the body is binary, empty otherwise
    #[serde(skip_serializing_if = "String::is_empty")]
    pub encoding: String,

    /// Source IP of the publisher
    #[serde(skip)]
    pub sender: IpAddr,

    /// Owning user id, if the publisher was authenticated
    #[serde(skip)]
    pub user: Option<String>,

    /// Poll id for poll-request events
    #[serde(skip)]
    pub poll_id: String,
}

impl Message {
    /// A new empty `message` event for a topic, timestamped now
    pub fn new(topic: &str) -> Self {
        Self::with_event(topic, Event::Message)
    }

    /// The `open` event sent when a subscription starts
    pub fn open(topics: &str) -> Self {
        Self::with_event(topics, Event::Open)
    }

    /// The periodic `keepalive` event
    pub fn keepalive(topics: &str) -> Self {
        Self::with_event(topics, Event::Keepalive)
    }

    /// A `poll_request` event instructing clients to fetch the real message
    pub fn poll_request(topic: &str, poll_id: &str) -> Self {
        let mut m = Self::with_event(topic, Event::PollRequest);
        m.message = POLL_REQUEST_BODY.to_string();
        m.poll_id = poll_id.to_string();
        m
    }

    fn with_event(topic: &str, event: Event) -> Self {
        Self {
            id: random_id(),
            time: Utc::now().timestamp(),
            expires: 0,
            event,
            topic: topic.to_string(),
            priority: 0,
            tags: Vec::new(),
            click: String::new(),
            icon: String::new(),
            actions: Vec::new(),
            attachment: None,
            title: String::new(),
            message: String::new(),
            encoding: String::new(),
            sender: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            user: None,
            poll_id: String::new(),
        }
    }

    /// Whether the message is scheduled for future delivery
    pub fn is_delayed(&self) -> bool {
        self.time > Utc::now().timestamp()
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

fn is_zero_u8(n: &u8) -> bool {
    *n == 0
}
