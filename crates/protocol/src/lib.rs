//! Herald Protocol
//!
//! Message model and wire types for the Herald notification broker.
//!
//! # Overview
//!
//! This crate defines the types that travel between publishers, the broker
//! and subscribers: the [`Message`] itself, its [`Event`] kind, attachment
//! and action records, priorities, and the `since` marker used to replay
//! cached messages.
//!
//! Everything here is transport-agnostic. The server crate decides how a
//! message is encoded per transport (ndjson, SSE, raw, WebSocket); this
//! crate only guarantees a stable JSON shape.
//!
//! # Example
//!
//! ```
//! use herald_protocol::{Message, Event};
//!
//! let m = Message::new("alerts");
//! assert_eq!(m.event, Event::Message);
//! assert_eq!(m.id.len(), 12);
//! ```

mod action;
mod error;
mod message;
mod priority;
mod since;

pub use action::{Action, ActionKind, parse_actions};
pub use error::ParseError;
pub use message::{
    Attachment, ENCODING_BASE64, EMPTY_MESSAGE_BODY, Event, MESSAGE_ID_LENGTH, Message,
    POLL_REQUEST_BODY, default_attachment_body, random_id, valid_message_id, valid_topic_id,
};
pub use priority::{DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY, parse_priority};
pub use since::{SinceMarker, parse_future_time, parse_since};
