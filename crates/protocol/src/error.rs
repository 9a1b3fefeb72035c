//! Protocol parse errors

use thiserror::Error;

/// Errors from parsing client-supplied message parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Priority is not 1-5 or a known name
    #[error("invalid priority: {0}")]
    InvalidPriority(String),

    /// Since marker is not `all`, `none`, an id, a timestamp or a duration
    #[error("invalid since value: {0}")]
    InvalidSince(String),

    /// Delay is not a timestamp or a duration
    #[error("invalid delay value: {0}")]
    InvalidDelay(String),

    /// Actions string or JSON is malformed
    #[error("invalid actions: {0}")]
    InvalidActions(String),
}
