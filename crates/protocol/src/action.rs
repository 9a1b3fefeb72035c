//! Action buttons
//!
//! Messages can carry up to three action buttons. Publishers supply them
//! either as a JSON array or in a compact single-line format:
//!
//! ```text
//! view, Open portal, https://home.example.com; http, Close door, https://api.example.com/door, method=PUT, body=lock
//! ```
//!
//! Values may be quoted with single or double quotes so labels can contain
//! commas. Keyed parameters (`method=`, `body=`, `clear=`, `intent=`,
//! `headers.X=`, `extras.X=`) follow the positional ones.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::message::random_id;

/// Maximum number of action buttons per message
pub const MAX_ACTIONS: usize = 3;

/// Kind of an action button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Open a URL or app link
    View,
    /// Send an Android broadcast intent
    Broadcast,
    /// Perform an HTTP request
    Http,
}

impl ActionKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "view" => Some(Self::View),
            "broadcast" => Some(Self::Broadcast),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

/// A single action button
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Opaque id, generated server-side
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Action kind
    pub action: ActionKind,

    /// Button label
    pub label: String,

    /// Whether the notification is cleared after the action runs
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear: bool,

    /// Target URL (view, http)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// HTTP method (http only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    /// HTTP headers (http only)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// HTTP body (http only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,

    /// Broadcast intent (broadcast only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub intent: String,

    /// Broadcast extras (broadcast only)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, String>,
}

/// Parse an actions header value, JSON array or compact format.
pub fn parse_actions(value: &str) -> Result<Vec<Action>, ParseError> {
    let value = value.trim();
    let mut actions = if value.starts_with('[') {
        serde_json::from_str::<Vec<Action>>(value)
            .map_err(|e| ParseError::InvalidActions(e.to_string()))?
    } else {
        parse_compact(value)?
    };
    if actions.len() > MAX_ACTIONS {
        return Err(ParseError::InvalidActions(format!(
            "only {MAX_ACTIONS} actions allowed"
        )));
    }
    for action in &mut actions {
        if action.id.is_empty() {
            action.id = random_id();
        }
        validate(action)?;
    }
    Ok(actions)
}

fn validate(action: &Action) -> Result<(), ParseError> {
    if action.label.is_empty() {
        return Err(ParseError::InvalidActions("label is required".to_string()));
    }
    let needs_url = matches!(action.action, ActionKind::View | ActionKind::Http);
    if needs_url && action.url.is_empty() {
        return Err(ParseError::InvalidActions(
            "parameter 'url' is required for view and http actions".to_string(),
        ));
    }
    Ok(())
}

fn parse_compact(value: &str) -> Result<Vec<Action>, ParseError> {
    split_quoted(value, ';')
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_compact_action(&s))
        .collect()
}

fn parse_compact_action(value: &str) -> Result<Action, ParseError> {
    let fields = split_quoted(value, ',');
    let mut positional: Vec<String> = Vec::new();
    let mut keyed: Vec<(String, String)> = Vec::new();
    for field in fields {
        let field = unquote(field.trim());
        if field.is_empty() {
            continue;
        }
        // The first three fields are positional (action, label, url); a
        // URL containing '=' must not be mistaken for a parameter
        match field.split_once('=') {
            Some((key, val)) if is_known_key(key.trim()) => {
                keyed.push((key.trim().to_string(), unquote(val.trim())));
            }
            Some((key, _)) if positional.len() >= 3 => {
                return Err(ParseError::InvalidActions(format!(
                    "unknown parameter '{}'",
                    key.trim()
                )));
            }
            _ => positional.push(field),
        }
    }
    if positional.len() < 2 {
        return Err(ParseError::InvalidActions(
            "action and label are required".to_string(),
        ));
    }
    let kind = ActionKind::parse(&positional[0])
        .ok_or_else(|| ParseError::InvalidActions(format!("unknown action '{}'", positional[0])))?;
    let mut action = Action {
        id: String::new(),
        action: kind,
        label: positional[1].clone(),
        clear: false,
        url: positional.get(2).cloned().unwrap_or_default(),
        method: String::new(),
        headers: HashMap::new(),
        body: String::new(),
        intent: String::new(),
        extras: HashMap::new(),
    };
    for (key, val) in keyed {
        // Keys match case-insensitively; header and extra names keep the
        // case the publisher wrote
        match key.to_lowercase().as_str() {
            "url" => action.url = val,
            "method" => action.method = val,
            "body" => action.body = val,
            "intent" => action.intent = val,
            "clear" => {
                action.clear = match val.to_lowercase().as_str() {
                    "1" | "true" | "yes" => true,
                    "0" | "false" | "no" => false,
                    other => {
                        return Err(ParseError::InvalidActions(format!(
                            "invalid clear value '{other}'"
                        )));
                    }
                }
            }
            k if k.starts_with("headers.") => {
                action.headers.insert(key["headers.".len()..].to_string(), val);
            }
            _ => {
                action.extras.insert(key["extras.".len()..].to_string(), val);
            }
        }
    }
    if kind == ActionKind::Http && action.method.is_empty() {
        action.method = "POST".to_string();
    }
    Ok(action)
}

fn is_known_key(key: &str) -> bool {
    let key = key.to_lowercase();
    matches!(key.as_str(), "url" | "method" | "body" | "intent" | "clear")
        || key.starts_with("headers.")
        || key.starts_with("extras.")
}

/// Split on a separator, ignoring separators inside single or double quotes.
fn split_quoted(value: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in value.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == sep => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);
    parts
}

fn unquote(value: &str) -> String {
    let v = value.trim();
    for q in ['\'', '"'] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return v[1..v.len() - 1].to_string();
        }
    }
    v.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_view_action() {
        let actions = parse_actions("view, Open portal, https://home.example.com").unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, ActionKind::View);
        assert_eq!(actions[0].label, "Open portal");
        assert_eq!(actions[0].url, "https://home.example.com");
        assert!(!actions[0].id.is_empty());
    }

    #[test]
    fn test_parse_multiple_actions_with_params() {
        let actions = parse_actions(
            "view, Open, https://x.example.com, clear=true; \
             http, Close door, https://api.example.com/door, method=PUT, body=lock, headers.Authorization=Bearer t",
        )
        .unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions[0].clear);
        assert_eq!(actions[1].action, ActionKind::Http);
        assert_eq!(actions[1].method, "PUT");
        assert_eq!(actions[1].body, "lock");
        assert_eq!(actions[1].headers["Authorization"], "Bearer t");
    }

    #[test]
    fn test_parse_quoted_label_with_comma() {
        let actions = parse_actions(r#"view, "Yes, open it", https://x.example.com"#).unwrap();
        assert_eq!(actions[0].label, "Yes, open it");
    }

    #[test]
    fn test_http_default_method() {
        let actions = parse_actions("http, Trigger, https://api.example.com/hook").unwrap();
        assert_eq!(actions[0].method, "POST");
    }

    #[test]
    fn test_broadcast_with_extras() {
        let actions =
            parse_actions("broadcast, Take picture, extras.cmd=pic, intent=io.heckel.CUSTOM")
                .unwrap();
        assert_eq!(actions[0].action, ActionKind::Broadcast);
        assert_eq!(actions[0].extras["cmd"], "pic");
        assert_eq!(actions[0].intent, "io.heckel.CUSTOM");
    }

    #[test]
    fn test_parse_json_actions() {
        let actions = parse_actions(
            r#"[{"action":"view","label":"Open","url":"https://x.example.com","clear":true}]"#,
        )
        .unwrap();
        assert_eq!(actions[0].action, ActionKind::View);
        assert!(actions[0].clear);
    }

    #[test]
    fn test_reject_too_many_actions() {
        let err = parse_actions(
            "view,a,https://x/1; view,b,https://x/2; view,c,https://x/3; view,d,https://x/4",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_reject_view_without_url() {
        assert!(parse_actions("view, Open").is_err());
    }

    #[test]
    fn test_reject_unknown_kind_and_param() {
        assert!(parse_actions("teleport, Go, https://x.example.com").is_err());
        assert!(parse_actions("view, Go, https://x.example.com, warp=1").is_err());
    }

    #[test]
    fn test_reject_invalid_json() {
        assert!(parse_actions("[{\"action\":").is_err());
    }
}
