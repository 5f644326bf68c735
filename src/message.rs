//! Message envelope shared by both directions of the bridge.
//!
//! Content scripts and the global runtime exchange `(name, id, args, tabId)`
//! tuples. A message named [`RESPONSE`] answers an earlier request carrying the
//! same correlation id; every other name is a fresh request.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Synthetic identifier handed out by the identity registries.
pub type TabId = i64;

/// Tab id meaning "no resolvable destination".
pub const NO_TAB: TabId = -1;

/// Name of replies to an earlier correlation id.
pub const RESPONSE: &str = "response";

/// Page-load notification. Gets the page title injected at `args[0]`.
pub const PAGE_LOAD: &str = "Connector_Browser.onPageLoad";

/// Title used when the host cannot tell us the page title.
pub const UNKNOWN_TITLE: &str = "N/A";

/// Sent to every page once the runtime is up.
pub const GLOBAL_AVAILABLE: &str = "globalAvailable";

/// Sent to the active page when the toolbar item is clicked.
pub const BUTTON_CLICK: &str = "buttonClick";

/// Sent to the runtime when a context menu entry is picked.
pub const CONTEXT_MENU_ITEM: &str = "onContextMenuItem";

/// Caller-chosen token pairing a request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Text(String),
    Number(i64),
}

impl CorrelationId {
    /// Fresh id for a message the bridge originates itself.
    pub fn generated(name: &str) -> Self {
        CorrelationId::Text(format!("{}_{}", name, uuid::Uuid::new_v4()))
    }

    /// Read an id from a JSON value. Only strings and integers qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(CorrelationId::Text(s.clone())),
            Value::Number(n) => n.as_i64().map(CorrelationId::Number),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            CorrelationId::Text(s) => Value::String(s.clone()),
            CorrelationId::Number(n) => Value::from(*n),
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Text(s) => f.write_str(s),
            CorrelationId::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId::Text(s.to_string())
    }
}

/// A message as delivered into the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub name: String,
    pub correlation_id: CorrelationId,
    pub args: Value,
    pub tab_id: TabId,
}

/// Where an outbound message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// A registry id. `NO_TAB` or a dead id drops the message.
    Tab(TabId),
    /// Whatever tab is frontmost when the message is dispatched.
    ActiveTab,
}

impl Destination {
    /// Map the runtime's optional tab argument onto a destination.
    pub fn from_tab_arg(tab_id: Option<TabId>) -> Self {
        match tab_id {
            Some(id) => Destination::Tab(id),
            None => Destination::ActiveTab,
        }
    }
}

/// A send issued by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub name: String,
    pub correlation_id: CorrelationId,
    pub args: Value,
    pub destination: Destination,
}

/// Payload handed to a page: `{"args": [args, id]}`.
pub fn page_payload(args: &Value, id: &CorrelationId) -> Value {
    serde_json::json!({ "args": [args, id.to_value()] })
}

/// Payload for bridge-originated page notifications with no arguments.
pub fn empty_payload() -> Value {
    serde_json::json!({ "args": [] })
}

/// Reasons an inbound or outbound message gets dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMessage {
    #[error("missing message name")]
    MissingName,

    #[error("missing or invalid message id")]
    MissingId,

    #[error("unexpected arguments for {name}: {reason}")]
    BadArgs { name: String, reason: String },
}

impl MalformedMessage {
    pub fn bad_args(name: &str, reason: impl Into<String>) -> Self {
        MalformedMessage::BadArgs {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// A message received from a content script, before tab resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub name: String,
    pub correlation_id: CorrelationId,
    pub args: Value,
}

impl InboundMessage {
    /// Parse the host's `userInfo` mapping.
    ///
    /// `message` and `messageId` are required, `args` is optional and becomes
    /// `null` when absent. Page loads must carry an array.
    pub fn from_user_info(user_info: &Value) -> Result<Self, MalformedMessage> {
        let name = user_info
            .get("message")
            .and_then(Value::as_str)
            .ok_or(MalformedMessage::MissingName)?
            .to_string();

        let correlation_id = user_info
            .get("messageId")
            .and_then(CorrelationId::from_value)
            .ok_or(MalformedMessage::MissingId)?;

        let args = user_info.get("args").cloned().unwrap_or(Value::Null);

        if name == PAGE_LOAD && !args.is_array() {
            return Err(MalformedMessage::bad_args(&name, "expected an array"));
        }

        Ok(Self {
            name,
            correlation_id,
            args,
        })
    }
}
