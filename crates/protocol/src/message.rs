//! Message envelopes as they appear on the wire.
//!
//! Three envelope shapes travel over a connection:
//!
//! - **Call**: `{id, guid, method, params}` - addressed to one node, expects
//!   exactly one completion matched by `id`.
//! - **Response**: `{id, result}` or `{id, error: {error: {...}}}` - the
//!   completion for a call. Completions for distinct calls may arrive in any
//!   order.
//! - **Event**: `{guid, method, params}` - unsolicited, no completion.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Serde helper for `Arc<str>` serialization.
pub fn serialize_arc_str<S>(arc: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(arc)
}

/// Serde helper for `Arc<str>` deserialization.
pub fn deserialize_arc_str<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    Ok(Arc::from(s.as_str()))
}

/// A call addressed to one node of the dispatch tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Monotonically increasing per connection; completions match on this.
    pub id: u32,
    /// Identifier of the target node.
    #[serde(
        serialize_with = "serialize_arc_str",
        deserialize_with = "deserialize_arc_str"
    )]
    pub guid: Arc<str>,
    /// Method name to invoke on the target node.
    pub method: String,
    /// Schema-free parameters.
    #[serde(default)]
    pub params: Value,
    /// Opaque caller metadata (timing, source location). Not interpreted by
    /// the dispatch tree.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Completion envelope for a [`Call`], carrying either a result or an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Call id this response correlates to.
    pub id: u32,
    /// Success result (mutually exclusive with error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error result (mutually exclusive with result).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorWrapper>,
}

/// Wrapper for the error payload; the wire nests it one level deep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorWrapper {
    pub error: ErrorPayload,
}

/// Structured error details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
    /// Error type name (e.g. "TimeoutError", "TargetClosedError").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Stack trace, if the remote side captured one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Unsolicited event from a node to its subscribers. No completion expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Identifier of the emitting node.
    #[serde(
        serialize_with = "serialize_arc_str",
        deserialize_with = "deserialize_arc_str"
    )]
    pub guid: Arc<str>,
    /// Event name.
    pub method: String,
    /// Event payload.
    #[serde(default)]
    pub params: Value,
}

/// Discriminated union of wire messages.
///
/// Untagged: a Call carries `id` + `guid` + `method`, a Response carries `id`
/// without a target, an Event carries `guid` + `method` without an `id`.
/// Variant order matters for deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Inbound call (has `id`, `guid` and `method`).
    Call(Call),
    /// Completion (has `id` only).
    Response(Response),
    /// Event (no `id`).
    Event(Event),
    /// Unknown message type (forward-compatible catch-all).
    Unknown(Value),
}
