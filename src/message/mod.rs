//! Message envelope
//!
//! Every component exchanges [`Message`]s. A message records which binding
//! produced it, when it was produced, a nested JSON payload and a flat map of
//! scalar metadata.
//!
//! Once handed to the router a message is shared as `Arc<Message>` and never
//! mutated; a transform produces a new message through [`Message::derive`],
//! which keeps the original source and timestamp. Fan-out to several
//! destinations clones the `Arc`, so a message lives until its last queued
//! delivery has been transmitted.

pub mod path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Nested JSON object carried by a message
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Flat scalar metadata carried alongside the payload
pub type Metadata = BTreeMap<String, Scalar>;

/// Identifier of a transport binding
///
/// Cheap to clone; the router refers to bindings only through these ids.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BindingId(Arc<str>);

impl BindingId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BindingId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&str> for BindingId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<BindingId> for String {
    fn from(value: BindingId) -> Self {
        value.0.to_string()
    }
}

impl fmt::Debug for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BindingId({})", self.0)
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scalar metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{}", v),
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

/// The universal envelope moved between bindings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    source: BindingId,
    timestamp: DateTime<Utc>,
    payload: Payload,
    metadata: Metadata,
}

impl Message {
    /// Create a message stamped with the current time
    pub fn new(source: BindingId, payload: Payload) -> Self {
        Self {
            source,
            timestamp: Utc::now(),
            payload,
            metadata: Metadata::new(),
        }
    }

    /// Create a message from any JSON value
    ///
    /// Objects become the payload directly; anything else is wrapped as
    /// `{"value": ...}`.
    pub fn from_value(source: BindingId, value: serde_json::Value) -> Self {
        Self::new(source, into_payload(value))
    }

    /// Replace the metadata (builder style, before the message is shared)
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set a single metadata entry (builder style)
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the timestamp (builder style)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Produce a transformed message that keeps this message's source and timestamp
    pub fn derive(&self, payload: Payload, metadata: Metadata) -> Message {
        Message {
            source: self.source.clone(),
            timestamp: self.timestamp,
            payload,
            metadata,
        }
    }

    pub fn source(&self) -> &BindingId {
        &self.source
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Look up a payload value by `:` separated path
    pub fn get(&self, path: &str) -> Option<&serde_json::Value> {
        path::get_path(&self.payload, path)
    }

    /// Wrap into the shared form handed to the router
    pub fn into_shared(self) -> Arc<Message> {
        Arc::new(self)
    }
}

/// Convert any JSON value into a payload object
pub fn into_payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
