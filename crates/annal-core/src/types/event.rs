use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single event carried by a commit.
///
/// The body is an opaque serialized payload; annal never interprets it.
/// Headers carry cross-cutting metadata (correlation ids, causation ids,
/// user info) that should not live inside the domain payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    headers: HashMap<String, Value>,
    body: Value,
}

impl EventMessage {
    /// Create an event with the given body and no headers.
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Attach a header (builder style).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn headers(&self) -> &HashMap<String, Value> {
        &self.headers
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// True when the event carries no payload. The event stream refuses to
    /// stage bodyless events.
    pub fn is_empty(&self) -> bool {
        self.body.is_null()
    }
}
