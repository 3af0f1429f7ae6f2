//! Payload type moved between processors over the bus.
//!
//! A payload is the unit of work exchanged between pipeline stages: opaque byte
//! content, the identifier of the source that produced it and an optional
//! metadata bag that travels with it.

use bytes::Bytes;
use chrono::Utc;
use serde_json::{Map, Value};

/// Errors that can occur while building payloads.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Missing required builder attribute: {}", _0)]
    MissingBuilderAttribute(String),
}

/// Unit of data exchanged between processors.
///
/// Payloads are immutable by convention. Once handed to the bus the producer
/// gives up its copy; cloning only bumps the reference count of the content.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// Raw content of the payload.
    pub content: Bytes,
    /// Identifier of the source that produced the payload.
    pub source: String,
    /// Optional metadata passed along with the content.
    pub meta: Option<Map<String, Value>>,
    /// Creation timestamp in microseconds since Unix epoch.
    pub timestamp: i64,
}

impl Payload {
    /// Shortcut for a payload with content and source only.
    pub fn new(content: impl Into<Bytes>, source: impl Into<String>) -> Self {
        Payload {
            content: content.into(),
            source: source.into(),
            meta: None,
            timestamp: Utc::now().timestamp_micros(),
        }
    }

    /// Content interpreted as UTF-8, lossy.
    pub fn content_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    /// Looks up a metadata entry.
    pub fn meta_value(&self, key: &str) -> Option<&Value> {
        self.meta.as_ref().and_then(|meta| meta.get(key))
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let payload_json = serde_json::json!({
            "source": self.source,
            "content": self.content_str(),
            "timestamp": self.timestamp,
            "meta": self.meta,
        });

        let formatted =
            serde_json::to_string_pretty(&payload_json).unwrap_or_else(|_| format!("{self:?}"));

        write!(f, "{formatted}")
    }
}

/// Builder for constructing Payload instances with validation.
#[derive(Default, Debug)]
pub struct PayloadBuilder {
    /// Payload content (required for build).
    pub content: Option<Bytes>,
    /// Source identifier (required for build).
    pub source: Option<String>,
    /// Optional metadata.
    pub meta: Option<Map<String, Value>>,
    /// Creation timestamp, defaults to current time.
    pub timestamp: Option<i64>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        PayloadBuilder {
            timestamp: Some(Utc::now().timestamp_micros()),
            ..Default::default()
        }
    }

    pub fn content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = Some(content.into());
        self
    }
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
    pub fn meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }
    /// Inserts a single metadata entry, creating the map when needed.
    pub fn meta_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Result<Payload, Error> {
        Ok(Payload {
            content: self
                .content
                .ok_or_else(|| Error::MissingBuilderAttribute("content".to_string()))?,
            source: self
                .source
                .ok_or_else(|| Error::MissingBuilderAttribute("source".to_string()))?,
            meta: self.meta,
            timestamp: self
                .timestamp
                .ok_or_else(|| Error::MissingBuilderAttribute("timestamp".to_string()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_builder_success() {
        let payload = PayloadBuilder::new()
            .content("hello")
            .source("unit")
            .meta_entry("attempt", 1)
            .build()
            .unwrap();

        assert_eq!(payload.content, Bytes::from("hello"));
        assert_eq!(payload.source, "unit");
        assert_eq!(payload.meta_value("attempt"), Some(&json!(1)));
        assert!(payload.timestamp > 0);
    }

    #[test]
    fn test_payload_builder_missing_content() {
        let result = PayloadBuilder::new().source("unit").build();

        assert!(matches!(
            result,
            Err(Error::MissingBuilderAttribute(attr)) if attr == "content"
        ));
    }

    #[test]
    fn test_payload_builder_missing_source() {
        let result = PayloadBuilder::new().content("data").build();

        assert!(matches!(
            result,
            Err(Error::MissingBuilderAttribute(attr)) if attr == "source"
        ));
    }

    #[test]
    fn test_payload_clone_shares_content() {
        let payload = Payload::new(vec![1u8, 2, 3], "bytes");
        let cloned = payload.clone();

        assert_eq!(payload, cloned);
        assert_eq!(payload.content.as_ptr(), cloned.content.as_ptr());
    }

    #[test]
    fn test_payload_display_contains_source() {
        let payload = Payload::new("Hello from: X", "X");
        let rendered = payload.to_string();

        assert!(rendered.contains("\"source\": \"X\""));
        assert!(rendered.contains("Hello from: X"));
    }
}
