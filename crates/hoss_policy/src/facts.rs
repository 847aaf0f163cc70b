//! Per-event facts that a compiled policy is evaluated against.

use std::collections::HashMap;
use std::fmt;

/// Operation class of a storage event, as seen by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOperation {
    /// Object was written (put, copy, multipart completion).
    Put,
    /// Object was removed or hidden behind a delete marker.
    Delete,
    /// Anything else (reads, unknown event names).
    Unsupported,
}

impl EventOperation {
    /// Classifies a storage provider event name.
    ///
    /// Names are accepted with and without the `s3:` prefix, since AWS omits it.
    pub fn classify(event_name: &str) -> Self {
        let name = event_name.strip_prefix("s3:").unwrap_or(event_name);
        match name {
            "ObjectCreated:Put" | "ObjectCreated:Copy" | "ObjectCreated:CompleteMultipartUpload" => {
                EventOperation::Put
            }
            "ObjectRemoved:Delete" | "ObjectRemoved:DeleteMarkerCreated" => EventOperation::Delete,
            _ => EventOperation::Unsupported,
        }
    }

    /// Returns true for read-only access events (get/head).
    pub fn is_access(event_name: &str) -> bool {
        let name = event_name.strip_prefix("s3:").unwrap_or(event_name);
        matches!(name, "ObjectAccessed:Get" | "ObjectAccessed:Head")
    }

    /// Returns the vocabulary value used by `event:operation` conditions.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOperation::Put => "PUT",
            EventOperation::Delete => "DELETE",
            EventOperation::Unsupported => "UNSUPPORTED",
        }
    }
}

impl fmt::Display for EventOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a policy may look at when deciding about one event.
///
/// Built fresh for every evaluated event and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFacts {
    /// Operation class of the event.
    pub operation: EventOperation,
    /// Object key (already unescaped).
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// User metadata attached to the object.
    pub metadata: HashMap<String, String>,
}

impl EventFacts {
    /// Creates facts for an event without metadata.
    pub fn new(operation: EventOperation, key: impl Into<String>, size: u64) -> Self {
        Self {
            operation,
            key: key.into(),
            size,
            metadata: HashMap::new(),
        }
    }

    /// Sets the object metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}
