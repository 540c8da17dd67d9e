use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What the provider actually delivers to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    /// Opaque key/value payload for the app.
    pub data: Map<String, Value>,
}

/// Links a deferred message to the entity that produced it, so it can be
/// purged once that entity is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTag {
    pub kind: String,
    pub id: String,
}

impl MessageTag {
    pub fn new(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

/// A message plus the bookkeeping needed to defer it.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub message: PushMessage,
    pub tag: Option<MessageTag>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message: PushMessage {
                title: title.into(),
                body: body.into(),
                data: Map::new(),
            },
            tag: None,
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.message.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: MessageTag) -> Self {
        self.tag = Some(tag);
        self
    }

    /// The `type` entry of the payload, if set.
    pub fn kind(&self) -> Option<&str> {
        self.message.data.get("type").and_then(Value::as_str)
    }
}

/// Per-recipient outcome reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered,
    Rejected(String),
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}
