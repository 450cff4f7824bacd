use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

const PREVIEW_CHARS: usize = 10;

/// One inbound publish frame as seen by the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    topic: String,
    payload: Vec<u8>,
    received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::received_at(topic, payload, Local::now())
    }

    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        received_at: DateTime<Local>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.received_at
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.received_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.topic,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = String::from_utf8_lossy(&self.payload);
        let preview: String = content.chars().take(PREVIEW_CHARS).collect();
        let ellipsis = if content.chars().count() > PREVIEW_CHARS {
            "…"
        } else {
            ""
        };
        write!(
            f,
            "{} - {} - {}{}",
            self.received_at.format("%H:%M:%S"),
            self.topic,
            preview,
            ellipsis
        )
    }
}

/// Outbound message body.
///
/// Text and raw bytes are sent as-is; structured values are encoded as JSON
/// with object keys in sorted order, so equal values always produce equal
/// bytes on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Payload::Json)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(text) => text.into_bytes(),
            Payload::Bytes(bytes) => bytes,
            // Value's Display is compact JSON; maps are BTreeMap-backed
            Payload::Json(value) => value.to_string().into_bytes(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}
