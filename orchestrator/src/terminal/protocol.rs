//! JSON messages exchanged with the browser terminal

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Keystrokes from the client
    Input,
    /// Terminal bytes for the client
    Output,
    /// Sent once the shell is attached
    Connected,
    Error,
    /// Client terminal size change, dimensions in `meta`
    Resize,
    #[serde(other)]
    Unknown,
}

/// Envelope of every WebSocket frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default)]
    pub data: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Message {
    pub fn new(kind: MessageType, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            meta: None,
        }
    }

    pub fn input(data: impl Into<String>) -> Self {
        Self::new(MessageType::Input, data)
    }

    pub fn output(data: impl Into<String>) -> Self {
        Self::new(MessageType::Output, data)
    }

    pub fn connected(data: impl Into<String>) -> Self {
        Self::new(MessageType::Connected, data)
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self::new(MessageType::Error, data)
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","data":"failed to encode terminal message"}"#.to_string()
        })
    }

    /// `(rows, cols)` of a resize request, if both are present and non-zero
    pub fn resize_dims(&self) -> Option<(u16, u16)> {
        let meta = self.meta.as_ref()?;
        let dim = |key: &str| {
            meta.get(key)
                .and_then(Value::as_u64)
                .and_then(|v| u16::try_from(v).ok())
                .filter(|v| *v > 0)
        };
        Some((dim("rows")?, dim("cols")?))
    }
}

/// Turns arbitrary pty bytes into text without splitting multi-byte characters
/// across messages. Invalid sequences are replaced.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // Incomplete character at the end: hold it back for the next chunk
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }
}
