//! Message model exchanged with the transport layer.
//!
//! A [`Message`] is a command code plus an ordered field map. Framing is the
//! transport's business; this module only offers a named `MsgPack` encoding
//! (`rmp_serde::to_vec_named()`) for transports that want one.

pub mod codes;
pub mod enum_event;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use enum_event::EnumChange;

/// Field carrying a long-running operation's correlation id.
pub const FIELD_ID: &str = "id";
/// Field carrying a human-readable failure description.
pub const FIELD_MESSAGE: &str = "message";

// ---------------------------------------------------------------------------
// MessageValue
// ---------------------------------------------------------------------------

/// Typed value stored under a field of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageValue {
    /// Field present without a payload.
    Void,
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    List(Vec<MessageValue>),
    Map(BTreeMap<String, MessageValue>),
}

impl fmt::Display for MessageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => Ok(()),
            Self::Int(i) => write!(f, "{i}"),
            Self::Long(l) => write!(f, "{l}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::String(s) => f.write_str(s),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}={value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for MessageValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MessageValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for MessageValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<i32> for MessageValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Unit exchanged over a connection.
///
/// `sequence` is assigned by the sending connection; `reply_sequence` links a
/// reply to the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub command_code: u32,
    #[serde(default)]
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_sequence: Option<u64>,
    #[serde(default)]
    pub values: BTreeMap<String, MessageValue>,
}

impl Message {
    /// Creates an empty message with the given command code.
    #[must_use]
    pub fn new(command_code: u32) -> Self {
        Self {
            command_code,
            sequence: 0,
            reply_sequence: None,
            values: BTreeMap::new(),
        }
    }

    /// Creates an empty reply to `request`.
    #[must_use]
    pub fn reply_to(request: &Message, command_code: u32) -> Self {
        Self {
            reply_sequence: Some(request.sequence),
            ..Self::new(command_code)
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<MessageValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MessageValue>) {
        self.values.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MessageValue> {
        self.values.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the field only if it holds a `Long`. Other integer widths do
    /// not count.
    #[must_use]
    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(MessageValue::Long(value)) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(MessageValue::String(value)) => Some(value),
            _ => None,
        }
    }

    /// Encodes the message as named `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes a message previously produced by [`Message::to_msgpack`].
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the bytes are not a valid message.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Errors from the `MsgPack` message codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
