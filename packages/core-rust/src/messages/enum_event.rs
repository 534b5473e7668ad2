//! Enumeration change event: which item ids appeared and disappeared.
//!
//! Wire shape: `"added-0".."added-N"` and `"removed-0".."removed-N"`,
//! zero-based and contiguous. Decoding stops at the first missing index.

use super::codes::CC_ENUM_EVENT;
use super::{Message, MessageValue};

const ADDED_PREFIX: &str = "added-";
const REMOVED_PREFIX: &str = "removed-";

/// Decoded enumeration change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnumChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl EnumChange {
    /// Builds a `CC_ENUM_EVENT` message. Both lists start at index 0.
    #[must_use]
    pub fn create<A, R>(added: A, removed: R) -> Message
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let mut msg = Message::new(CC_ENUM_EVENT);
        write_list(&mut msg, ADDED_PREFIX, added);
        write_list(&mut msg, REMOVED_PREFIX, removed);
        msg
    }

    /// Decodes an enumeration change from any message carrying the list fields.
    #[must_use]
    pub fn parse(message: &Message) -> Self {
        Self {
            added: read_list(message, ADDED_PREFIX),
            removed: read_list(message, REMOVED_PREFIX),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

fn write_list<I>(msg: &mut Message, prefix: &str, items: I)
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    for (i, item) in items.into_iter().enumerate() {
        msg.insert(format!("{prefix}{i}"), MessageValue::String(item.into()));
    }
}

fn read_list(msg: &Message, prefix: &str) -> Vec<String> {
    (0..)
        .map_while(|i| msg.get(&format!("{prefix}{i}")))
        .map(ToString::to_string)
        .collect()
}
