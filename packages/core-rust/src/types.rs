use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Runtime value of a data item or one of its attributes.
///
/// `Null` doubles as "no value" for items and as "attribute removed" inside
/// attribute change sets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Variant {
    /// No value.
    #[default]
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Signed 32-bit integer.
    Int(i32),
    /// Signed 64-bit integer.
    Long(i64),
    /// 64-bit IEEE 754 floating point.
    Double(f64),
    /// UTF-8 string.
    String(String),
}

impl Variant {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Interprets the variant as a boolean.
    ///
    /// Numbers are `true` when non-zero, strings when they are non-empty and
    /// not `"false"` (case-insensitive). `Null` is `false`.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Long(l) => *l != 0,
            Self::Double(d) => *d != 0.0,
            Self::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        }
    }

    /// Returns the value as a 64-bit integer, if it is integral.
    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i64::from(*i)),
            Self::Long(l) => Some(*l),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Returns the value as a double, if it is numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(f64::from(*i)),
            Self::Long(l) => Some(*l as f64),
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the string form of the value, or `None` for `Null`.
    #[must_use]
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Long(l) => write!(f, "{l}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Variant {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Attribute map of a data item. `BTreeMap` keeps iteration deterministic.
pub type Attributes = BTreeMap<String, Variant>;

/// Data flow a chain stage participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IoDirection {
    /// Values flowing from the device/source towards subscribers.
    Input,
    /// Values written by clients towards the device/source.
    Output,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("INPUT"),
            Self::Output => f.write_str("OUTPUT"),
        }
    }
}

/// Set of I/O directions. Equality is exact set equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IoDirections {
    input: bool,
    output: bool,
}

impl IoDirections {
    /// The empty set.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            input: false,
            output: false,
        }
    }

    /// `{Input, Output}`.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            input: true,
            output: true,
        }
    }

    /// The single-element set `{direction}`.
    #[must_use]
    pub const fn only(direction: IoDirection) -> Self {
        match direction {
            IoDirection::Input => Self {
                input: true,
                output: false,
            },
            IoDirection::Output => Self {
                input: false,
                output: true,
            },
        }
    }

    #[must_use]
    pub const fn contains(self, direction: IoDirection) -> bool {
        match direction {
            IoDirection::Input => self.input,
            IoDirection::Output => self.output,
        }
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.input && !self.output
    }

    /// Iterates the contained directions, `Input` first.
    pub fn iter(self) -> impl Iterator<Item = IoDirection> {
        [IoDirection::Input, IoDirection::Output]
            .into_iter()
            .filter(move |d| self.contains(*d))
    }
}

impl From<IoDirection> for IoDirections {
    fn from(direction: IoDirection) -> Self {
        Self::only(direction)
    }
}

impl fmt::Display for IoDirections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, direction) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{direction}")?;
        }
        f.write_str("]")
    }
}
