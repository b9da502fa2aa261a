//! Runtime values and the primitive half of cache keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::heap::GcObjectId;

/// A value stored in a binding slot, property, or element.
///
/// Numbers are integral; the evaluator has no floating-point lane, which keeps
/// primitive key equality total and deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(i64),
    Str(String),
    /// Reference to a heap object; equality is identity.
    Object(GcObjectId),
}

impl Value {
    pub fn as_object(&self) -> Option<GcObjectId> {
        match self {
            Self::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0,
            Self::Str(s) => !s.is_empty(),
            Self::Object(_) => true,
        }
    }

    /// Primitive key for this value, or `None` for objects.
    pub fn to_primitive_key(&self) -> Option<PrimitiveKey> {
        match self {
            Self::Undefined => Some(PrimitiveKey::Undefined),
            Self::Null => Some(PrimitiveKey::Null),
            Self::Bool(b) => Some(PrimitiveKey::Bool(*b)),
            Self::Number(n) => Some(PrimitiveKey::Number(*n)),
            Self::Str(s) => Some(PrimitiveKey::Str(s.clone())),
            Self::Object(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Object(_) => "object",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
            Self::Object(id) => write!(f, "[object {id}]"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<GcObjectId> for Value {
    fn from(value: GcObjectId) -> Self {
        Self::Object(value)
    }
}

/// Value-compared key for a primitive capture.
///
/// `Uninitialized` stands for a binding read while still in its temporal dead
/// zone; it never equals any real value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrimitiveKey {
    Undefined,
    Null,
    Bool(bool),
    Number(i64),
    Str(String),
    Uninitialized,
}

impl PrimitiveKey {
    /// The value this key was built from; `None` for `Uninitialized`.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Self::Undefined => Some(Value::Undefined),
            Self::Null => Some(Value::Null),
            Self::Bool(b) => Some(Value::Bool(*b)),
            Self::Number(n) => Some(Value::Number(*n)),
            Self::Str(s) => Some(Value::Str(s.clone())),
            Self::Uninitialized => None,
        }
    }
}

impl fmt::Display for PrimitiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Uninitialized => f.write_str("<uninitialized>"),
            other => match other.to_value() {
                Some(value) => write!(f, "{value}"),
                None => Ok(()),
            },
        }
    }
}
