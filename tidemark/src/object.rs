//! Opaque payloads for sources of kind [`ScalarKind::Object`](crate::ScalarKind::Object).
//!
//! An [`ObjectValue`] is a tagged value: the tag is kept alongside the payload
//! so a reader can ask for a specific Rust type with [`FromObject`] and get
//! `None` back when the stored value is of another type.

use serde::{Deserialize, Serialize};

use crate::storage::MapValue;

/// A value stored in an opaque source.
///
/// `Json(Value::Null)` is the null value; it is rejected on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectValue {
    /// A boolean.
    Bool(bool),
    /// A 32-bit signed integer.
    Int32(i32),
    /// A 64-bit signed integer.
    Int64(i64),
    /// A 32-bit float.
    Float32(f32),
    /// A 64-bit float.
    Float64(f64),
    /// A UTF-8 string.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// A JSON document.
    Json(#[serde(with = "json_text")] serde_json::Value),
}

impl ObjectValue {
    /// Returns `true` for the null JSON document.
    pub fn is_null(&self) -> bool {
        matches!(self, ObjectValue::Json(serde_json::Value::Null))
    }

    /// Returns the name of the payload type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectValue::Bool(_) => "bool",
            ObjectValue::Int32(_) => "i32",
            ObjectValue::Int64(_) => "i64",
            ObjectValue::Float32(_) => "f32",
            ObjectValue::Float64(_) => "f64",
            ObjectValue::Text(_) => "text",
            ObjectValue::Bytes(_) => "bytes",
            ObjectValue::Json(_) => "json",
        }
    }

    /// Down-casts the payload to `T`, returning `None` if it holds another type.
    pub fn downcast<T: FromObject>(&self) -> Option<T> {
        T::from_object(self)
    }
}

impl MapValue for ObjectValue {
    const CODEC: &'static str = "object";
}

// JSON documents are stored as text; the binary codec cannot decode
// self-describing values.
mod json_text {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &serde_json::Value, s: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(value).map_err(S::Error::custom)?;
        s.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<serde_json::Value, D::Error> {
        let text = String::deserialize(d)?;
        serde_json::from_str(&text).map_err(D::Error::custom)
    }
}

/// Types that can be extracted from an [`ObjectValue`].
///
/// Extraction is exact: an `Int32` payload does not convert to `i64`.
pub trait FromObject: Sized {
    /// Returns the payload as `Self`, or `None` if the tag does not match.
    fn from_object(value: &ObjectValue) -> Option<Self>;
}

macro_rules! object_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for ObjectValue {
                fn from(value: $ty) -> Self {
                    ObjectValue::$variant(value)
                }
            }

            impl FromObject for $ty {
                fn from_object(value: &ObjectValue) -> Option<Self> {
                    match value {
                        ObjectValue::$variant(inner) => Some(inner.clone()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

object_conversions! {
    bool => Bool,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
    String => Text,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
}

impl From<&str> for ObjectValue {
    fn from(value: &str) -> Self {
        ObjectValue::Text(value.to_string())
    }
}

impl From<&[u8]> for ObjectValue {
    fn from(value: &[u8]) -> Self {
        ObjectValue::Bytes(value.to_vec())
    }
}

impl FromObject for ObjectValue {
    fn from_object(value: &ObjectValue) -> Option<Self> {
        Some(value.clone())
    }
}
