//! Scalar kinds and the typed data point.
//!
//! Every source is declared with exactly one [`ScalarKind`]. The kind decides
//! which typed store, and therefore which physical map and value codec, backs
//! the source. On the Rust side each kind has a matching type implementing the
//! sealed [`Scalar`] trait, so typed accessors are resolved at compile time and
//! checked against the declared kind at run time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WriteError;
use crate::object::ObjectValue;
use crate::storage::MapValue;
use crate::typed::{Stores, TypedStore};

/// The declared value type of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    /// 64-bit floating point.
    Float64,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit floating point.
    Float32,
    /// Opaque payload, see [`ObjectValue`].
    Object,
}

impl ScalarKind {
    /// All kinds, in declaration order.
    pub const ALL: [ScalarKind; 5] = [
        ScalarKind::Float64,
        ScalarKind::Int32,
        ScalarKind::Int64,
        ScalarKind::Float32,
        ScalarKind::Object,
    ];

    /// Returns the lowercase name used in statistics keys and log output.
    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Float64 => "float64",
            ScalarKind::Int32 => "int32",
            ScalarKind::Int64 => "int64",
            ScalarKind::Float32 => "float32",
            ScalarKind::Object => "object",
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for f64 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for f32 {}
    impl Sealed for crate::object::ObjectValue {}
}

/// A Rust type that can be stored as the value of a source.
///
/// Implemented for `f64`, `i32`, `i64`, `f32` and [`ObjectValue`]; the trait is
/// sealed so the set of kinds stays closed.
pub trait Scalar: sealed::Sealed + MapValue {
    /// The kind a source must be declared with to accept this type.
    const KIND: ScalarKind;

    /// Returns the typed store holding every source of this kind.
    #[doc(hidden)]
    fn store(stores: &Stores) -> &TypedStore<Self>;

    /// Validates a value before it is written.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if the value cannot be stored.
    fn check(&self, _timestamp: i64) -> std::result::Result<(), WriteError> {
        Ok(())
    }
}

macro_rules! numeric_scalar {
    ($ty:ty, $kind:ident, $field:ident) => {
        impl Scalar for $ty {
            const KIND: ScalarKind = ScalarKind::$kind;

            fn store(stores: &Stores) -> &TypedStore<Self> {
                &stores.$field
            }
        }
    };
}

numeric_scalar!(f64, Float64, float64);
numeric_scalar!(i32, Int32, int32);
numeric_scalar!(i64, Int64, int64);
numeric_scalar!(f32, Float32, float32);

impl Scalar for ObjectValue {
    const KIND: ScalarKind = ScalarKind::Object;

    fn store(stores: &Stores) -> &TypedStore<Self> {
        &stores.object
    }

    fn check(&self, timestamp: i64) -> std::result::Result<(), WriteError> {
        if self.is_null() {
            return Err(WriteError::NullValue { timestamp });
        }
        Ok(())
    }
}

/// A single `(timestamp, value)` reading.
///
/// Timestamps are milliseconds and must be non-negative to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint<T> {
    /// Timestamp in milliseconds.
    pub timestamp: i64,
    /// The reading.
    pub value: T,
}

impl<T> DataPoint<T> {
    /// Creates a new data point.
    pub fn new(timestamp: i64, value: T) -> Self {
        Self { timestamp, value }
    }
}

impl<T> From<(i64, T)> for DataPoint<T> {
    fn from((timestamp, value): (i64, T)) -> Self {
        Self { timestamp, value }
    }
}
