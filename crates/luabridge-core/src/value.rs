//! Host-side representation of engine values.
//!
//! [`HostValue`] is the single tagged variant every marshaling path goes
//! through: primitives are copied across the boundary, composite engine
//! values travel as [`ManagedReference`] leases, and host objects and host
//! callables keep their identity in both directions.

use crate::callable::HostFunction;
use crate::error::{BridgeError, Result};
use crate::host_object::HostObject;
use crate::reference::ManagedReference;
use std::fmt;
use std::sync::Arc;

/// Closed classification of engine values as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Boolean,
    Number,
    Text,
    /// A script function or a foreign C function
    Callable,
    Table,
    /// A host object previously pushed into the engine
    HostObject,
    /// A [`HostFunction`] previously registered with the engine
    HostCallable,
    /// Userdata, light userdata and coroutines
    Other,
}

impl ValueKind {
    /// Kinds the bridge hands out as [`ManagedReference`] leases.
    pub fn is_referenced(self) -> bool {
        matches!(self, Self::Callable | Self::Table | Self::Other)
    }

    /// Kinds the engine can index (`t[k]`) without a type error.
    pub fn is_indexable(self) -> bool {
        matches!(self, Self::Table | Self::HostObject | Self::Other)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nil => "nil",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::Text => "text",
            Self::Callable => "callable",
            Self::Table => "table",
            Self::HostObject => "host object",
            Self::HostCallable => "host callable",
            Self::Other => "other",
        })
    }
}

/// A value on the host side of the bridge.
pub enum HostValue {
    Nil,
    Boolean(bool),
    Number(f64),
    Text(String),
    /// A pinned engine value (table, function, userdata, coroutine)
    Reference(ManagedReference),
    /// A host object, recovered by identity when it comes back
    HostObject(Arc<dyn HostObject>),
    /// A host function, recovered by identity when it comes back
    HostCallable(HostFunction),
}

impl HostValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Nil => ValueKind::Nil,
            Self::Boolean(_) => ValueKind::Boolean,
            Self::Number(_) => ValueKind::Number,
            Self::Text(_) => ValueKind::Text,
            Self::Reference(reference) => reference.pinned_kind(),
            Self::HostObject(_) => ValueKind::HostObject,
            Self::HostCallable(_) => ValueKind::HostCallable,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&ManagedReference> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_reference(self) -> Option<ManagedReference> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_host_object(&self) -> Option<&Arc<dyn HostObject>> {
        match self {
            Self::HostObject(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_host_function(&self) -> Option<&HostFunction> {
        match self {
            Self::HostCallable(f) => Some(f),
            _ => None,
        }
    }

    /// Duplicate this value; references are pinned again independently.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(match self {
            Self::Nil => Self::Nil,
            Self::Boolean(b) => Self::Boolean(*b),
            Self::Number(n) => Self::Number(*n),
            Self::Text(s) => Self::Text(s.clone()),
            Self::Reference(r) => Self::Reference(r.try_clone()?),
            Self::HostObject(obj) => Self::HostObject(Arc::clone(obj)),
            Self::HostCallable(f) => Self::HostCallable(f.clone()),
        })
    }
}

/// Render a number the way the bridge shows numbers to people.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        String::from(if n > 0.0 { "inf" } else { "-inf" })
    } else {
        n.to_string()
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::Text(s) => f.write_str(s),
            Self::Reference(r) => fmt::Display::fmt(r, f),
            Self::HostObject(obj) => fmt::Display::fmt(obj, f),
            Self::HostCallable(_) => f.write_str("Host Function"),
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("Nil"),
            Self::Boolean(b) => f.debug_tuple("Boolean").field(b).finish(),
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Reference(r) => f.debug_tuple("Reference").field(r).finish(),
            Self::HostObject(obj) => f
                .debug_tuple("HostObject")
                .field(&format_args!("{obj}"))
                .finish(),
            Self::HostCallable(func) => f.debug_tuple("HostCallable").field(func).finish(),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Reference(a), Self::Reference(b)) => a.raw_equals(b).unwrap_or(false),
            (Self::HostObject(a), Self::HostObject(b)) => same_object(a, b),
            (Self::HostCallable(a), Self::HostCallable(b)) => a.same_function(b),
            _ => false,
        }
    }
}

/// Identity comparison for host objects; ignores vtable differences.
pub(crate) fn same_object(a: &Arc<dyn HostObject>, b: &Arc<dyn HostObject>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

macro_rules! numeric_into_host_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for HostValue {
                fn from(n: $ty) -> Self {
                    Self::Number(n as f64)
                }
            }
        )*
    };
}

numeric_into_host_value!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<ManagedReference> for HostValue {
    fn from(r: ManagedReference) -> Self {
        Self::Reference(r)
    }
}

impl From<HostFunction> for HostValue {
    fn from(f: HostFunction) -> Self {
        Self::HostCallable(f)
    }
}

impl From<Arc<dyn HostObject>> for HostValue {
    fn from(obj: Arc<dyn HostObject>) -> Self {
        Self::HostObject(obj)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Nil, Into::into)
    }
}

/// Typed extraction of a [`HostValue`].
pub trait FromHostValue: Sized {
    /// Human readable name of the expected shape, used in marshal errors.
    const EXPECTED: &'static str;

    fn from_host_value(value: HostValue) -> Result<Self>;
}

fn mismatch<T: FromHostValue>(value: &HostValue) -> BridgeError {
    BridgeError::Marshal {
        expected: T::EXPECTED,
        found: value.kind(),
    }
}

impl FromHostValue for HostValue {
    const EXPECTED: &'static str = "any value";

    fn from_host_value(value: HostValue) -> Result<Self> {
        Ok(value)
    }
}

impl FromHostValue for bool {
    const EXPECTED: &'static str = "boolean";

    fn from_host_value(value: HostValue) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch::<Self>(&value))
    }
}

impl FromHostValue for f64 {
    const EXPECTED: &'static str = "number";

    fn from_host_value(value: HostValue) -> Result<Self> {
        value.as_number().ok_or_else(|| mismatch::<Self>(&value))
    }
}

// Narrower numeric types truncate toward zero, as engine numbers are doubles.
macro_rules! numeric_from_host_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromHostValue for $ty {
                const EXPECTED: &'static str = "number";

                fn from_host_value(value: HostValue) -> Result<Self> {
                    value
                        .as_number()
                        .map(|n| n as $ty)
                        .ok_or_else(|| mismatch::<Self>(&value))
                }
            }
        )*
    };
}

numeric_from_host_value!(f32, i64, i32, u32);

impl FromHostValue for String {
    const EXPECTED: &'static str = "text";

    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::Text(s) => Ok(s),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromHostValue for ManagedReference {
    const EXPECTED: &'static str = "engine reference";

    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::Reference(r) => Ok(r),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromHostValue for Arc<dyn HostObject> {
    const EXPECTED: &'static str = "host object";

    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::HostObject(obj) => Ok(obj),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromHostValue for HostFunction {
    const EXPECTED: &'static str = "host function";

    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::HostCallable(f) => Ok(f),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl<T: FromHostValue> FromHostValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_host_value(value: HostValue) -> Result<Self> {
        match value {
            HostValue::Nil => Ok(None),
            other => T::from_host_value(other).map(Some),
        }
    }
}
