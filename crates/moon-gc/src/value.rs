//! Tagged values and object handles.

use std::fmt;

use crate::error::GcError;

/// A handle to a collected object.
///
/// Handles are slab indices paired with a generation counter, so a handle that
/// outlives its object is detected instead of aliasing whatever reused the
/// slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef {
    index: u32,
    generation: u32,
}

impl GcRef {
    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the object arena.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot at the time the object was allocated.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub(crate) const fn slot(self) -> usize {
        self.index as usize
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({}#{})", self.index, self.generation)
    }
}

/// A VM value. Only [`Value::Object`] is traced.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    LightUserData(usize),
    Object(GcRef),
}

impl Value {
    #[inline]
    #[must_use]
    pub const fn is_nil(self) -> bool {
        matches!(self, Self::Nil)
    }

    /// The referenced object, if this value is collectable.
    #[inline]
    #[must_use]
    pub const fn as_object(self) -> Option<GcRef> {
        match self {
            Self::Object(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_integer(self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(i),
            _ => None,
        }
    }

    /// Basic type name, as seen by scripts.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) | Self::Number(_) => "number",
            Self::LightUserData(_) => "userdata",
            Self::Object(_) => "object",
        }
    }
}

impl From<GcRef> for Value {
    fn from(r: GcRef) -> Self {
        Self::Object(r)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

/// A normalized table key.
///
/// Floats with an exact integer value are stored as integers so that `1` and
/// `1.0` address the same slot. Other floats are keyed by their bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKey {
    Boolean(bool),
    Integer(i64),
    Number(u64),
    LightUserData(usize),
    Object(GcRef),
}

impl TableKey {
    /// Normalizes `value` into a key.
    ///
    /// # Errors
    ///
    /// `nil` and NaN cannot be used as keys.
    pub fn from_value(value: Value) -> Result<Self, GcError> {
        Ok(match value {
            Value::Nil => return Err(GcError::NilKey),
            Value::Boolean(b) => Self::Boolean(b),
            Value::Integer(i) => Self::Integer(i),
            Value::Number(n) if n.is_nan() => return Err(GcError::NaNKey),
            Value::Number(n) => float_to_integer(n).map_or(Self::Number(n.to_bits()), Self::Integer),
            Value::LightUserData(p) => Self::LightUserData(p),
            Value::Object(r) => Self::Object(r),
        })
    }

    #[must_use]
    pub fn to_value(self) -> Value {
        match self {
            Self::Boolean(b) => Value::Boolean(b),
            Self::Integer(i) => Value::Integer(i),
            Self::Number(bits) => Value::Number(f64::from_bits(bits)),
            Self::LightUserData(p) => Value::LightUserData(p),
            Self::Object(r) => Value::Object(r),
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_object(self) -> Option<GcRef> {
        match self {
            Self::Object(r) => Some(r),
            _ => None,
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn float_to_integer(n: f64) -> Option<i64> {
    // 2^63 is exactly representable; anything at or above it overflows i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if n.fract() == 0.0 && (-LIMIT..LIMIT).contains(&n) {
        Some(n as i64)
    } else {
        None
    }
}
