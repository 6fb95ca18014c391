//! The tagged-variant carrier that crosses the host/guest boundary.
//!
//! Strings are bounded to `MAX_STRING_LEN` bytes, arrays to `MAX_ARRAY_LEN`
//! elements, and the total element count read while decoding one nested
//! structure must never exceed `MAX_ARRAY_LEN` either. `warden-proto`
//! enforces those bounds on the wire; this crate only enforces them at
//! construction time so a caller can't build an invalid `Value` in the
//! first place.

use std::fmt;

/// Upper bound (exclusive) on `Value::String` byte length.
pub const MAX_STRING_LEN: usize = 4096;
/// Upper bound (exclusive) on `Value::Array` element count.
pub const MAX_ARRAY_LEN: usize = 1024;

/// An opaque handle to a callable living only in-process. Never serialized;
/// see `Value::Function`'s doc comment and `warden-proto`'s `encode_value`.
pub trait GuestCallable: Send {
    /// Invoke the callable with an argument array, producing a `Value`.
    fn call(&mut self, args: Value) -> Value;
}

/// A boxed, type-erased `GuestCallable`. Cloning a `Value::Function` is not
/// supported — callables are moved, matching the original's single-owner
/// function pointer table.
pub type GuestCallableHandle = Box<dyn GuestCallable>;

/// The value carrier crossing the host/guest boundary.
///
/// `Function` is the one case that is never encoded on the wire: it exists
/// purely so a concrete `Backend` can hand a callable back to `warden-guest`
/// when `define_function` synthesizes one. Attempting to encode it is a
/// `warden_proto::ProtoError`, not a panic.
pub enum Value {
    Void,
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(Vec<u8>),
    Array(Vec<Value>),
    Function(GuestCallableHandle),
}

impl Value {
    pub fn int32(v: i32) -> Self {
        Value::Int32(v)
    }

    pub fn float32(v: f32) -> Self {
        Value::Float32(v)
    }

    pub fn boolean(v: bool) -> Self {
        Value::Bool(v)
    }

    /// Build a `Value::String`, truncating silently is never done here —
    /// callers that exceed `MAX_STRING_LEN` get `None` instead.
    pub fn string(s: impl Into<Vec<u8>>) -> Option<Self> {
        let bytes = s.into();
        if bytes.len() >= MAX_STRING_LEN {
            None
        } else {
            Some(Value::String(bytes))
        }
    }

    pub fn array(values: Vec<Value>) -> Option<Self> {
        if values.len() >= MAX_ARRAY_LEN {
            None
        } else {
            Some(Value::Array(values))
        }
    }

    pub fn empty_array() -> Self {
        Value::Array(Vec::new())
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Int32(_) => "int32",
            Value::Float32(_) => "float32",
            Value::Bool(_) => "boolean",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Function(_) => "function",
        }
    }
}

/// `Function` can't derive `PartialEq`/`Clone`/`Debug` (the callable is
/// neither comparable nor cloneable), so every other case does by hand.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Float32(a), Value::Float32(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "Void"),
            Value::Int32(v) => write!(f, "Int32({v})"),
            Value::Float32(v) => write!(f, "Float32({v})"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::String(bytes) => write!(f, "String({:?})", String::from_utf8_lossy(bytes)),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Function(_) => write!(f, "Function(<callable>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_rejects_oversize() {
        let big = vec![b'a'; MAX_STRING_LEN];
        assert!(Value::string(big).is_none());
        assert!(Value::string("ok").is_some());
    }

    #[test]
    fn array_rejects_oversize() {
        let items: Vec<Value> = (0..MAX_ARRAY_LEN).map(Value::Int32).collect();
        assert!(Value::array(items).is_none());
        assert!(Value::array(vec![Value::Int32(1)]).is_some());
    }

    #[test]
    fn equality_ignores_function_values() {
        struct Noop;
        impl GuestCallable for Noop {
            fn call(&mut self, _args: Value) -> Value {
                Value::Void
            }
        }
        let a = Value::Function(Box::new(Noop));
        let b = Value::Function(Box::new(Noop));
        assert_ne!(a, b);
    }

    #[test]
    fn accessors_roundtrip() {
        assert_eq!(Value::Int32(7).as_i32(), Some(7));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::string("ok").unwrap().as_str(), Some("ok"));
    }

    #[test]
    fn dropping_nested_arrays_does_not_leak() {
        for _ in 0..1000 {
            let nested = Value::Array(vec![
                Value::Int32(1),
                Value::Array(vec![Value::string("x").unwrap(), Value::Bool(false)]),
            ]);
            drop(nested);
        }
    }
}
