//! The language backend capability — the narrow interface the core drives,
//! and the seam a concrete interpreter binding plugs into.

use thiserror::Error;
use warden_value::Value;

pub use warden_value::GuestCallable;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{name} is not a callable function in the guest")]
    NotCallable { name: String },
    #[error("runtime error evaluating {name}: {message}")]
    Runtime { name: String, message: String },
    #[error("function {name} is already defined")]
    DuplicateFunction { name: String },
    #[error("type conversion error: {0}")]
    Conversion(String),
}

/// A host-defined function the guest may call back into. `FnMut` because a
/// callback may legitimately mutate captured host state between
/// invocations.
pub type HostCallback = Box<dyn FnMut(Value) -> Value + Send>;

/// Operations a concrete backend must implement. A backend embeds some
/// interpreter; the core only ever calls these six operations.
pub trait Backend: Send {
    /// Compile/load a script. Returns `Ok(true)` on success, `Ok(false)` on
    /// a source-level compile error (reported via `last_error`, not an
    /// `Err` — compile failure is a reported result, not a thrown
    /// exception).
    fn compile_script(&mut self, script: &[u8]) -> Result<bool, BackendError>;

    /// Does `name` resolve to a callable global in the guest?
    fn is_function(&mut self, name: &str) -> bool;

    /// Call a guest-defined function. `args` is always a `Value::Array`.
    /// May re-enter the host through any callback registered via
    /// `define_function` — see `warden-proxy`/`warden-guest` for the
    /// re-entrancy discipline this implies.
    fn call_function(&mut self, name: &str, args: Value) -> Result<Value, BackendError>;

    /// Bind `name` to a constant value visible to guest code.
    fn define_constant(&mut self, name: &str, value: Value);

    /// Bind `name` to a host-callable. Duplicate names are an error and the
    /// existing binding must be left untouched.
    fn define_function(&mut self, name: &str, callback: HostCallback) -> Result<(), BackendError>;

    /// Release any backend-private state. Called at most once.
    fn destroy(&mut self);

    /// The most recent human-readable diagnostic, if any. Cleared by
    /// nothing in particular — callers read it immediately after an
    /// operation that may have set it.
    fn last_error(&self) -> Option<&str> {
        None
    }

    /// Record a diagnostic. The default no-op backend simply drops it;
    /// concrete backends typically store the last message for `last_error`.
    fn report_error(&mut self, _message: String) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend {
        last_error: Option<String>,
    }

    impl Backend for NullBackend {
        fn compile_script(&mut self, _script: &[u8]) -> Result<bool, BackendError> {
            Ok(true)
        }
        fn is_function(&mut self, _name: &str) -> bool {
            false
        }
        fn call_function(&mut self, name: &str, _args: Value) -> Result<Value, BackendError> {
            Err(BackendError::NotCallable { name: name.into() })
        }
        fn define_constant(&mut self, _name: &str, _value: Value) {}
        fn define_function(&mut self, _name: &str, _callback: HostCallback) -> Result<(), BackendError> {
            Ok(())
        }
        fn destroy(&mut self) {}
        fn last_error(&self) -> Option<&str> {
            self.last_error.as_deref()
        }
        fn report_error(&mut self, message: String) {
            self.last_error = Some(message);
        }
    }

    #[test]
    fn not_callable_surfaces_as_backend_error() {
        let mut backend = NullBackend { last_error: None };
        let err = backend.call_function("missing", Value::empty_array()).unwrap_err();
        assert!(matches!(err, BackendError::NotCallable { .. }));
    }

    #[test]
    fn report_error_is_readable_back() {
        let mut backend = NullBackend { last_error: None };
        backend.report_error("boom".into());
        assert_eq!(backend.last_error(), Some("boom"));
    }
}
