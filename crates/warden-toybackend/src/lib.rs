//! A minimal scripting language `Backend` used as the default, always-
//! available collaborator: a stand-in for whatever real interpreter a
//! concrete deployment plugs in. Grounded in `spec/run.c`'s calling
//! convention (constants, callbacks, and guest functions all resolved by
//! name) rather than any particular production language.

mod ast;
mod eval;
mod lexer;
mod parser;

use std::collections::HashMap;

use warden_backend::{Backend, BackendError, HostCallback};
use warden_value::Value;

use ast::FunctionDef;
use eval::EvalContext;

/// Host function names are reserved the moment they're registered: a script
/// can't shadow `define_function`'s bindings with its own `fn` of the same
/// name, and `define_function` itself refuses to overwrite a name the script
/// already declared.
pub struct ToyBackend {
    functions: HashMap<String, FunctionDef>,
    constants: HashMap<String, Value>,
    callbacks: HashMap<String, HostCallback>,
    last_error: Option<String>,
}

impl ToyBackend {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
            constants: HashMap::new(),
            callbacks: HashMap::new(),
            last_error: None,
        }
    }
}

impl Default for ToyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for ToyBackend {
    fn compile_script(&mut self, script: &[u8]) -> Result<bool, BackendError> {
        let src = match std::str::from_utf8(script) {
            Ok(s) => s,
            Err(_) => {
                self.last_error = Some("script is not valid UTF-8".to_string());
                return Ok(false);
            }
        };
        let tokens = match lexer::lex(src) {
            Ok(t) => t,
            Err(e) => {
                self.last_error = Some(e);
                return Ok(false);
            }
        };
        let program = match parser::parse(&tokens) {
            Ok(p) => p,
            Err(e) => {
                self.last_error = Some(e);
                return Ok(false);
            }
        };
        self.functions = program.functions.into_iter().collect();
        Ok(true)
    }

    fn is_function(&mut self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn call_function(&mut self, name: &str, args: Value) -> Result<Value, BackendError> {
        let def = match self.functions.get(name) {
            Some(def) => def.clone(),
            None => return Err(BackendError::NotCallable { name: name.to_string() }),
        };
        let args = match args {
            Value::Array(items) => items,
            other => {
                return Err(BackendError::Conversion(format!(
                    "call_function expects an argument array, got {}",
                    other.type_name()
                )))
            }
        };
        let mut ctx = EvalContext {
            functions: &self.functions,
            callbacks: &mut self.callbacks,
            constants: &self.constants,
        };
        eval::call_user_function(&mut ctx, &def, args).map_err(|message| {
            self.last_error = Some(message.clone());
            BackendError::Runtime { name: name.to_string(), message }
        })
    }

    fn define_constant(&mut self, name: &str, value: Value) {
        self.constants.insert(name.to_string(), value);
    }

    fn define_function(&mut self, name: &str, callback: HostCallback) -> Result<(), BackendError> {
        if self.functions.contains_key(name) || self.callbacks.contains_key(name) {
            return Err(BackendError::DuplicateFunction { name: name.to_string() });
        }
        self.callbacks.insert(name.to_string(), callback);
        Ok(())
    }

    fn destroy(&mut self) {
        self.functions.clear();
        self.constants.clear();
        self.callbacks.clear();
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn report_error(&mut self, message: String) {
        self.last_error = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_and_call_returns_string_literal() {
        let mut backend = ToyBackend::new();
        assert_eq!(backend.compile_script(br#"fn test() { "ok" }"#).unwrap(), true);
        assert!(backend.is_function("test"));
        let result = backend.call_function("test", Value::empty_array()).unwrap();
        assert_eq!(result.as_str(), Some("ok"));
    }

    #[test]
    fn compile_error_is_reported_not_thrown() {
        let mut backend = ToyBackend::new();
        assert_eq!(backend.compile_script(b"fn broken( {").unwrap(), false);
        assert!(backend.last_error().is_some());
    }

    #[test]
    fn constants_are_visible_to_guest_code() {
        let mut backend = ToyBackend::new();
        backend.define_constant("k", Value::Int32(42));
        backend.compile_script(b"fn get_k() { k }").unwrap();
        let result = backend.call_function("get_k", Value::empty_array()).unwrap();
        assert_eq!(result.as_i32(), Some(42));
    }

    #[test]
    fn host_callback_round_trips_through_nested_calls() {
        let mut backend = ToyBackend::new();
        let add_callback: HostCallback = Box::new(|args| {
            let items = args.as_array().unwrap();
            Value::Int32(items[0].as_i32().unwrap() + items[1].as_i32().unwrap())
        });
        backend.define_function("add", add_callback).unwrap();
        backend
            .compile_script(b"fn sum3() { add(add(1, 2), 3) }")
            .unwrap();
        let result = backend.call_function("sum3", Value::empty_array()).unwrap();
        assert_eq!(result.as_i32(), Some(6));
    }

    #[test]
    fn duplicate_define_function_is_rejected() {
        let mut backend = ToyBackend::new();
        let cb: HostCallback = Box::new(|_| Value::Void);
        backend.define_function("noop", cb).unwrap();
        let cb2: HostCallback = Box::new(|_| Value::Void);
        assert!(matches!(
            backend.define_function("noop", cb2),
            Err(BackendError::DuplicateFunction { .. })
        ));
    }

    #[test]
    fn calling_unknown_function_is_not_callable() {
        let mut backend = ToyBackend::new();
        backend.compile_script(b"fn test() { 1 }").unwrap();
        let err = backend.call_function("missing", Value::empty_array()).unwrap_err();
        assert!(matches!(err, BackendError::NotCallable { .. }));
    }

    #[test]
    fn arity_mismatch_surfaces_as_runtime_error() {
        let mut backend = ToyBackend::new();
        backend.compile_script(b"fn needs_one(x) { x }").unwrap();
        let err = backend
            .call_function("needs_one", Value::empty_array())
            .unwrap_err();
        assert!(matches!(err, BackendError::Runtime { .. }));
    }

    #[test]
    fn if_else_and_comparisons_evaluate() {
        let mut backend = ToyBackend::new();
        backend
            .compile_script(b"fn sign(x) { if x > 0 { 1 } else { if x < 0 { -1 } else { 0 } } }")
            .unwrap();
        let mut args = |n: i32| backend.call_function("sign", Value::array(vec![Value::Int32(n)]).unwrap()).unwrap();
        assert_eq!(args(5).as_i32(), Some(1));
        assert_eq!(args(-5).as_i32(), Some(-1));
        assert_eq!(args(0).as_i32(), Some(0));
    }

    #[test]
    fn destroy_clears_all_state() {
        let mut backend = ToyBackend::new();
        backend.compile_script(b"fn test() { 1 }").unwrap();
        backend.define_constant("k", Value::Int32(1));
        backend.destroy();
        assert!(!backend.is_function("test"));
    }
}
