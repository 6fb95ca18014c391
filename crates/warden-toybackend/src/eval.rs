//! Tree-walking evaluator for the toy scripting language. Runtime errors
//! (unknown function, arity mismatch, type mismatch) are `Err(String)`,
//! turned into a `BackendError::Runtime` by `call_function` — they never
//! panic.

use std::collections::HashMap;

use warden_backend::HostCallback;
use warden_value::Value;

use crate::ast::{BinOp, Block, Expr, FunctionDef, UnaryOp};

/// `Value` intentionally has no `Clone` impl (a `Function` variant can't be
/// cloned generically). The toy language never constructs `Value::Function`
/// values itself, so a local clone that errors on that one case is safe.
pub fn clone_value(v: &Value) -> Value {
    match v {
        Value::Void => Value::Void,
        Value::Int32(i) => Value::Int32(*i),
        Value::Float32(f) => Value::Float32(*f),
        Value::Bool(b) => Value::Bool(*b),
        Value::String(s) => Value::String(s.clone()),
        Value::Array(items) => Value::Array(items.iter().map(clone_value).collect()),
        Value::Function(_) => unreachable!("toy language never stores Value::Function"),
    }
}

pub struct Scope {
    frames: Vec<HashMap<String, Value>>,
}

impl Scope {
    pub fn new() -> Self {
        Self { frames: vec![HashMap::new()] }
    }

    fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn define(&mut self, name: String, value: Value) {
        self.frames.last_mut().expect("scope always has a frame").insert(name, value);
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }
}

/// Everything the evaluator needs to resolve a `Call`/`Var` that isn't a
/// local binding: the program's own functions, host-defined callbacks, and
/// host-defined constants.
pub struct EvalContext<'a> {
    pub functions: &'a HashMap<String, FunctionDef>,
    pub callbacks: &'a mut HashMap<String, HostCallback>,
    pub constants: &'a HashMap<String, Value>,
}

pub fn call_user_function(ctx: &mut EvalContext, def: &FunctionDef, args: Vec<Value>) -> Result<Value, String> {
    if args.len() != def.params.len() {
        return Err(format!(
            "arity mismatch: expected {} arguments, got {}",
            def.params.len(),
            args.len()
        ));
    }
    let mut scope = Scope::new();
    for (name, value) in def.params.iter().zip(args) {
        scope.define(name.clone(), value);
    }
    eval_block(ctx, &mut scope, &def.body)
}

fn eval_block(ctx: &mut EvalContext, scope: &mut Scope, block: &Block) -> Result<Value, String> {
    scope.push();
    let result = (|| {
        for stmt in &block.stmts {
            match stmt {
                crate::ast::Stmt::Let(name, expr) => {
                    let value = eval_expr(ctx, scope, expr)?;
                    scope.define(name.clone(), value);
                }
                crate::ast::Stmt::Expr(expr) => {
                    eval_expr(ctx, scope, expr)?;
                }
            }
        }
        match &block.tail {
            Some(expr) => eval_expr(ctx, scope, expr),
            None => Ok(Value::Void),
        }
    })();
    scope.pop();
    result
}

fn eval_expr(ctx: &mut EvalContext, scope: &mut Scope, expr: &Expr) -> Result<Value, String> {
    match expr {
        Expr::Int(v) => Ok(Value::Int32(*v)),
        Expr::Float(v) => Ok(Value::Float32(*v)),
        Expr::Bool(v) => Ok(Value::Bool(*v)),
        Expr::Str(s) => Value::string(s.clone()).ok_or_else(|| "string literal exceeds the 4096-byte limit".to_string()),
        Expr::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_expr(ctx, scope, item)?);
            }
            Value::array(values).ok_or_else(|| "array literal exceeds the 1024-element limit".to_string())
        }
        Expr::Var(name) => {
            if let Some(v) = scope.get(name) {
                return Ok(clone_value(v));
            }
            if let Some(v) = ctx.constants.get(name) {
                return Ok(clone_value(v));
            }
            Err(format!("unknown variable '{name}'"))
        }
        Expr::Unary(op, inner) => {
            let v = eval_expr(ctx, scope, inner)?;
            match (op, v) {
                (UnaryOp::Neg, Value::Int32(i)) => Ok(Value::Int32(-i)),
                (UnaryOp::Neg, Value::Float32(f)) => Ok(Value::Float32(-f)),
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (op, other) => Err(format!("cannot apply {op:?} to a {}", other.type_name())),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval_expr(ctx, scope, lhs)?;
            let r = eval_expr(ctx, scope, rhs)?;
            eval_binary(*op, l, r)
        }
        Expr::If(cond, then_branch, else_branch) => {
            let c = eval_expr(ctx, scope, cond)?;
            let is_true = match c {
                Value::Bool(b) => b,
                other => return Err(format!("if-condition must be boolean, got {}", other.type_name())),
            };
            if is_true {
                eval_block(ctx, scope, then_branch)
            } else if let Some(else_branch) = else_branch {
                eval_block(ctx, scope, else_branch)
            } else {
                Ok(Value::Void)
            }
        }
        Expr::Block(block) => eval_block(ctx, scope, block),
        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval_expr(ctx, scope, a)?);
            }
            if let Some(def) = ctx.functions.get(name).cloned() {
                return call_user_function(ctx, &def, values);
            }
            if let Some(callback) = ctx.callbacks.get_mut(name) {
                let packed = Value::array(values).ok_or_else(|| "too many arguments".to_string())?;
                return Ok(callback(packed));
            }
            Err(format!("unknown function '{name}'"))
        }
    }
}

fn eval_binary(op: BinOp, l: Value, r: Value) -> Result<Value, String> {
    use BinOp::*;
    match (op, l, r) {
        (Add, Value::Int32(a), Value::Int32(b)) => Ok(Value::Int32(a.wrapping_add(b))),
        (Add, Value::Float32(a), Value::Float32(b)) => Ok(Value::Float32(a + b)),
        (Add, Value::Int32(a), Value::Float32(b)) => Ok(Value::Float32(a as f32 + b)),
        (Add, Value::Float32(a), Value::Int32(b)) => Ok(Value::Float32(a + b as f32)),
        (Add, Value::String(mut a), Value::String(b)) => {
            a.extend_from_slice(&b);
            Value::string(a).ok_or_else(|| "concatenated string exceeds the 4096-byte limit".to_string())
        }
        (Sub, Value::Int32(a), Value::Int32(b)) => Ok(Value::Int32(a.wrapping_sub(b))),
        (Sub, Value::Float32(a), Value::Float32(b)) => Ok(Value::Float32(a - b)),
        (Mul, Value::Int32(a), Value::Int32(b)) => Ok(Value::Int32(a.wrapping_mul(b))),
        (Mul, Value::Float32(a), Value::Float32(b)) => Ok(Value::Float32(a * b)),
        (Div, Value::Int32(_), Value::Int32(0)) => Err("division by zero".to_string()),
        (Div, Value::Int32(a), Value::Int32(b)) => Ok(Value::Int32(a / b)),
        (Div, Value::Float32(a), Value::Float32(b)) => Ok(Value::Float32(a / b)),
        (Eq, a, b) => Ok(Value::Bool(a == b)),
        (Ne, a, b) => Ok(Value::Bool(a != b)),
        (Lt, Value::Int32(a), Value::Int32(b)) => Ok(Value::Bool(a < b)),
        (Le, Value::Int32(a), Value::Int32(b)) => Ok(Value::Bool(a <= b)),
        (Gt, Value::Int32(a), Value::Int32(b)) => Ok(Value::Bool(a > b)),
        (Ge, Value::Int32(a), Value::Int32(b)) => Ok(Value::Bool(a >= b)),
        (Lt, Value::Float32(a), Value::Float32(b)) => Ok(Value::Bool(a < b)),
        (Le, Value::Float32(a), Value::Float32(b)) => Ok(Value::Bool(a <= b)),
        (Gt, Value::Float32(a), Value::Float32(b)) => Ok(Value::Bool(a > b)),
        (Ge, Value::Float32(a), Value::Float32(b)) => Ok(Value::Bool(a >= b)),
        (op, l, r) => Err(format!(
            "cannot apply {op:?} to {} and {}",
            l.type_name(),
            r.type_name()
        )),
    }
}
