// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Values passed between coroutines on resume, yield, and return.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use crate::co::{Co, CoId};
use crate::error::ScriptError;

/// A coroutine body after it has been started.
pub type BoxBody = Pin<Box<dyn Future<Output = Result<Vec<Value>, ScriptError>>>>;

type BodyFactory = dyn Fn(Co, Vec<Value>) -> BoxBody;

/// Tagged value exchanged through coroutine stacks.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Thread(CoId),
    Func(Func),
}

impl Value {
    /// Everything except `nil` and `false` is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::Str(_) | Value::Bytes(_) => "string",
            Value::Thread(_) => "thread",
            Value::Func(_) => "function",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<CoId> {
        match self {
            Value::Thread(id) => Some(*id),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Str(a), Value::Bytes(b)) | (Value::Bytes(b), Value::Str(a)) => {
                a.as_bytes() == b.as_slice()
            }
            (Value::Thread(a), Value::Thread(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(&a.body, &b.body),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Value::Thread(id) => write!(f, "thread: {id}"),
            Value::Func(func) => write!(f, "function: {}", func.name()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<CoId> for Value {
    fn from(id: CoId) -> Self {
        Value::Thread(id)
    }
}

impl From<Func> for Value {
    fn from(f: Func) -> Self {
        Value::Func(f)
    }
}

/// A named coroutine entry point.
///
/// Calling it with a `Co` handle and the start arguments yields the body
/// future; nothing runs until the scheduler first polls that future.
#[derive(Clone)]
pub struct Func {
    name: Rc<str>,
    body: Rc<BodyFactory>,
}

impl Func {
    pub fn new<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(Co, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = Result<Vec<Value>, ScriptError>> + 'static,
    {
        Self {
            name: Rc::from(name),
            body: Rc::new(move |co, args| Box::pin(f(co, args)) as BoxBody),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn start(&self, co: Co, args: Vec<Value>) -> BoxBody {
        (self.body)(co, args)
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Func({})", self.name)
    }
}

/// Build a `Vec<Value>` from heterogeneous literals.
#[macro_export]
macro_rules! values {
    () => { Vec::<$crate::Value>::new() };
    ($($v:expr),+ $(,)?) => { vec![$($crate::Value::from($v)),+] };
}
