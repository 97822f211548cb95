//! Lua runtime error types.

use lunet_core::string::StringInterner;
use lunet_core::value::Value;
use std::fmt;

/// A Lua runtime error, unwinding to the nearest protected call.
#[derive(Clone, Debug)]
pub enum LuaError {
    /// General runtime error with message (position already included).
    Runtime(String),
    /// Too many nested calls.
    StackOverflow,
    /// `error(v)` with an arbitrary value (string, number, table, ...).
    Value(Value),
    /// Not an error: transports a coroutine yield out of the dispatch
    /// loop to the matching resume.
    Yield(Vec<Value>),
}

impl LuaError {
    /// Convert this error into the value a protected call reports.
    pub fn into_value(self, strings: &mut StringInterner) -> Value {
        match self {
            LuaError::Runtime(msg) => Value::String(strings.intern(msg.as_bytes())),
            LuaError::StackOverflow => Value::String(strings.intern(b"stack overflow")),
            LuaError::Value(v) => v,
            LuaError::Yield(_) => Value::Nil, // never surfaces as an error value
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaError::Runtime(msg) => write!(f, "{msg}"),
            LuaError::StackOverflow => write!(f, "stack overflow"),
            LuaError::Value(v) => write!(f, "{v:?}"),
            LuaError::Yield(_) => write!(f, "<yield>"),
        }
    }
}

impl std::error::Error for LuaError {}
