//! Arithmetic and concatenation with Lua 5.1 semantics.
//!
//! Every number is an IEEE-754 double, so arithmetic itself cannot fail:
//! division by zero is an infinity and `0/0` is NaN. A type mismatch asks
//! the dispatcher to try the metamethods instead.

use crate::coerce;
use lunet_core::number::{lua_mod, lua_pow};
use lunet_core::string::StringInterner;
use lunet_core::value::Value;

/// Result of a raw arithmetic attempt.
pub enum ArithResult {
    Ok(Value),
    /// Type mismatch: the caller should try `__add` and friends.
    NeedMetamethod,
}

/// Arithmetic operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

/// Binary arithmetic: fast path for two numbers, then numeric-string
/// coercion, then metamethod fallback.
pub fn arith_op(op: ArithOp, a: Value, b: Value, strings: &StringInterner) -> ArithResult {
    let (na, nb) = match (coerce::to_number(a, strings), coerce::to_number(b, strings)) {
        (Some(na), Some(nb)) => (na, nb),
        _ => return ArithResult::NeedMetamethod,
    };
    let r = match op {
        ArithOp::Add => na + nb,
        ArithOp::Sub => na - nb,
        ArithOp::Mul => na * nb,
        ArithOp::Div => na / nb,
        ArithOp::Mod => lua_mod(na, nb),
        ArithOp::Pow => lua_pow(na, nb),
    };
    ArithResult::Ok(Value::Number(r))
}

/// Unary minus.
pub fn arith_unm(v: Value, strings: &StringInterner) -> ArithResult {
    match coerce::to_number(v, strings) {
        Some(n) => ArithResult::Ok(Value::Number(-n)),
        None => ArithResult::NeedMetamethod,
    }
}

/// Concatenate a run of values into one string, building a single buffer.
/// Only numbers and strings convert; anything else asks for `__concat`.
pub fn concat_values(values: &[Value], strings: &mut StringInterner) -> ArithResult {
    let mut buffer = Vec::new();
    for &v in values {
        match coerce::to_string_for_concat(v, strings) {
            Some(id) => buffer.extend_from_slice(strings.get_bytes(id)),
            None => return ArithResult::NeedMetamethod,
        }
    }
    ArithResult::Ok(Value::String(strings.intern(&buffer)))
}

/// True when the value concatenates without a metamethod.
pub fn is_concatable(v: Value) -> bool {
    matches!(v, Value::String(_) | Value::Number(_))
}
