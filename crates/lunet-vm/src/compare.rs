//! Comparison operations with Lua 5.1 semantics.

use lunet_core::string::StringInterner;
use lunet_core::value::Value;

/// Primitive (raw) equality: type-driven, no metamethods. Numbers compare
/// by value, strings by content (ids, since all strings are interned),
/// everything else by identity.
pub fn raw_eq(a: Value, b: Value) -> bool {
    a == b
}

/// Equality with metamethod detection. Returns `(equal, needs_mm)`:
/// `needs_mm` is set when both operands are tables or both are userdata
/// and raw equality failed, so `__eq` may decide.
pub fn lua_eq(a: Value, b: Value) -> (bool, bool) {
    if raw_eq(a, b) {
        return (true, false);
    }
    let needs_mm = matches!(
        (a, b),
        (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
    );
    (false, needs_mm)
}

/// Result of an order comparison.
pub enum CompareResult {
    Ok(bool),
    /// Not comparable primitively: try `__lt`/`__le`.
    NeedMetamethod,
}

/// Less-than: numbers numerically, strings byte-lexicographically.
pub fn lua_lt(a: Value, b: Value, strings: &StringInterner) -> CompareResult {
    match (a, b) {
        (Value::Number(na), Value::Number(nb)) => CompareResult::Ok(na < nb),
        (Value::String(sa), Value::String(sb)) => {
            CompareResult::Ok(strings.get_bytes(sa) < strings.get_bytes(sb))
        }
        _ => CompareResult::NeedMetamethod,
    }
}

/// Less-than-or-equal.
pub fn lua_le(a: Value, b: Value, strings: &StringInterner) -> CompareResult {
    match (a, b) {
        (Value::Number(na), Value::Number(nb)) => CompareResult::Ok(na <= nb),
        (Value::String(sa), Value::String(sb)) => {
            CompareResult::Ok(strings.get_bytes(sa) <= strings.get_bytes(sb))
        }
        _ => CompareResult::NeedMetamethod,
    }
}
