//! Type coercion helpers.

use lunet_core::number::{number_to_display, str_to_number};
use lunet_core::string::{StringId, StringInterner};
use lunet_core::value::Value;

/// Number coercion: numbers pass through; strings that spell a number
/// (decimal or 0x hex, surrounding whitespace allowed) convert.
pub fn to_number(v: Value, strings: &StringInterner) -> Option<f64> {
    match v {
        Value::Number(n) => Some(n),
        Value::String(id) => str_to_number(strings.get_bytes(id)),
        _ => None,
    }
}

/// Convert a value to its string form for concatenation: strings pass
/// through, numbers format; everything else has no coercion.
pub fn to_string_for_concat(
    v: Value,
    strings: &mut StringInterner,
) -> Option<StringId> {
    match v {
        Value::String(id) => Some(id),
        Value::Number(n) => Some(strings.intern(number_to_display(n).as_bytes())),
        _ => None,
    }
}
