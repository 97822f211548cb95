//! Metamethod lookup.

use lunet_core::heap::Heap;
use lunet_core::string::{StringId, StringInterner};
use lunet_core::value::Value;

/// Pre-interned metamethod event names.
pub struct MetamethodNames {
    pub add: StringId,
    pub sub: StringId,
    pub mul: StringId,
    pub div: StringId,
    pub mod_: StringId,
    pub pow: StringId,
    pub unm: StringId,
    pub len: StringId,
    pub concat: StringId,
    pub eq: StringId,
    pub lt: StringId,
    pub le: StringId,
    pub index: StringId,
    pub newindex: StringId,
    pub call: StringId,
    pub tostring: StringId,
    pub metatable: StringId,
}

impl MetamethodNames {
    pub fn init(strings: &mut StringInterner) -> Self {
        MetamethodNames {
            add: strings.intern(b"__add"),
            sub: strings.intern(b"__sub"),
            mul: strings.intern(b"__mul"),
            div: strings.intern(b"__div"),
            mod_: strings.intern(b"__mod"),
            pow: strings.intern(b"__pow"),
            unm: strings.intern(b"__unm"),
            len: strings.intern(b"__len"),
            concat: strings.intern(b"__concat"),
            eq: strings.intern(b"__eq"),
            lt: strings.intern(b"__lt"),
            le: strings.intern(b"__le"),
            index: strings.intern(b"__index"),
            newindex: strings.intern(b"__newindex"),
            call: strings.intern(b"__call"),
            tostring: strings.intern(b"__tostring"),
            metatable: strings.intern(b"__metatable"),
        }
    }
}

/// The metatable attached to a value, if any. Only tables and userdata
/// carry one.
pub fn get_metatable(val: Value, heap: &Heap) -> Option<lunet_core::heap::GcIdx<lunet_core::table::Table>> {
    match val {
        Value::Table(idx) => heap.get_table(idx).metatable,
        Value::Userdata(idx) => heap.get_userdata(idx).metatable,
        _ => None,
    }
}

/// Look up a metamethod on a value. Returns None when the value has no
/// metatable or the event is absent.
pub fn get_metamethod(val: Value, event: StringId, heap: &Heap) -> Option<Value> {
    let mt = get_metatable(val, heap)?;
    let handler = heap.get_table(mt).raw_get_str(event);
    if handler.is_nil() {
        None
    } else {
        Some(handler)
    }
}
