//! The base library.
//!
//! A native callback reads its arguments off the context by 1-based
//! position and returns its results as a vector; errors are raised
//! through `NativeError`, never by ordinary return.

use lunet_core::heap::{GcIdx, Heap, NativeContext, NativeError, NativeFn, NativeFunction};
use lunet_core::number::number_to_display;
use lunet_core::string::StringInterner;
use lunet_core::table::Table;
use lunet_core::value::Value;

pub struct BaseIndices {
    pub pcall: GcIdx<NativeFunction>,
    pub xpcall: GcIdx<NativeFunction>,
    pub error: GcIdx<NativeFunction>,
    pub tostring: GcIdx<NativeFunction>,
    pub pairs: GcIdx<NativeFunction>,
    pub ipairs: GcIdx<NativeFunction>,
    pub next_value: Value,
    pub ipairs_iter_value: Value,
}

pub fn register(
    globals: GcIdx<Table>,
    heap: &mut Heap,
    strings: &mut StringInterner,
) -> BaseIndices {
    let mut set = |heap: &mut Heap, strings: &mut StringInterner, name: &'static str, f: NativeFn| {
        let idx = heap.alloc_native(f, name);
        let key = strings.intern(name.as_bytes());
        heap.get_table_mut(globals)
            .raw_set_str(key, Value::Native(idx));
        idx
    };

    set(heap, strings, "print", native_print);
    set(heap, strings, "type", native_type);
    set(heap, strings, "tonumber", native_tonumber);
    set(heap, strings, "select", native_select);
    set(heap, strings, "unpack", native_unpack);
    set(heap, strings, "rawget", native_rawget);
    set(heap, strings, "rawset", native_rawset);
    set(heap, strings, "rawequal", native_rawequal);
    set(heap, strings, "setmetatable", native_setmetatable);
    set(heap, strings, "getmetatable", native_getmetatable);
    set(heap, strings, "assert", native_assert);

    let next_idx = set(heap, strings, "next", native_next);
    let next_value = Value::Native(next_idx);

    // The ipairs iterator is a singleton so every ipairs() call returns
    // the same function value. It is not a global.
    let ipairs_iter_idx = heap.alloc_native(native_ipairs_iter, "ipairs_iter");
    let ipairs_iter_value = Value::Native(ipairs_iter_idx);

    // VM-dispatched functions: registered as stubs, intercepted by index.
    let pcall = set(heap, strings, "pcall", native_vm_stub);
    let xpcall = set(heap, strings, "xpcall", native_vm_stub);
    let error = set(heap, strings, "error", native_vm_stub);
    let tostring = set(heap, strings, "tostring", native_vm_stub);
    let pairs = set(heap, strings, "pairs", native_vm_stub);
    let ipairs = set(heap, strings, "ipairs", native_vm_stub);

    // _VERSION and _G.
    let version_key = strings.intern(b"_VERSION");
    let version_val = Value::String(strings.intern(b"Lua 5.1"));
    heap.get_table_mut(globals)
        .raw_set_str(version_key, version_val);
    let g_key = strings.intern(b"_G");
    heap.get_table_mut(globals)
        .raw_set_str(g_key, Value::Table(globals));

    BaseIndices {
        pcall,
        xpcall,
        error,
        tostring,
        pairs,
        ipairs,
        next_value,
        ipairs_iter_value,
    }
}

/// Placeholder body for functions the VM dispatches itself.
fn native_vm_stub(_ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    Err(NativeError::Message(
        "function requires the running interpreter".to_string(),
    ))
}

/// Raw display form of a value (no `__tostring`; the VM-level tostring
/// handles that).
pub fn display_value(v: Value, heap: &Heap, strings: &StringInterner) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => number_to_display(n),
        Value::String(id) => strings.get_str_lossy(id).into_owned(),
        Value::Table(idx) => format!("table: 0x{:08x}", idx.index()),
        Value::Closure(idx) => format!("function: 0x{:08x}", idx.index()),
        Value::Native(idx) => format!("function: builtin: {}", heap.get_native(idx).name),
        Value::Userdata(idx) => format!("userdata: 0x{:08x}", idx.index()),
        Value::Thread(id) => format!("thread: 0x{:08x}", id.0),
    }
}

fn native_print(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let mut parts = Vec::with_capacity(ctx.args.len());
    for &arg in ctx.args {
        parts.push(display_value(arg, ctx.heap, ctx.strings));
    }
    println!("{}", parts.join("\t"));
    Ok(vec![])
}

fn native_type(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    if ctx.args.is_empty() {
        return Err(ctx.bad_arg(1, "type", "value"));
    }
    let name = ctx.arg(1).type_name();
    Ok(vec![Value::String(ctx.strings.intern(name.as_bytes()))])
}

fn native_tonumber(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let v = ctx.arg(1);
    let base = match ctx.arg(2) {
        Value::Nil => 10,
        Value::Number(n) => n as u32,
        _ => return Err(ctx.bad_arg(2, "tonumber", "number")),
    };
    if base == 10 {
        let result = match v {
            Value::Number(n) => Some(n),
            Value::String(id) => {
                lunet_core::number::str_to_number(ctx.strings.get_bytes(id))
            }
            _ => None,
        };
        return Ok(vec![result.map(Value::Number).unwrap_or(Value::Nil)]);
    }
    if !(2..=36).contains(&base) {
        return Err(NativeError::Message(
            "bad argument #2 to 'tonumber' (base out of range)".to_string(),
        ));
    }
    let Value::String(id) = v else {
        return Err(ctx.bad_arg(1, "tonumber", "string"));
    };
    let text = ctx.strings.get_str_lossy(id).trim().to_lowercase();
    match i64::from_str_radix(&text, base) {
        Ok(n) => Ok(vec![Value::Number(n as f64)]),
        Err(_) => Ok(vec![Value::Nil]),
    }
}

fn native_select(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    match ctx.arg(1) {
        Value::String(id) if ctx.strings.get_bytes(id) == b"#" => {
            Ok(vec![Value::Number((ctx.args.len() - 1) as f64)])
        }
        Value::Number(n) => {
            let n = n as i64;
            if n < 1 {
                return Err(NativeError::Message(
                    "bad argument #1 to 'select' (index out of range)".to_string(),
                ));
            }
            Ok(ctx.args.iter().skip(n as usize).copied().collect())
        }
        _ => Err(ctx.bad_arg(1, "select", "number")),
    }
}

fn native_unpack(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let Value::Table(t) = ctx.arg(1) else {
        return Err(ctx.bad_arg(1, "unpack", "table"));
    };
    let i = match ctx.arg(2) {
        Value::Nil => 1,
        Value::Number(n) => n as i64,
        _ => return Err(ctx.bad_arg(2, "unpack", "number")),
    };
    let j = match ctx.arg(3) {
        Value::Nil => ctx.heap.get_table(t).length(),
        Value::Number(n) => n as i64,
        _ => return Err(ctx.bad_arg(3, "unpack", "number")),
    };
    let mut out = Vec::new();
    for k in i..=j {
        out.push(ctx.heap.get_table(t).raw_geti(k));
    }
    Ok(out)
}

fn native_rawget(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let Value::Table(t) = ctx.arg(1) else {
        return Err(ctx.bad_arg(1, "rawget", "table"));
    };
    Ok(vec![ctx.heap.get_table(t).raw_get(ctx.arg(2))])
}

fn native_rawset(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let Value::Table(t) = ctx.arg(1) else {
        return Err(ctx.bad_arg(1, "rawset", "table"));
    };
    let key = ctx.arg(2);
    let val = ctx.arg(3);
    ctx.heap
        .get_table_mut(t)
        .raw_set(key, val)
        .map_err(|e| NativeError::Message(e.to_string()))?;
    Ok(vec![ctx.arg(1)])
}

fn native_rawequal(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    Ok(vec![Value::Boolean(ctx.arg(1) == ctx.arg(2))])
}

fn native_setmetatable(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let Value::Table(t) = ctx.arg(1) else {
        return Err(ctx.bad_arg(1, "setmetatable", "table"));
    };
    let mt = match ctx.arg(2) {
        Value::Nil => None,
        Value::Table(mt) => Some(mt),
        _ => return Err(ctx.bad_arg(2, "setmetatable", "nil or table")),
    };
    if let Some(current) = ctx.heap.get_table(t).metatable {
        let protected = ctx.strings.intern(b"__metatable");
        if !ctx.heap.get_table(current).raw_get_str(protected).is_nil() {
            return Err(NativeError::Message(
                "cannot change a protected metatable".to_string(),
            ));
        }
    }
    ctx.heap.get_table_mut(t).metatable = mt;
    Ok(vec![ctx.arg(1)])
}

fn native_getmetatable(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let mt = match ctx.arg(1) {
        Value::Table(t) => ctx.heap.get_table(t).metatable,
        Value::Userdata(u) => ctx.heap.get_userdata(u).metatable,
        _ => None,
    };
    let Some(mt) = mt else {
        return Ok(vec![Value::Nil]);
    };
    // A `__metatable` field shadows the real metatable.
    let protected = ctx.strings.intern(b"__metatable");
    let shadow = ctx.heap.get_table(mt).raw_get_str(protected);
    if shadow.is_nil() {
        Ok(vec![Value::Table(mt)])
    } else {
        Ok(vec![shadow])
    }
}

fn native_assert(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    if ctx.arg(1).is_truthy() {
        return Ok(ctx.args.to_vec());
    }
    match ctx.arg(2) {
        Value::Nil => Err(NativeError::Message("assertion failed!".to_string())),
        msg => Err(NativeError::Value(msg)),
    }
}

fn native_next(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let Value::Table(t) = ctx.arg(1) else {
        return Err(ctx.bad_arg(1, "next", "table"));
    };
    match ctx.heap.get_table(t).next(ctx.arg(2)) {
        Ok(Some((k, v))) => Ok(vec![k, v]),
        Ok(None) => Ok(vec![Value::Nil]),
        Err(()) => Err(NativeError::Message("invalid key to 'next'".to_string())),
    }
}

/// The iterator `ipairs` hands out: steps the index until a nil value.
fn native_ipairs_iter(ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    let Value::Table(t) = ctx.arg(1) else {
        return Err(ctx.bad_arg(1, "ipairs", "table"));
    };
    let Value::Number(i) = ctx.arg(2) else {
        return Err(ctx.bad_arg(2, "ipairs", "number"));
    };
    let next_i = i as i64 + 1;
    let v = ctx.heap.get_table(t).raw_geti(next_i);
    if v.is_nil() {
        Ok(vec![Value::Nil])
    } else {
        Ok(vec![Value::Number(next_i as f64), v])
    }
}
