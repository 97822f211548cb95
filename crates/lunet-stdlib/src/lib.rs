//! Lunet standard library: the base functions and the coroutine package.
//!
//! Functions that only touch values, the heap, and the interner are plain
//! natives going through `NativeContext`. Functions that need the running
//! VM (protected calls, coroutine control, `__tostring` dispatch) are
//! registered as stubs here; the VM recognizes their indices and routes
//! them through its own dispatch.

pub mod base;
pub mod coroutine;

use lunet_core::heap::{GcIdx, Heap, NativeFunction};
use lunet_core::string::StringInterner;
use lunet_core::table::Table;
use lunet_core::value::Value;

/// Indices of native functions that need special VM dispatch, plus the
/// singleton iterator values `pairs`/`ipairs` hand out.
pub struct StdlibIndices {
    pub pcall: GcIdx<NativeFunction>,
    pub xpcall: GcIdx<NativeFunction>,
    pub error: GcIdx<NativeFunction>,
    pub tostring: GcIdx<NativeFunction>,
    pub pairs: GcIdx<NativeFunction>,
    pub ipairs: GcIdx<NativeFunction>,
    pub next_value: Value,
    pub ipairs_iter_value: Value,
    pub coro_create: GcIdx<NativeFunction>,
    pub coro_resume: GcIdx<NativeFunction>,
    pub coro_yield: GcIdx<NativeFunction>,
    pub coro_status: GcIdx<NativeFunction>,
    pub coro_wrap: GcIdx<NativeFunction>,
    pub coro_wrap_resume: GcIdx<NativeFunction>,
    pub coro_running: GcIdx<NativeFunction>,
}

/// Register the base library and the coroutine package into the globals
/// table.
pub fn register_all(
    globals: GcIdx<Table>,
    heap: &mut Heap,
    strings: &mut StringInterner,
) -> StdlibIndices {
    let base = base::register(globals, heap, strings);
    let coro = coroutine::register(globals, heap, strings);
    StdlibIndices {
        pcall: base.pcall,
        xpcall: base.xpcall,
        error: base.error,
        tostring: base.tostring,
        pairs: base.pairs,
        ipairs: base.ipairs,
        next_value: base.next_value,
        ipairs_iter_value: base.ipairs_iter_value,
        coro_create: coro.create,
        coro_resume: coro.resume,
        coro_yield: coro.yield_,
        coro_status: coro.status,
        coro_wrap: coro.wrap,
        coro_wrap_resume: coro.wrap_resume,
        coro_running: coro.running,
    }
}
