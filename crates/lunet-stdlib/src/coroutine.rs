//! The coroutine package surface.
//!
//! Every function here needs the running VM (thread creation, stack
//! switching), so they are all registered as stubs whose dispatch lives
//! in the VM, wired up through the returned indices.

use lunet_core::heap::{GcIdx, Heap, NativeContext, NativeError, NativeFunction};
use lunet_core::string::StringInterner;
use lunet_core::table::Table;
use lunet_core::value::Value;

pub struct CoroutineIndices {
    pub create: GcIdx<NativeFunction>,
    pub resume: GcIdx<NativeFunction>,
    pub yield_: GcIdx<NativeFunction>,
    pub status: GcIdx<NativeFunction>,
    pub wrap: GcIdx<NativeFunction>,
    pub wrap_resume: GcIdx<NativeFunction>,
    pub running: GcIdx<NativeFunction>,
}

pub fn register(
    globals: GcIdx<Table>,
    heap: &mut Heap,
    strings: &mut StringInterner,
) -> CoroutineIndices {
    let package = heap.alloc_table(0, 8);

    let mut entry = |heap: &mut Heap, strings: &mut StringInterner, name: &'static str| {
        let idx = heap.alloc_native(native_vm_stub, name);
        let key = strings.intern(name.as_bytes());
        heap.get_table_mut(package)
            .raw_set_str(key, Value::Native(idx));
        idx
    };

    let create = entry(heap, strings, "create");
    let resume = entry(heap, strings, "resume");
    let yield_ = entry(heap, strings, "yield");
    let status = entry(heap, strings, "status");
    let wrap = entry(heap, strings, "wrap");
    let running = entry(heap, strings, "running");

    // Internal resume used by wrap's __call wrapper; not exported.
    let wrap_resume = heap.alloc_native(native_vm_stub, "wrap_resume");

    let key = strings.intern(b"coroutine");
    heap.get_table_mut(globals)
        .raw_set_str(key, Value::Table(package));

    CoroutineIndices {
        create,
        resume,
        yield_,
        status,
        wrap,
        wrap_resume,
        running,
    }
}

fn native_vm_stub(_ctx: &mut NativeContext) -> Result<Vec<Value>, NativeError> {
    Err(NativeError::Message(
        "function requires the running interpreter".to_string(),
    ))
}
