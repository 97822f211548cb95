//! Lua VM state.
//!
//! The `stack`, `call_stack`, `stack_top`, and `open_upvals` fields always
//! belong to the **currently running** thread. When a coroutine is
//! resumed, the caller's state is saved into a `LuaThread` and the
//! coroutine's state is swapped in; on yield or return the swap reverses.

use crate::callinfo::CallInfo;
use crate::dispatch;
use crate::error::LuaError;
use crate::metamethod::MetamethodNames;
use lunet_compiler::compiler;
use lunet_compiler::proto::Proto;
use lunet_core::heap::{GcIdx, Heap, UpVal, UpValLocation};
use lunet_core::string::StringInterner;
use lunet_core::table::Table;
use lunet_core::value::{ThreadId, Value};
use lunet_stdlib::StdlibIndices;

/// Maximum depth of the Lua frame stack.
pub const MAX_CALL_DEPTH: usize = 20_000;
/// Maximum nesting of re-entrant native boundaries (metamethods,
/// protected calls, iterators).
pub const MAX_NATIVE_DEPTH: usize = 200;

/// Thread id used for the main thread in saved-state bookkeeping.
pub const MAIN_THREAD_ID: usize = usize::MAX;

/// Coroutine lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Created or yielded, ready to be resumed.
    Suspended,
    /// Currently executing.
    Running,
    /// Resumed another coroutine and is waiting for it.
    Normal,
    /// Finished or errored out.
    Dead,
}

impl CoroutineStatus {
    pub fn name(self) -> &'static str {
        match self {
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    }
}

/// What to do with the resume arguments when a suspended coroutine
/// continues.
#[derive(Clone, Debug)]
pub enum ResumeAction {
    /// The yield happened in a call position: place the values as that
    /// call's results and continue.
    Call {
        result_base: usize,
        num_results: i32,
    },
    /// The yield happened in a tail-call position: the values become the
    /// current frame's return values.
    Return,
}

/// Per-coroutine state: an independent value stack and frame stack.
#[derive(Clone)]
pub struct LuaThread {
    pub stack: Vec<Value>,
    pub call_stack: Vec<CallInfo>,
    pub stack_top: usize,
    pub open_upvals: Vec<(usize, GcIdx<UpVal>)>,
    pub status: CoroutineStatus,
    /// Identity used by suspended-upvalue bookkeeping.
    pub id: usize,
    /// False until the first resume sets up the body call.
    pub started: bool,
    /// Where resume arguments go on the next continue.
    pub resume_action: Option<ResumeAction>,
}

impl LuaThread {
    fn new(id: usize) -> Self {
        LuaThread {
            stack: vec![Value::Nil; 64],
            call_stack: Vec::new(),
            stack_top: 0,
            open_upvals: Vec::new(),
            status: CoroutineStatus::Suspended,
            id,
            started: false,
            resume_action: None,
        }
    }

    /// Placeholder left in the thread table while the real state is
    /// swapped into the VM.
    pub(crate) fn placeholder(id: usize) -> Self {
        LuaThread {
            stack: Vec::new(),
            call_stack: Vec::new(),
            stack_top: 0,
            open_upvals: Vec::new(),
            status: CoroutineStatus::Running,
            id,
            started: true,
            resume_action: None,
        }
    }
}

/// The Lua virtual machine.
pub struct Vm {
    /// Value stack (register windows) of the running thread.
    pub stack: Vec<Value>,
    /// Frame stack of the running thread.
    pub call_stack: Vec<CallInfo>,
    /// Object heap.
    pub heap: Heap,
    /// String interner, shared with compiled chunks.
    pub strings: StringInterner,
    /// First free stack slot past the active windows.
    pub stack_top: usize,
    /// Flattened prototypes; nested protos live here too.
    pub protos: Vec<Proto>,
    /// Flat indices of each prototype's nested prototypes.
    pub proto_children: Vec<Vec<usize>>,
    /// The globals table new chunks close over.
    pub globals: GcIdx<Table>,
    /// Open upvalues of the running thread, by stack slot.
    pub open_upvals: Vec<(usize, GcIdx<UpVal>)>,
    /// All coroutines ever created.
    pub threads: Vec<LuaThread>,
    /// Currently running coroutine (None = main thread).
    pub running_thread: Option<usize>,
    /// Saved caller states for (possibly nested) resumes.
    pub(crate) caller_stack: Vec<LuaThread>,
    /// Pre-interned metamethod names.
    pub mm: MetamethodNames,
    /// Indices of the stdlib functions the dispatcher intercepts.
    pub stdlib: StdlibIndices,
    /// Active re-entrant native boundaries (call_function nesting).
    pub(crate) boundary_depth: usize,
    /// Boundary depth at which the running coroutine may yield.
    pub(crate) yield_base: usize,
    /// Resume placement recorded at the yield site.
    pub(crate) pending_resume: Option<ResumeAction>,
}

impl Vm {
    pub fn new() -> Self {
        let mut strings = StringInterner::new();
        let mm = MetamethodNames::init(&mut strings);
        let mut heap = Heap::new();
        let globals = heap.alloc_table(0, 32);
        let stdlib = lunet_stdlib::register_all(globals, &mut heap, &mut strings);
        Vm {
            stack: vec![Value::Nil; 1024],
            call_stack: Vec::new(),
            heap,
            strings,
            stack_top: 0,
            protos: Vec::new(),
            proto_children: Vec::new(),
            globals,
            open_upvals: Vec::new(),
            threads: Vec::new(),
            running_thread: None,
            caller_stack: Vec::new(),
            mm,
            stdlib,
            boundary_depth: 0,
            yield_base: 0,
            pending_resume: None,
        }
    }

    /// Ensure the stack has at least `size` slots from `base`.
    pub fn ensure_stack(&mut self, base: usize, size: usize) {
        let needed = base + size;
        if needed > self.stack.len() {
            self.stack.resize(needed, Value::Nil);
        }
    }

    // ---- Chunk loading ----

    /// Compile source (or load a binary chunk) into a callable closure
    /// whose environment is the globals table.
    pub fn load_chunk(&mut self, source: &[u8], name: &str) -> Result<Value, String> {
        if source.starts_with(crate::binary_chunk::SIGNATURE) {
            return self.load_binary_chunk(source, name);
        }
        let strings = std::mem::take(&mut self.strings);
        let (result, strings) = compiler::compile_with_strings(source, name, strings);
        self.strings = strings;
        let proto = result.map_err(|e| {
            format!("{}:{}: {}", format_source_name(name), e.line, e.message)
        })?;
        let proto_idx = self.register_proto(proto);
        let closure = self.heap.alloc_closure(proto_idx, Vec::new(), self.globals);
        Ok(Value::Closure(closure))
    }

    /// Load a precompiled chunk produced by the chunk writer.
    pub fn load_binary_chunk(&mut self, data: &[u8], name: &str) -> Result<Value, String> {
        let strings = std::mem::take(&mut self.strings);
        let (result, strings) = crate::binary_chunk::undump(data, name, strings);
        self.strings = strings;
        let proto = result?;
        let num_upvalues = proto.num_upvalues as usize;
        let proto_idx = self.register_proto(proto);
        // A loaded top-level chunk has no live enclosing frame; any
        // declared upvalues start out closed over nil.
        let upvals = (0..num_upvalues)
            .map(|_| self.heap.alloc_upval(UpValLocation::Closed(Value::Nil)))
            .collect();
        let closure = self.heap.alloc_closure(proto_idx, upvals, self.globals);
        Ok(Value::Closure(closure))
    }

    /// Flatten a prototype tree into the VM's proto list, returning the
    /// flat index of the root. Nested prototypes are reachable through
    /// `proto_children`.
    pub(crate) fn register_proto(&mut self, mut proto: Proto) -> usize {
        let children = std::mem::take(&mut proto.protos);
        let idx = self.protos.len();
        self.protos.push(proto);
        self.proto_children.push(Vec::new());
        let child_indices: Vec<usize> = children
            .into_iter()
            .map(|child| self.register_proto(child))
            .collect();
        self.proto_children[idx] = child_indices;
        idx
    }

    // ---- Embedding surface ----

    /// Call a value with arguments, expecting all results.
    pub fn call(&mut self, func: Value, args: &[Value]) -> Result<Vec<Value>, LuaError> {
        dispatch::call_function(self, func, args)
    }

    /// Protected call: errors come back as a Lua value instead of
    /// propagating.
    pub fn protected_call(&mut self, func: Value, args: &[Value]) -> Result<Vec<Value>, Value> {
        match dispatch::call_function(self, func, args) {
            Ok(results) => Ok(results),
            Err(e) => Err(e.into_value(&mut self.strings)),
        }
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        let key = self.strings.intern(name.as_bytes());
        self.heap
            .get_table_mut(self.globals)
            .raw_set_str(key, value);
    }

    pub fn get_global(&mut self, name: &str) -> Value {
        let key = self.strings.intern(name.as_bytes());
        self.heap.get_table(self.globals).raw_get_str(key)
    }

    pub fn new_table(&mut self) -> GcIdx<Table> {
        self.heap.alloc_table(0, 0)
    }

    /// Intern a Rust string as a Lua string value.
    pub fn new_string(&mut self, s: &str) -> Value {
        Value::String(self.strings.intern(s.as_bytes()))
    }

    // ---- Upvalues ----

    /// Find the open upvalue aliasing `stack_idx`, creating one if none
    /// exists yet. All closures capturing the same live slot share it.
    pub fn find_or_create_open_upval(&mut self, stack_idx: usize) -> GcIdx<UpVal> {
        for &(slot, uv) in &self.open_upvals {
            if slot == stack_idx {
                return uv;
            }
        }
        let uv = self.heap.alloc_upval(UpValLocation::Open(stack_idx));
        self.open_upvals.push((stack_idx, uv));
        uv
    }

    /// Close every open upvalue at or above `level`: copy the stack value
    /// out and switch the cell to owning it. The transition is one-way.
    pub fn close_upvalues(&mut self, level: usize) {
        let mut i = 0;
        while i < self.open_upvals.len() {
            let (slot, uv) = self.open_upvals[i];
            if slot >= level {
                let value = self.stack[slot];
                self.heap.get_upval_mut(uv).location = UpValLocation::Closed(value);
                self.open_upvals.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    pub fn get_upval_value(&self, uv: GcIdx<UpVal>) -> Value {
        let location = self.heap.get_upval(uv).location;
        match location {
            UpValLocation::Open(slot) => self.stack[slot],
            UpValLocation::OpenInThread(slot, thread_id) => self.thread_stack_get(thread_id, slot),
            UpValLocation::Closed(v) => v,
        }
    }

    pub fn set_upval_value(&mut self, uv: GcIdx<UpVal>, value: Value) {
        let location = self.heap.get_upval(uv).location;
        match location {
            UpValLocation::Open(slot) => self.stack[slot] = value,
            UpValLocation::OpenInThread(slot, thread_id) => {
                self.thread_stack_set(thread_id, slot, value)
            }
            UpValLocation::Closed(_) => {
                self.heap.get_upval_mut(uv).location = UpValLocation::Closed(value);
            }
        }
    }

    /// Read a slot of a suspended thread's stack.
    fn thread_stack_get(&self, thread_id: usize, slot: usize) -> Value {
        for saved in &self.caller_stack {
            if saved.id == thread_id {
                return saved.stack.get(slot).copied().unwrap_or(Value::Nil);
            }
        }
        if thread_id < self.threads.len() {
            return self.threads[thread_id]
                .stack
                .get(slot)
                .copied()
                .unwrap_or(Value::Nil);
        }
        Value::Nil
    }

    fn thread_stack_set(&mut self, thread_id: usize, slot: usize, value: Value) {
        for saved in &mut self.caller_stack {
            if saved.id == thread_id {
                if slot < saved.stack.len() {
                    saved.stack[slot] = value;
                }
                return;
            }
        }
        if thread_id < self.threads.len() && slot < self.threads[thread_id].stack.len() {
            self.threads[thread_id].stack[slot] = value;
        }
    }

    // ---- Coroutine state ----

    /// Create a coroutine over a function value. Its stack starts with
    /// the function at slot 0.
    pub fn create_thread(&mut self, func: Value) -> ThreadId {
        let id = self.threads.len();
        let mut thread = LuaThread::new(id);
        thread.stack[0] = func;
        self.threads.push(thread);
        ThreadId(id as u32)
    }

    /// Snapshot the running state for a thread switch.
    pub(crate) fn save_running_state(&mut self, id: usize, status: CoroutineStatus) -> LuaThread {
        // Open upvalues keep working while this stack is parked.
        for i in 0..self.open_upvals.len() {
            let (_, uv) = self.open_upvals[i];
            let location = self.heap.get_upval(uv).location;
            if let UpValLocation::Open(slot) = location {
                self.heap.get_upval_mut(uv).location = UpValLocation::OpenInThread(slot, id);
            }
        }
        LuaThread {
            stack: std::mem::take(&mut self.stack),
            call_stack: std::mem::take(&mut self.call_stack),
            stack_top: self.stack_top,
            open_upvals: std::mem::take(&mut self.open_upvals),
            status,
            id,
            started: true,
            resume_action: None,
        }
    }

    /// Install a saved thread state as the running one.
    pub(crate) fn restore_running_state(&mut self, thread: LuaThread) {
        self.stack = thread.stack;
        self.call_stack = thread.call_stack;
        self.stack_top = thread.stack_top;
        self.open_upvals = thread.open_upvals;
        if self.stack.is_empty() {
            self.stack.resize(64, Value::Nil);
        }
        // Reactivate this thread's parked upvalues.
        for i in 0..self.open_upvals.len() {
            let (_, uv) = self.open_upvals[i];
            let location = self.heap.get_upval(uv).location;
            if let UpValLocation::OpenInThread(slot, _) = location {
                self.heap.get_upval_mut(uv).location = UpValLocation::Open(slot);
            }
        }
    }

    /// Status of a thread as the coroutine library reports it.
    pub fn thread_status(&self, id: ThreadId) -> CoroutineStatus {
        self.threads[id.0 as usize].status
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a chunk name for error messages:
/// - `=name` reports `name` verbatim
/// - `@file` reports the file name
/// - anything else is a string chunk, reported as `[string "..."]`
pub fn format_source_name(name: &str) -> String {
    const ID_SIZE: usize = 60;
    if let Some(stripped) = name.strip_prefix('=') {
        stripped.chars().take(ID_SIZE - 1).collect()
    } else if let Some(stripped) = name.strip_prefix('@') {
        if stripped.len() >= ID_SIZE {
            let tail: String = stripped
                .chars()
                .rev()
                .take(ID_SIZE - 4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("...{tail}")
        } else {
            stripped.to_string()
        }
    } else {
        let first_line = name.lines().next().unwrap_or(name);
        let max_content = ID_SIZE - 15;
        if first_line.len() > max_content || name.contains('\n') {
            let truncated: String = first_line.chars().take(max_content).collect();
            format!("[string \"{truncated}...\"]")
        } else {
            format!("[string \"{first_line}\"]")
        }
    }
}
