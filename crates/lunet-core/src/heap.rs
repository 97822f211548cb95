//! Object heap with arena-based allocation and typed indices.
//!
//! Tables, closures, native functions, userdata, and upvalues live in
//! per-type arenas; values reference them through `GcIdx<T>` handles. The
//! heap is freed as a whole with the VM that owns it.

use crate::string::StringInterner;
use crate::table::Table;
use crate::value::Value;
use std::any::Any;
use std::marker::PhantomData;

/// A typed index into an arena in the Heap.
#[derive(Debug)]
pub struct GcIdx<T>(pub u32, pub PhantomData<T>);

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> GcIdx<T> {
    pub fn new(raw: u32) -> Self {
        GcIdx(raw, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// A compiled Lua closure: a prototype bound to upvalues and an
/// environment table. The prototype itself is owned by the VM and
/// referenced by index.
#[derive(Debug)]
pub struct LuaClosure {
    /// Index of the prototype in the VM's flattened proto list.
    pub proto_idx: usize,
    /// Upvalue handles, one per upvalue the prototype declares.
    pub upvalues: Vec<GcIdx<UpVal>>,
    /// Environment table used to resolve global accesses.
    pub env: GcIdx<Table>,
}

/// Error reported by a native callback.
#[derive(Debug)]
pub enum NativeError {
    /// Plain message; the VM prefixes position information.
    Message(String),
    /// An arbitrary Lua error value (from `error(v)`).
    Value(Value),
}

/// Signature of a native (Rust) function callable from Lua.
pub type NativeFn = fn(&mut NativeContext) -> Result<Vec<Value>, NativeError>;

/// A native function callable from Lua.
pub struct NativeFunction {
    pub func: NativeFn,
    pub name: &'static str,
}

/// Context passed to native functions: positional arguments plus the
/// heap and interner they may allocate into.
pub struct NativeContext<'a> {
    pub args: &'a [Value],
    pub heap: &'a mut Heap,
    pub strings: &'a mut StringInterner,
}

impl NativeContext<'_> {
    /// Argument by 1-based position, nil when absent.
    pub fn arg(&self, n: usize) -> Value {
        debug_assert!(n >= 1);
        self.args.get(n - 1).copied().unwrap_or(Value::Nil)
    }

    /// Raise a "bad argument" error in the standard format.
    pub fn bad_arg(&self, n: usize, func: &str, expected: &str) -> NativeError {
        let got = self.arg(n).type_name();
        NativeError::Message(format!(
            "bad argument #{n} to '{func}' ({expected} expected, got {got})"
        ))
    }
}

/// Opaque host payload with an optional metatable.
pub struct Userdata {
    pub data: Box<dyn Any>,
    pub metatable: Option<GcIdx<Table>>,
}

/// An upvalue: a reference cell shared between closures and, while open,
/// the owning stack frame.
#[derive(Debug)]
pub struct UpVal {
    pub location: UpValLocation,
}

/// Where an upvalue's value lives. The open→closed transition happens
/// once, when the frame that owns the slot returns.
#[derive(Clone, Copy, Debug)]
pub enum UpValLocation {
    /// Aliases a live slot of the running thread's stack.
    Open(usize),
    /// Aliases a slot of a suspended thread's stack (set while that
    /// thread's state is swapped out during a coroutine switch).
    OpenInThread(usize, usize),
    /// Owns an independent copy.
    Closed(Value),
}

/// Arena-based object heap.
#[derive(Default)]
pub struct Heap {
    tables: Vec<Table>,
    closures: Vec<LuaClosure>,
    natives: Vec<NativeFunction>,
    userdata: Vec<Userdata>,
    upvals: Vec<UpVal>,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    pub fn alloc_table(&mut self, array_hint: usize, hash_hint: usize) -> GcIdx<Table> {
        let idx = self.tables.len() as u32;
        self.tables.push(Table::new(array_hint, hash_hint));
        GcIdx::new(idx)
    }

    pub fn get_table(&self, idx: GcIdx<Table>) -> &Table {
        &self.tables[idx.0 as usize]
    }

    pub fn get_table_mut(&mut self, idx: GcIdx<Table>) -> &mut Table {
        &mut self.tables[idx.0 as usize]
    }

    pub fn alloc_closure(
        &mut self,
        proto_idx: usize,
        upvalues: Vec<GcIdx<UpVal>>,
        env: GcIdx<Table>,
    ) -> GcIdx<LuaClosure> {
        let idx = self.closures.len() as u32;
        self.closures.push(LuaClosure {
            proto_idx,
            upvalues,
            env,
        });
        GcIdx::new(idx)
    }

    pub fn get_closure(&self, idx: GcIdx<LuaClosure>) -> &LuaClosure {
        &self.closures[idx.0 as usize]
    }

    pub fn alloc_native(&mut self, func: NativeFn, name: &'static str) -> GcIdx<NativeFunction> {
        let idx = self.natives.len() as u32;
        self.natives.push(NativeFunction { func, name });
        GcIdx::new(idx)
    }

    pub fn get_native(&self, idx: GcIdx<NativeFunction>) -> &NativeFunction {
        &self.natives[idx.0 as usize]
    }

    pub fn alloc_userdata(
        &mut self,
        data: Box<dyn Any>,
        metatable: Option<GcIdx<Table>>,
    ) -> GcIdx<Userdata> {
        let idx = self.userdata.len() as u32;
        self.userdata.push(Userdata { data, metatable });
        GcIdx::new(idx)
    }

    pub fn get_userdata(&self, idx: GcIdx<Userdata>) -> &Userdata {
        &self.userdata[idx.0 as usize]
    }

    pub fn get_userdata_mut(&mut self, idx: GcIdx<Userdata>) -> &mut Userdata {
        &mut self.userdata[idx.0 as usize]
    }

    pub fn alloc_upval(&mut self, location: UpValLocation) -> GcIdx<UpVal> {
        let idx = self.upvals.len() as u32;
        self.upvals.push(UpVal { location });
        GcIdx::new(idx)
    }

    pub fn get_upval(&self, idx: GcIdx<UpVal>) -> &UpVal {
        &self.upvals[idx.0 as usize]
    }

    pub fn get_upval_mut(&mut self, idx: GcIdx<UpVal>) -> &mut UpVal {
        &mut self.upvals[idx.0 as usize]
    }

    /// Iterate over every upvalue cell (used when remapping open upvalues
    /// during coroutine switches).
    pub fn upvals_mut(&mut self) -> impl Iterator<Item = &mut UpVal> {
        self.upvals.iter_mut()
    }
}
