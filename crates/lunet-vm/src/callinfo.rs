//! Call frame information for the VM.

use lunet_core::heap::{GcIdx, LuaClosure};

/// One active or suspended call. Tail calls overwrite the frame in place
/// instead of pushing a new one.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Stack base of this frame's register window.
    pub base: usize,
    /// Program counter (index into the proto's code).
    pub pc: usize,
    /// Results the caller wants (-1 = as many as produced).
    pub num_results: i32,
    /// Index into the VM's flattened proto list.
    pub proto_idx: usize,
    /// The closure being executed.
    pub closure_idx: Option<GcIdx<LuaClosure>>,
    /// Stack position of the called value (where results land).
    pub func_stack_idx: usize,
    /// Start of the raw argument area for vararg functions (the fixed
    /// parameters were relocated above it).
    pub vararg_base: Option<usize>,
}

impl CallInfo {
    pub fn new(base: usize, proto_idx: usize) -> Self {
        CallInfo {
            base,
            pc: 0,
            num_results: -1,
            proto_idx,
            closure_idx: None,
            func_stack_idx: 0,
            vararg_base: None,
        }
    }
}
