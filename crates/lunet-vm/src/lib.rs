//! Lunet virtual machine: the bytecode interpreter, call protocol, and
//! coroutine scheduler.

pub mod arith;
pub mod binary_chunk;
pub mod callinfo;
pub mod coerce;
pub mod compare;
pub mod dispatch;
pub mod error;
pub mod metamethod;
pub mod vm;

use error::LuaError;
use lunet_core::value::Value;
use vm::Vm;

/// Compile and execute Lua source, returning the chunk's results.
pub fn execute_source(source: &str) -> Result<Vec<Value>, LuaError> {
    let mut vm = Vm::new();
    let chunk = vm
        .load_chunk(source.as_bytes(), "=input")
        .map_err(LuaError::Runtime)?;
    dispatch::call_function(&mut vm, chunk, &[])
}
