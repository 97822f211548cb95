//! Lunet compiler: Lua 5.1 source to register bytecode, in one pass.

pub mod compiler;
pub mod disasm;
pub mod lexer;
pub mod opcode;
pub mod proto;
pub mod token;
