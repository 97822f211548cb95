//! Precompiled chunk writer/loader (the 5.1 fixed-layout format).
//!
//! A chunk is a 12-byte header followed by one recursively nested
//! function record. The loader only promises to read chunks this writer
//! produced: the header pins the size assumptions it checks.

use lunet_compiler::opcode::Instruction;
use lunet_compiler::proto::{Constant, LocalVar, Proto};
use lunet_core::string::{StringId, StringInterner};

/// Chunk signature: escape byte plus "Lua".
pub const SIGNATURE: &[u8] = b"\x1BLua";

const VERSION: u8 = 0x51;
const FORMAT: u8 = 0;
const LITTLE_ENDIAN: u8 = 1;
const INT_SIZE: u8 = 4;
const SIZET_SIZE: u8 = 8;
const INSTRUCTION_SIZE: u8 = 4;
const NUMBER_SIZE: u8 = 8;
const INTEGRAL_FLAG: u8 = 0;

const TAG_NIL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

// ---- Writer ----

/// Serialize a prototype tree into a binary chunk.
pub fn dump(proto: &Proto, strings: &StringInterner) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SIGNATURE);
    out.push(VERSION);
    out.push(FORMAT);
    out.push(LITTLE_ENDIAN);
    out.push(INT_SIZE);
    out.push(SIZET_SIZE);
    out.push(INSTRUCTION_SIZE);
    out.push(NUMBER_SIZE);
    out.push(INTEGRAL_FLAG);
    dump_function(&mut out, proto, strings);
    out
}

fn dump_function(out: &mut Vec<u8>, proto: &Proto, strings: &StringInterner) {
    dump_opt_string(out, proto.source, strings);
    dump_u32(out, proto.line_defined);
    dump_u32(out, proto.last_line_defined);
    out.push(proto.num_upvalues);
    out.push(proto.num_params);
    out.push(if proto.is_vararg { 2 } else { 0 });
    out.push(proto.max_stack_size);

    dump_u32(out, proto.code.len() as u32);
    for inst in &proto.code {
        dump_u32(out, inst.0);
    }

    dump_u32(out, proto.constants.len() as u32);
    for k in &proto.constants {
        match k {
            Constant::Nil => out.push(TAG_NIL),
            Constant::Boolean(b) => {
                out.push(TAG_BOOLEAN);
                out.push(*b as u8);
            }
            Constant::Number(n) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Constant::String(id) => {
                out.push(TAG_STRING);
                dump_string(out, strings.get_bytes(*id));
            }
        }
    }

    dump_u32(out, proto.protos.len() as u32);
    for child in &proto.protos {
        dump_function(out, child, strings);
    }

    // Debug tables: line info, local variables, upvalue names.
    dump_u32(out, proto.line_info.len() as u32);
    for line in &proto.line_info {
        dump_u32(out, *line);
    }
    dump_u32(out, proto.local_vars.len() as u32);
    for var in &proto.local_vars {
        dump_string(out, strings.get_bytes(var.name));
        dump_u32(out, var.start_pc);
        dump_u32(out, var.end_pc);
    }
    dump_u32(out, proto.upvalue_names.len() as u32);
    for name in &proto.upvalue_names {
        dump_string(out, strings.get_bytes(*name));
    }
}

fn dump_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn dump_opt_string(out: &mut Vec<u8>, id: Option<StringId>, strings: &StringInterner) {
    match id {
        Some(id) => dump_string(out, strings.get_bytes(id)),
        None => out.extend_from_slice(&0u64.to_le_bytes()),
    }
}

/// size_t length including the terminating NUL, then the bytes and NUL.
fn dump_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&((bytes.len() + 1) as u64).to_le_bytes());
    out.extend_from_slice(bytes);
    out.push(0);
}

// ---- Loader ----

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.data.len() {
            return Err("truncated precompiled chunk".to_string());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, String> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64, String> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Read a dumped string; empty means absent.
    fn read_string(&mut self, strings: &mut StringInterner) -> Result<Option<StringId>, String> {
        let len = self.read_u64()? as usize;
        if len == 0 {
            return Ok(None);
        }
        let bytes = self.take(len)?;
        // Drop the trailing NUL.
        Ok(Some(strings.intern(&bytes[..len - 1])))
    }
}

/// Load a binary chunk. The interner is returned even on failure.
pub fn undump(
    data: &[u8],
    chunk_name: &str,
    mut strings: StringInterner,
) -> (Result<Proto, String>, StringInterner) {
    let result = undump_inner(data, chunk_name, &mut strings);
    (result, strings)
}

fn undump_inner(
    data: &[u8],
    chunk_name: &str,
    strings: &mut StringInterner,
) -> Result<Proto, String> {
    let mut r = Reader { data, pos: 0 };
    if r.take(4)? != SIGNATURE {
        return Err("bad header in precompiled chunk".to_string());
    }
    if r.read_u8()? != VERSION {
        return Err("version mismatch in precompiled chunk".to_string());
    }
    let expected = [
        FORMAT,
        LITTLE_ENDIAN,
        INT_SIZE,
        SIZET_SIZE,
        INSTRUCTION_SIZE,
        NUMBER_SIZE,
        INTEGRAL_FLAG,
    ];
    for want in expected {
        if r.read_u8()? != want {
            return Err("incompatible precompiled chunk".to_string());
        }
    }
    let default_source = strings.intern(chunk_name.as_bytes());
    let proto = undump_function(&mut r, default_source, strings)?;
    if r.pos != data.len() {
        return Err("trailing garbage in precompiled chunk".to_string());
    }
    Ok(proto)
}

fn undump_function(
    r: &mut Reader,
    default_source: StringId,
    strings: &mut StringInterner,
) -> Result<Proto, String> {
    let source = r.read_string(strings)?.unwrap_or(default_source);
    let mut proto = Proto::new(Some(source));
    proto.line_defined = r.read_u32()?;
    proto.last_line_defined = r.read_u32()?;
    proto.num_upvalues = r.read_u8()?;
    proto.num_params = r.read_u8()?;
    proto.is_vararg = r.read_u8()? != 0;
    proto.max_stack_size = r.read_u8()?;

    let ncode = r.read_u32()? as usize;
    proto.code.reserve(ncode);
    for _ in 0..ncode {
        proto.code.push(Instruction(r.read_u32()?));
    }

    let nconstants = r.read_u32()? as usize;
    for _ in 0..nconstants {
        let k = match r.read_u8()? {
            TAG_NIL => Constant::Nil,
            TAG_BOOLEAN => Constant::Boolean(r.read_u8()? != 0),
            TAG_NUMBER => Constant::Number(r.read_f64()?),
            TAG_STRING => {
                let id = r
                    .read_string(strings)?
                    .unwrap_or_else(|| strings.intern(b""));
                Constant::String(id)
            }
            _ => return Err("bad constant tag in precompiled chunk".to_string()),
        };
        proto.constants.push(k);
    }

    let nprotos = r.read_u32()? as usize;
    for _ in 0..nprotos {
        proto.protos.push(undump_function(r, source, strings)?);
    }

    let nlines = r.read_u32()? as usize;
    for _ in 0..nlines {
        proto.line_info.push(r.read_u32()?);
    }
    let nlocals = r.read_u32()? as usize;
    for _ in 0..nlocals {
        let name = r
            .read_string(strings)?
            .unwrap_or_else(|| strings.intern(b""));
        proto.local_vars.push(LocalVar {
            name,
            start_pc: r.read_u32()?,
            end_pc: r.read_u32()?,
        });
    }
    let nupnames = r.read_u32()? as usize;
    for _ in 0..nupnames {
        let name = r
            .read_string(strings)?
            .unwrap_or_else(|| strings.intern(b""));
        proto.upvalue_names.push(name);
    }
    Ok(proto)
}
