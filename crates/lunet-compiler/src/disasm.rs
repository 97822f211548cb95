/// Bytecode disassembler (luac -l style output).
use crate::opcode::{rk_constant_index, rk_is_constant, Instruction, InstructionFormat, OpCode};
use crate::proto::{Constant, Proto};
use lunet_core::number::number_to_display;
use lunet_core::string::StringInterner;
use std::fmt::Write;

/// Disassemble a complete Proto into a human-readable string.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, strings, 0);
    out
}

fn disassemble_proto(out: &mut String, proto: &Proto, strings: &StringInterner, level: usize) {
    let indent = "  ".repeat(level);

    let vararg = if proto.is_vararg { "+" } else { "" };
    writeln!(
        out,
        "{indent}function ({}{vararg} params, {} slots, {} upvalues, {} constants, {} functions)",
        proto.num_params,
        proto.max_stack_size,
        proto.num_upvalues,
        proto.constants.len(),
        proto.protos.len(),
    )
    .unwrap();

    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.get_line(pc);
        let line_str = if line > 0 {
            format!("[{line}]")
        } else {
            "[-]".to_string()
        };
        write!(out, "{indent}\t{}\t{:>5}\t", pc + 1, line_str).unwrap();
        disasm_instruction(out, inst, proto, strings);
        writeln!(out).unwrap();
    }

    if !proto.constants.is_empty() {
        writeln!(out, "{indent}constants ({}):", proto.constants.len()).unwrap();
        for (i, k) in proto.constants.iter().enumerate() {
            write!(out, "{indent}\t{}\t", i).unwrap();
            format_constant(out, k, strings);
            writeln!(out).unwrap();
        }
    }

    if !proto.upvalue_names.is_empty() {
        writeln!(out, "{indent}upvalues ({}):", proto.upvalue_names.len()).unwrap();
        for (i, name) in proto.upvalue_names.iter().enumerate() {
            writeln!(out, "{indent}\t{}\t{}", i, strings.get_str_lossy(*name)).unwrap();
        }
    }

    for (i, p) in proto.protos.iter().enumerate() {
        writeln!(out, "{indent}function [{i}]:").unwrap();
        disassemble_proto(out, p, strings, level + 1);
    }
}

/// Disassemble a single instruction into the output string.
pub fn disasm_instruction(
    out: &mut String,
    inst: &Instruction,
    proto: &Proto,
    strings: &StringInterner,
) {
    let op = inst.opcode();
    write!(out, "{:<12}", op.name()).unwrap();

    match op.format() {
        InstructionFormat::IABC => {
            write!(out, "{} {} {}", inst.a(), inst.b(), inst.c()).unwrap();
            // Show RK constants for the operand positions that take them.
            let mut shown = false;
            for rk in [inst.b(), inst.c()] {
                if rk_is_constant(rk) {
                    if let Some(k) = proto.constants.get(rk_constant_index(rk)) {
                        write!(out, "{}", if shown { " " } else { "\t; " }).unwrap();
                        format_constant(out, k, strings);
                        shown = true;
                    }
                }
            }
        }
        InstructionFormat::IABx => {
            write!(out, "{} {}", inst.a(), inst.bx()).unwrap();
            match op {
                OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal => {
                    if let Some(k) = proto.constants.get(inst.bx() as usize) {
                        write!(out, "\t; ").unwrap();
                        format_constant(out, k, strings);
                    }
                }
                OpCode::Closure => {
                    write!(out, "\t; function [{}]", inst.bx()).unwrap();
                }
                _ => {}
            }
        }
        InstructionFormat::IAsBx => {
            write!(out, "{} {}", inst.a(), inst.sbx()).unwrap();
        }
    }
}

fn format_constant(out: &mut String, k: &Constant, strings: &StringInterner) {
    match k {
        Constant::Nil => write!(out, "nil").unwrap(),
        Constant::Boolean(b) => write!(out, "{b}").unwrap(),
        Constant::Number(n) => write!(out, "{}", number_to_display(*n)).unwrap(),
        Constant::String(id) => {
            let bytes = strings.get_bytes(*id);
            if let Ok(s) = std::str::from_utf8(bytes) {
                write!(out, "\"{s}\"").unwrap();
            } else {
                write!(out, "<binary string>").unwrap();
            }
        }
    }
}
