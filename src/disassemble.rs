// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2025 Tobias Sarnowski <tobias@sarnowski.cloud>

//! Bytecode disassembler, test-support only.
//!
//! Not reachable from the CLI or the public API — the language's
//! tracing/disassembly surface is explicitly out of scope for end
//! users. This exists so the compiler's jump-patching and the VM's
//! opcode operand widths can be asserted against a human-readable
//! listing instead of raw byte offsets.

use crate::chunk::{Chunk, OpCode};

/// Render every instruction in `chunk` as one line, `name` labeling the
/// listing (mirrors clox's `disassembleChunk`).
#[must_use]
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }
    out
}

fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    use std::fmt::Write as _;

    let _ = write!(out, "{offset:04} ");
    let line = chunk.line_at(offset);
    if offset > 0 && line == chunk.line_at(offset - 1) {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{line:4} ");
    }

    let op = OpCode::from_u8(chunk.code[offset]);
    match op {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, offset, out),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset, out),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset, out),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset, out),
        OpCode::DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset, out),
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset, out),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset, out),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset, out),
        OpCode::GetProperty => constant_instruction("OP_GET_PROPERTY", chunk, offset, out),
        OpCode::SetProperty => constant_instruction("OP_SET_PROPERTY", chunk, offset, out),
        OpCode::GetSuper => constant_instruction("OP_GET_SUPER", chunk, offset, out),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset, out),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset, out),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset, out),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset, out),
        OpCode::Invoke => invoke_instruction("OP_INVOKE", chunk, offset, out),
        OpCode::SuperInvoke => invoke_instruction("OP_SUPER_INVOKE", chunk, offset, out),
        OpCode::Closure => closure_instruction(chunk, offset, out),
        OpCode::Class => constant_instruction("OP_CLASS", chunk, offset, out),
        OpCode::Method => constant_instruction("OP_METHOD", chunk, offset, out),
        simple => simple_instruction(simple_name(simple), offset, out),
    }
}

fn simple_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Nil => "OP_NIL",
        OpCode::True => "OP_TRUE",
        OpCode::False => "OP_FALSE",
        OpCode::Pop => "OP_POP",
        OpCode::Equal => "OP_EQUAL",
        OpCode::Greater => "OP_GREATER",
        OpCode::Less => "OP_LESS",
        OpCode::Add => "OP_ADD",
        OpCode::Subtract => "OP_SUBTRACT",
        OpCode::Multiply => "OP_MULTIPLY",
        OpCode::Divide => "OP_DIVIDE",
        OpCode::Not => "OP_NOT",
        OpCode::Negate => "OP_NEGATE",
        OpCode::Print => "OP_PRINT",
        OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
        OpCode::Return => "OP_RETURN",
        OpCode::Inherit => "OP_INHERIT",
        _ => "OP_UNKNOWN",
    }
}

fn simple_instruction(name: &str, offset: usize, out: &mut String) -> usize {
    out.push_str(name);
    out.push('\n');
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    use std::fmt::Write as _;
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{name:<16} {slot:4}");
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    use std::fmt::Write as _;
    let hi = u16::from(chunk.code[offset + 1]);
    let lo = u16::from(chunk.code[offset + 2]);
    let jump = (hi << 8) | lo;
    let target = offset as i64 + 3 + i64::from(sign) * i64::from(jump);
    let _ = writeln!(out, "{name:<16} {offset:4} -> {target}");
    offset + 3
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    use std::fmt::Write as _;
    let idx = chunk.code[offset + 1];
    let value = &chunk.constants[idx as usize];
    let _ = writeln!(out, "{name:<16} {idx:4} '{value}'");
    offset + 2
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    use std::fmt::Write as _;
    let idx = chunk.code[offset + 1];
    let argc = chunk.code[offset + 2];
    let value = &chunk.constants[idx as usize];
    let _ = writeln!(out, "{name:<16} ({argc} args) {idx:4} '{value}'");
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    use std::fmt::Write as _;
    let mut cursor = offset + 1;
    let idx = chunk.code[cursor];
    cursor += 1;
    let value = &chunk.constants[idx as usize];
    let _ = writeln!(out, "OP_CLOSURE        {idx:4} '{value}'");

    let Some(function) = value.as_obj().and_then(|r| r.get().as_function()) else {
        return cursor;
    };
    for _ in 0..function.upvalue_count {
        let is_local = chunk.code[cursor];
        let index = chunk.code[cursor + 1];
        cursor += 2;
        let kind = if is_local != 0 { "local" } else { "upvalue" };
        let _ = writeln!(out, "{cursor:04}      |                     {kind} {index}");
    }
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    #[test]
    fn disassembles_a_simple_return() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);
        let listing = disassemble_chunk(&chunk, "test");
        assert!(listing.contains("OP_NIL"));
        assert!(listing.contains("OP_RETURN"));
    }

    #[test]
    fn disassembles_a_constant_with_its_value() {
        let mut heap = Heap::new();
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(crate::value::Value::Number(3.0)).expect("room for one constant");
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(idx, 1);
        let listing = disassemble_chunk(&chunk, "test");
        assert!(listing.contains("OP_CONSTANT"));
        assert!(listing.contains('3'));
        let _ = heap.intern("unused");
    }
}
