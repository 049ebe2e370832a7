//! Per-instruction execution trace
//!
//! When `Vm::trace_execution` is set, the dispatcher prints the stack
//! slice and the decoded instruction it is about to execute, one line per
//! step, to stderr. Tracing reads VM state and never mutates it.

use swiftlang_core::{Chunk, OpCode};

use crate::vm::Vm;

/// Decode the instruction at `offset` into its trace form. Returns the
/// rendered text and the offset of the next instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let Some(byte) = chunk.byte_at(offset) else {
        return (format!("{:04} <end>", offset), offset + 1);
    };
    let Some(op) = OpCode::from_byte(byte) else {
        return (format!("{:04} <bad opcode {}>", offset, byte), offset + 1);
    };
    let line = chunk.line_at(offset);
    let head = format!("{:04} {:>4} {}", offset, line, op.name());
    match op {
        // One-byte operand: constant index, slot, count or proto kind.
        OpCode::Constant
        | OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::DefineGlobal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::ObjectLiteral
        | OpCode::BuildArray
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetField
        | OpCode::SetField
        | OpCode::CreateStruct
        | OpCode::GetObjectProto
        | OpCode::GetStructProto
        | OpCode::LoadModule
        | OpCode::ImportFrom
        | OpCode::ModuleExport
        | OpCode::StringInterp => {
            let operand = chunk.byte_at(offset + 1).unwrap_or(0);
            (format!("{} {}", head, operand), offset + 2)
        }
        // Two one-byte operands.
        OpCode::MethodCall => {
            let argc = chunk.byte_at(offset + 1).unwrap_or(0);
            let name = chunk.byte_at(offset + 2).unwrap_or(0);
            (format!("{} argc={} name={}", head, argc, name), offset + 3)
        }
        // 16-bit operand.
        OpCode::ConstantLong => {
            let operand = chunk.read_u16(offset + 1);
            (format!("{} {}", head, operand), offset + 3)
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            let distance = chunk.read_u16(offset + 1) as usize;
            let target = offset + 3 + distance;
            (format!("{} -> {:04}", head, target), offset + 3)
        }
        OpCode::Loop => {
            let distance = chunk.read_u16(offset + 1) as usize;
            let target = (offset + 3).saturating_sub(distance);
            (format!("{} -> {:04}", head, target), offset + 3)
        }
        // Capture metadata follows the function index; its length lives on
        // the function object, which the trace does not resolve, so the
        // next offset stops after the index.
        OpCode::Closure => {
            let index = chunk.byte_at(offset + 1).unwrap_or(0);
            (format!("{} fn={}", head, index), offset + 2)
        }
        OpCode::ClosureLong => {
            let index = chunk.read_u16(offset + 1);
            (format!("{} fn={}", head, index), offset + 3)
        }
        OpCode::DefineStruct => {
            let name = chunk.byte_at(offset + 1).unwrap_or(0);
            let fields = chunk.byte_at(offset + 2).unwrap_or(0);
            (
                format!("{} name={} fields={}", head, name, fields),
                offset + 3 + fields as usize,
            )
        }
        // No operands.
        _ => (head, offset + 1),
    }
}

impl Vm {
    /// Print the stack slice and the instruction about to execute.
    pub(crate) fn trace_instruction(&self) {
        let Some(frame) = self.frames.last() else {
            return;
        };
        let mut stack_line = String::from("          ");
        for value in &self.stack {
            stack_line.push_str(&format!("[ {} ]", self.to_display_string(*value)));
        }
        eprintln!("{}", stack_line);
        let (text, _) = disassemble_instruction(&frame.chunk, frame.ip);
        eprintln!("{}", text);
    }
}
