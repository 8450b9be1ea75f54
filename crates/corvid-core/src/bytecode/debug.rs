//! Bytecode disassembler for debugging

use std::fmt::Write;

use super::chunk::{Chunk, Proto};
use super::opcode::OpCode;

/// Disassemble every prototype in a chunk, main function last
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut output = String::new();
    writeln!(output, "== {name} ({} functions) ==", chunk.protos.len()).unwrap();
    for index in 0..chunk.protos.len() {
        output.push('\n');
        output.push_str(&disassemble_proto(chunk, index));
    }
    output
}

/// Disassemble one prototype with its header and constant pool
pub fn disassemble_proto(chunk: &Chunk, index: usize) -> String {
    let mut output = String::new();
    let Some(proto) = chunk.protos.get(index) else {
        writeln!(output, "<invalid prototype {index}>").unwrap();
        return output;
    };

    let name = match (&proto.name, index as u32 == chunk.main) {
        (_, true) => "main".to_string(),
        (Some(name), false) => name.clone(),
        (None, false) => "<anonymous>".to_string(),
    };
    writeln!(
        output,
        "function {name} #{index} (line {}, {} params{}, {} upvalues, {} slots)",
        proto.line_defined,
        proto.num_params,
        if proto.is_vararg { " + ..." } else { "" },
        proto.num_upvalues,
        proto.max_stack
    )
    .unwrap();

    if !proto.constants().is_empty() {
        writeln!(output, "constants:").unwrap();
        for (i, constant) in proto.constants().iter().enumerate() {
            writeln!(output, "  [{i}] {constant}").unwrap();
        }
    }

    let mut offset = 0;
    while offset < proto.len() {
        offset = disassemble_instruction(chunk, proto, offset, &mut output);
    }
    output
}

/// Disassemble a single instruction to `output`, returning the next offset
pub fn disassemble_instruction(chunk: &Chunk, proto: &Proto, offset: usize, output: &mut String) -> usize {
    write!(output, "{offset:04} ").unwrap();

    // Line number, or | when unchanged
    match proto.line_at(offset) {
        Some(line) if offset > 0 && proto.line_at(offset - 1) == Some(line) => {
            write!(output, "   | ").unwrap();
        }
        Some(line) => write!(output, "{line:4} ").unwrap(),
        None => write!(output, "   ? ").unwrap(),
    }

    let Some(byte) = proto.read_byte(offset) else {
        writeln!(output, "Invalid offset").unwrap();
        return offset + 1;
    };
    let Ok(opcode) = OpCode::try_from(byte) else {
        writeln!(output, "Unknown opcode {byte}").unwrap();
        return offset + 1;
    };

    let u8_at = |i: usize| proto.read_byte(offset + i).unwrap_or(0);
    let u16_at = |i: usize| proto.read_u16(offset + i).unwrap_or(0);
    let jump_target = |size: usize| {
        let distance = proto.read_i16(offset + size - 2).unwrap_or(0);
        (offset + size) as isize + distance as isize
    };
    let name = opcode.name();

    match opcode {
        OpCode::Const
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::GetField
        | OpCode::SetField
        | OpCode::InitField
        | OpCode::SelfOp => {
            let index = u16_at(1);
            let constant = proto
                .constant(index)
                .map_or_else(|| "<invalid>".to_string(), ToString::to_string);
            writeln!(output, "{name:16} {index:4} {constant}").unwrap();
        }

        OpCode::PopN
        | OpCode::Pick
        | OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Close
        | OpCode::Concat
        | OpCode::ForInPrep => {
            writeln!(output, "{name:16} {}", u8_at(1)).unwrap();
        }

        OpCode::VarArg => {
            let count = u8_at(1);
            if count == super::MULTI {
                writeln!(output, "{name:16} all").unwrap();
            } else {
                writeln!(output, "{name:16} {count}").unwrap();
            }
        }

        OpCode::NewTable => {
            writeln!(output, "{name:16} array {} hash {}", u16_at(1), u16_at(3)).unwrap();
        }

        OpCode::SetList => {
            let start = proto.read_u32(offset + 3).unwrap_or(0);
            let multi = if u8_at(2) != 0 { " + multi" } else { "" };
            writeln!(output, "{name:16} {}{multi} at {start}", u8_at(1)).unwrap();
        }

        OpCode::Call => {
            let multi = if u8_at(2) != 0 { " + multi" } else { "" };
            let results = match u8_at(3) {
                super::MULTI => "all".to_string(),
                n => n.to_string(),
            };
            writeln!(output, "{name:16} args {}{multi} results {results}", u8_at(1)).unwrap();
        }

        OpCode::Return => {
            let multi = if u8_at(2) != 0 { " + multi" } else { "" };
            writeln!(output, "{name:16} {}{multi}", u8_at(1)).unwrap();
        }

        OpCode::ForInCall => {
            writeln!(output, "{name:16} base {} vars {}", u8_at(1), u8_at(2)).unwrap();
        }

        OpCode::Jump
        | OpCode::JumpIfFalse
        | OpCode::JumpIfTrue
        | OpCode::JumpIfFalseOrPop
        | OpCode::JumpIfTrueOrPop => {
            writeln!(output, "{name:16} -> {:04}", jump_target(3)).unwrap();
        }

        OpCode::ForPrep | OpCode::ForLoop => {
            writeln!(output, "{name:16} base {} -> {:04}", u8_at(1), jump_target(4)).unwrap();
        }

        OpCode::ForInLoop => {
            writeln!(
                output,
                "{name:16} base {} vars {} -> {:04}",
                u8_at(1),
                u8_at(2),
                jump_target(5)
            )
            .unwrap();
        }

        OpCode::Closure => {
            let child = u16_at(1);
            let captures = proto
                .children
                .get(child as usize)
                .and_then(|&index| chunk.protos.get(index as usize))
                .map_or(0, |p| p.num_upvalues as usize);
            writeln!(output, "{name:16} {child:4}").unwrap();
            for i in 0..captures {
                let is_local = u8_at(3 + i * 2) != 0;
                let index = u8_at(4 + i * 2);
                let kind = if is_local { "local" } else { "upvalue" };
                writeln!(output, "{:04}    |   {kind} {index}", offset + 3 + i * 2).unwrap();
            }
            return offset + opcode.size() + captures * 2;
        }

        _ => writeln!(output, "{name}").unwrap(),
    }

    offset + opcode.size()
}
