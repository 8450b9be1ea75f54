//! Binary chunk format
//!
//! Layout (integers are LEB128 varints unless noted):
//!
//! ```text
//! u8      version
//! u8      vector size
//! strings count, then (length, bytes) each
//! protos  count, then each prototype, children first
//! main    prototype index
//! ```
//!
//! Strings referenced from prototypes are indices into the string table; an
//! optional name is stored as index + 1 with 0 meaning absent. Decoding
//! validates every index, opcode and operand before handing out a [`Chunk`].

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::chunk::{Chunk, DebugInfo, LocalVar, Proto};
use super::constant::Constant;
use super::opcode::OpCode;

/// Current format version
pub const BYTECODE_VERSION: u8 = 3;

const TAG_NIL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bytecode version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: u8, found: u8 },
    #[error("truncated chunk")]
    Truncated,
    #[error("vector size mismatch: chunk uses {0}")]
    VectorSize(u8),
    #[error("varint overflow")]
    VarintOverflow,
    #[error("invalid string index {0}")]
    BadString(u64),
    #[error("invalid constant tag {0}")]
    BadConstantTag(u8),
    #[error("invalid prototype index {0}")]
    BadProto(u64),
    #[error("invalid opcode {opcode} at offset {offset}")]
    BadOpcode { opcode: u8, offset: usize },
    #[error("malformed instruction at offset {0}")]
    BadInstruction(usize),
    #[error("trailing bytes after chunk")]
    TrailingBytes,
}

// ==================== Encoding ====================

#[derive(Default)]
struct StringTable {
    strings: Vec<Vec<u8>>,
    index: FxHashMap<Vec<u8>, u32>,
}

impl StringTable {
    fn intern(&mut self, s: &[u8]) -> u32 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        self.strings.push(s.to_vec());
        self.index.insert(s.to_vec(), i);
        i
    }

    fn get(&self, s: &[u8]) -> u32 {
        self.index.get(s).copied().unwrap_or(0)
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

impl Chunk {
    /// Serialize to the binary chunk format. Output is deterministic.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut table = StringTable::default();
        for proto in &self.protos {
            for constant in proto.constants() {
                if let Constant::String(s) = constant {
                    table.intern(s);
                }
            }
            if let Some(name) = &proto.name {
                table.intern(name.as_bytes());
            }
            if let Some(debug) = &proto.debug {
                for local in &debug.locals {
                    table.intern(local.name.as_bytes());
                }
                for name in &debug.upvalue_names {
                    table.intern(name.as_bytes());
                }
            }
        }

        let mut out = vec![BYTECODE_VERSION, self.vector_size];
        write_varint(&mut out, table.strings.len() as u64);
        for s in &table.strings {
            write_varint(&mut out, s.len() as u64);
            out.extend_from_slice(s);
        }

        write_varint(&mut out, self.protos.len() as u64);
        for proto in &self.protos {
            encode_proto(&mut out, proto, &table);
        }
        write_varint(&mut out, u64::from(self.main));
        out
    }

    /// Decode and validate a binary chunk
    pub fn from_bytes(bytes: &[u8]) -> Result<Chunk, DecodeError> {
        let mut reader = Reader { bytes, pos: 0 };
        let version = reader.u8()?;
        if version != BYTECODE_VERSION {
            return Err(DecodeError::VersionMismatch {
                expected: BYTECODE_VERSION,
                found: version,
            });
        }
        let vector_size = reader.u8()?;
        if vector_size != super::options::VECTOR_SIZE {
            return Err(DecodeError::VectorSize(vector_size));
        }

        let string_count = reader.count()?;
        let mut strings = Vec::with_capacity(string_count.min(4096));
        for _ in 0..string_count {
            let len = reader.count()?;
            strings.push(reader.bytes(len)?.to_vec());
        }

        let proto_count = reader.count()?;
        let mut protos = Vec::with_capacity(proto_count.min(4096));
        for index in 0..proto_count {
            protos.push(decode_proto(&mut reader, &strings, index)?);
        }

        let main = reader.varint()?;
        if main >= protos.len() as u64 {
            return Err(DecodeError::BadProto(main));
        }
        if reader.pos != bytes.len() {
            return Err(DecodeError::TrailingBytes);
        }

        let chunk = Chunk {
            vector_size,
            protos,
            main: main as u32,
        };
        for proto in &chunk.protos {
            verify_code(proto, &chunk.protos)?;
        }
        Ok(chunk)
    }
}

fn encode_proto(out: &mut Vec<u8>, proto: &Proto, table: &StringTable) {
    out.push(proto.num_params);
    out.push(u8::from(proto.is_vararg));
    out.push(proto.num_upvalues);
    out.push(proto.max_stack);

    write_varint(out, proto.constants().len() as u64);
    for constant in proto.constants() {
        match constant {
            Constant::Nil => out.push(TAG_NIL),
            Constant::Boolean(false) => out.push(TAG_FALSE),
            Constant::Boolean(true) => out.push(TAG_TRUE),
            Constant::Number(n) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Constant::String(s) => {
                out.push(TAG_STRING);
                write_varint(out, u64::from(table.get(s)) + 1);
            }
        }
    }

    write_varint(out, proto.code().len() as u64);
    out.extend_from_slice(proto.code());

    write_varint(out, proto.children.len() as u64);
    for &child in &proto.children {
        write_varint(out, u64::from(child));
    }

    let name = proto
        .name
        .as_ref()
        .map_or(0, |n| u64::from(table.get(n.as_bytes())) + 1);
    write_varint(out, name);
    write_varint(out, u64::from(proto.line_defined));

    let runs = proto.line_runs();
    out.push(u8::from(!runs.is_empty()));
    if !runs.is_empty() {
        write_varint(out, runs.len() as u64);
        for &(line, count) in runs {
            write_varint(out, u64::from(line));
            write_varint(out, u64::from(count));
        }
    }

    match &proto.debug {
        Some(debug) => {
            out.push(1);
            write_varint(out, debug.locals.len() as u64);
            for local in &debug.locals {
                write_varint(out, u64::from(table.get(local.name.as_bytes())));
                write_varint(out, u64::from(local.start_pc));
                write_varint(out, u64::from(local.end_pc));
                out.push(local.slot);
            }
            write_varint(out, debug.upvalue_names.len() as u64);
            for name in &debug.upvalue_names {
                write_varint(out, u64::from(table.get(name.as_bytes())));
            }
        }
        None => out.push(0),
    }
}

// ==================== Decoding ====================

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::VarintOverflow)
    }

    /// A length that must fit in the remaining input
    fn count(&mut self) -> Result<usize, DecodeError> {
        let value = self.varint()?;
        if value > (self.bytes.len() - self.pos) as u64 * 8 + 8 {
            return Err(DecodeError::Truncated);
        }
        Ok(value as usize)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        u32::try_from(self.varint()?).map_err(|_| DecodeError::VarintOverflow)
    }

    fn string(&mut self, strings: &[Vec<u8>]) -> Result<String, DecodeError> {
        let index = self.varint()?;
        let bytes = strings
            .get(index as usize)
            .ok_or(DecodeError::BadString(index))?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

fn decode_proto(
    reader: &mut Reader<'_>,
    strings: &[Vec<u8>],
    index: usize,
) -> Result<Proto, DecodeError> {
    let num_params = reader.u8()?;
    let is_vararg = reader.u8()? != 0;
    let num_upvalues = reader.u8()?;
    let max_stack = reader.u8()?;

    let constant_count = reader.count()?;
    if constant_count > u16::MAX as usize + 1 {
        return Err(DecodeError::Truncated);
    }
    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        let constant = match reader.u8()? {
            TAG_NIL => Constant::Nil,
            TAG_FALSE => Constant::Boolean(false),
            TAG_TRUE => Constant::Boolean(true),
            TAG_NUMBER => {
                let bytes = reader.bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Constant::Number(f64::from_le_bytes(raw))
            }
            TAG_STRING => {
                let string_index = reader.varint()?;
                let bytes = string_index
                    .checked_sub(1)
                    .and_then(|i| strings.get(i as usize))
                    .ok_or(DecodeError::BadString(string_index))?;
                Constant::String(bytes.clone())
            }
            tag => return Err(DecodeError::BadConstantTag(tag)),
        };
        constants.push(constant);
    }

    let code_len = reader.count()?;
    let code = reader.bytes(code_len)?.to_vec();

    let child_count = reader.count()?;
    let mut children = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        let child = reader.varint()?;
        // Children precede their parents, which also rules out cycles
        if child >= index as u64 {
            return Err(DecodeError::BadProto(child));
        }
        children.push(child as u32);
    }

    let name_index = reader.varint()?;
    let name = match name_index {
        0 => None,
        n => Some(
            strings
                .get((n - 1) as usize)
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .ok_or(DecodeError::BadString(n))?,
        ),
    };
    let line_defined = reader.u32()?;

    let mut lines = Vec::new();
    if reader.u8()? != 0 {
        let runs = reader.count()?;
        for _ in 0..runs {
            let line = reader.u32()?;
            let count = reader.u32()?;
            lines.push((line, count));
        }
    }

    let debug = if reader.u8()? != 0 {
        let local_count = reader.count()?;
        let mut locals = Vec::with_capacity(local_count);
        for _ in 0..local_count {
            let name = reader.string(strings)?;
            let start_pc = reader.u32()?;
            let end_pc = reader.u32()?;
            let slot = reader.u8()?;
            locals.push(LocalVar {
                name,
                start_pc,
                end_pc,
                slot,
            });
        }
        let upvalue_count = reader.count()?;
        let mut upvalue_names = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            upvalue_names.push(reader.string(strings)?);
        }
        Some(DebugInfo {
            locals,
            upvalue_names,
        })
    } else {
        None
    };

    let mut proto = Proto::from_parts(code, constants, lines);
    proto.num_params = num_params;
    proto.is_vararg = is_vararg;
    proto.num_upvalues = num_upvalues;
    proto.max_stack = max_stack;
    proto.children = children;
    proto.name = name;
    proto.line_defined = line_defined;
    proto.debug = debug;
    Ok(proto)
}

/// Check that every instruction decodes and every operand is in range
fn verify_code(proto: &Proto, protos: &[Proto]) -> Result<(), DecodeError> {
    let code = proto.code();
    let mut boundaries = vec![false; code.len() + 1];
    let mut jumps = Vec::new();
    let mut offset = 0;

    while offset < code.len() {
        boundaries[offset] = true;
        let byte = code[offset];
        let op = OpCode::try_from(byte).map_err(|opcode| DecodeError::BadOpcode { opcode, offset })?;
        let mut size = op.size();
        if offset + size > code.len() {
            return Err(DecodeError::BadInstruction(offset));
        }

        if op.uses_constant() {
            let index = proto.read_u16(offset + 1).unwrap_or(u16::MAX);
            match proto.constant(index) {
                Some(Constant::String(_)) => {}
                Some(_) if op == OpCode::Const => {}
                _ => return Err(DecodeError::BadInstruction(offset)),
            }
        }

        match op {
            OpCode::GetUpvalue | OpCode::SetUpvalue => {
                if code[offset + 1] >= proto.num_upvalues {
                    return Err(DecodeError::BadInstruction(offset));
                }
            }
            OpCode::Closure => {
                let child = proto.read_u16(offset + 1).unwrap_or(u16::MAX) as usize;
                let child_index = *proto
                    .children
                    .get(child)
                    .ok_or(DecodeError::BadInstruction(offset))?;
                let captures = protos[child_index as usize].num_upvalues as usize;
                size += captures * 2;
                if offset + size > code.len() {
                    return Err(DecodeError::BadInstruction(offset));
                }
                for pair in 0..captures {
                    let is_local = code[offset + 3 + pair * 2];
                    let index = code[offset + 4 + pair * 2];
                    let valid = match is_local {
                        1 => index >= 1,
                        0 => index < proto.num_upvalues,
                        _ => false,
                    };
                    if !valid {
                        return Err(DecodeError::BadInstruction(offset));
                    }
                }
            }
            _ => {}
        }

        if op.is_jump() {
            let distance = proto.read_i16(offset + size - 2).unwrap_or(0);
            let target = (offset + size) as isize + distance as isize;
            jumps.push((offset, target));
        }
        offset += size;
    }
    boundaries[code.len()] = true;

    for (offset, target) in jumps {
        if target < 0 || target as usize > code.len() || !boundaries[target as usize] {
            return Err(DecodeError::BadInstruction(offset));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{compile_chunk, CompileOptions};

    fn sample() -> Chunk {
        compile_chunk(
            "local function add(a, b) return a + b end\nreturn add(1, 2), 'x'",
            "sample",
            &CompileOptions {
                debug_level: 2,
                ..CompileOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn varints() {
        let mut out = Vec::new();
        write_varint(&mut out, 300);
        assert_eq!(out, vec![0xac, 0x02]);
        let mut reader = Reader {
            bytes: &out,
            pos: 0,
        };
        assert_eq!(reader.varint(), Ok(300));
    }

    #[test]
    fn decode_preserves_structure() {
        let chunk = sample();
        let decoded = Chunk::from_bytes(&chunk.to_bytes()).unwrap();
        assert_eq!(decoded.protos.len(), chunk.protos.len());
        assert_eq!(decoded.main, chunk.main);
        let main = decoded.main_proto().unwrap();
        assert_eq!(main.code(), chunk.main_proto().unwrap().code());
        assert_eq!(decoded.protos[0].name.as_deref(), Some("add"));
        assert!(decoded.protos[0].debug.is_some());
        assert_eq!(decoded.to_bytes(), chunk.to_bytes());
    }

    #[test]
    fn version_mismatch() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 9;
        let err = Chunk::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().starts_with("bytecode version mismatch"));
    }

    #[test]
    fn truncated_input() {
        let bytes = sample().to_bytes();
        for len in [0, 1, 2, bytes.len() / 2, bytes.len() - 1] {
            assert!(Chunk::from_bytes(&bytes[..len]).is_err(), "len {len}");
        }
        assert_eq!(Chunk::from_bytes(&[]), Err(DecodeError::Truncated));
    }

    #[test]
    fn rejects_bad_opcode() {
        let mut chunk = sample();
        let main = chunk.main as usize;
        let code = chunk.protos[main].code().to_vec();
        let mut patched = code.clone();
        patched[0] = 250;
        let proto = &chunk.protos[main];
        let mut replacement = Proto::from_parts(
            patched,
            proto.constants().to_vec(),
            proto.line_runs().to_vec(),
        );
        replacement.children.clone_from(&proto.children);
        replacement.is_vararg = true;
        chunk.protos[main] = replacement;
        assert!(matches!(
            Chunk::from_bytes(&chunk.to_bytes()),
            Err(DecodeError::BadOpcode { opcode: 250, .. })
        ));
    }
}
