//! Function prototypes and compiled chunks
//!
//! A [`Proto`] is the compiled form of one function: raw instruction bytes,
//! a constant pool, nested prototype references and optional debug info. A
//! [`Chunk`] is everything one compilation produced, ready to serialize.

use rustc_hash::FxHashMap;

use super::constant::{Constant, ConstantKey};
use super::opcode::OpCode;

/// A local variable's name and live range, recorded at debug level 2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVar {
    pub name: String,
    pub start_pc: u32,
    pub end_pc: u32,
    pub slot: u8,
}

/// Extra names kept at debug level 2
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugInfo {
    pub locals: Vec<LocalVar>,
    pub upvalue_names: Vec<String>,
}

/// The compiled form of a single function
#[derive(Clone, Default, PartialEq)]
pub struct Proto {
    pub num_params: u8,
    pub is_vararg: bool,
    pub num_upvalues: u8,
    /// Highest local slot used, plus one for the closure slot
    pub max_stack: u8,
    /// Debug name, if kept
    pub name: Option<String>,
    pub line_defined: u32,
    /// Indices into the owning [`Chunk::protos`]
    pub children: Vec<u32>,
    pub debug: Option<DebugInfo>,

    code: Vec<u8>,
    constants: Vec<Constant>,
    constant_index: FxHashMap<ConstantKey, u16>,
    /// Run-length encoded lines: `(line, byte count)`
    lines: Vec<(u32, u32)>,
}

impl Proto {
    #[must_use]
    pub fn new(name: Option<String>, line_defined: u32) -> Self {
        Self {
            name,
            line_defined,
            ..Self::default()
        }
    }

    /// Build a prototype from decoded parts
    #[must_use]
    pub(crate) fn from_parts(
        code: Vec<u8>,
        constants: Vec<Constant>,
        lines: Vec<(u32, u32)>,
    ) -> Self {
        let constant_index = constants
            .iter()
            .enumerate()
            .filter_map(|(i, c)| Some((c.dedup_key(), u16::try_from(i).ok()?)))
            .collect();
        Self {
            code,
            constants,
            constant_index,
            lines,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    #[must_use]
    pub fn constant(&self, index: u16) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    #[must_use]
    pub fn line_runs(&self) -> &[(u32, u32)] {
        &self.lines
    }

    /// Drop line information (debug level 0)
    pub fn strip_lines(&mut self) {
        self.lines.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    // ===== Writing =====

    pub fn write_byte(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.add_line(line, 1);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write_byte(op as u8, line);
    }

    pub fn write_op_u8(&mut self, op: OpCode, operand: u8, line: u32) {
        self.write_byte(op as u8, line);
        self.write_byte(operand, line);
    }

    pub fn write_op_u16(&mut self, op: OpCode, operand: u16, line: u32) {
        self.write_byte(op as u8, line);
        self.write_u16(operand, line);
    }

    pub fn write_u16(&mut self, value: u16, line: u32) {
        for byte in value.to_le_bytes() {
            self.write_byte(byte, line);
        }
    }

    pub fn write_u32(&mut self, value: u32, line: u32) {
        for byte in value.to_le_bytes() {
            self.write_byte(byte, line);
        }
    }

    /// Write a placeholder jump operand and return its offset for patching
    pub fn write_jump_placeholder(&mut self, line: u32) -> usize {
        let offset = self.code.len();
        self.write_u16(0, line);
        offset
    }

    /// Point the jump operand at `operand_offset` to the current end of code.
    ///
    /// Returns `false` when the distance does not fit in an i16.
    #[must_use]
    pub fn patch_jump(&mut self, operand_offset: usize) -> bool {
        let target = self.code.len();
        self.patch_jump_to(operand_offset, target)
    }

    #[must_use]
    pub fn patch_jump_to(&mut self, operand_offset: usize, target: usize) -> bool {
        let distance = target as isize - (operand_offset as isize + 2);
        let Ok(distance) = i16::try_from(distance) else {
            return false;
        };
        self.code[operand_offset..operand_offset + 2].copy_from_slice(&distance.to_le_bytes());
        true
    }

    /// Write a jump operand that targets an earlier offset
    #[must_use]
    pub fn write_jump_back(&mut self, target: usize, line: u32) -> bool {
        let operand = self.write_jump_placeholder(line);
        self.patch_jump_to(operand, target)
    }

    /// Add a constant to the pool, reusing an identical entry.
    ///
    /// Returns `None` if the pool is full.
    pub fn add_constant(&mut self, value: Constant) -> Option<u16> {
        let key = value.dedup_key();
        if let Some(&index) = self.constant_index.get(&key) {
            return Some(index);
        }
        let index = u16::try_from(self.constants.len()).ok()?;
        self.constants.push(value);
        self.constant_index.insert(key, index);
        Some(index)
    }

    fn add_line(&mut self, line: u32, count: u32) {
        if let Some(last) = self.lines.last_mut() {
            if last.0 == line {
                last.1 += count;
                return;
            }
        }
        self.lines.push((line, count));
    }

    // ===== Reading =====

    #[must_use]
    pub fn read_byte(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    #[must_use]
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let bytes = self.code.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    #[must_use]
    pub fn read_i16(&self, offset: usize) -> Option<i16> {
        self.read_u16(offset).map(|u| u as i16)
    }

    #[must_use]
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.code.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Source line of the instruction at `offset`, when line info was kept
    #[must_use]
    pub fn line_at(&self, offset: usize) -> Option<u32> {
        line_for_offset(&self.lines, offset)
    }
}

/// Look up a line in a run-length encoded table
#[must_use]
pub fn line_for_offset(lines: &[(u32, u32)], offset: usize) -> Option<u32> {
    let mut end = 0usize;
    for &(line, count) in lines {
        end += count as usize;
        if offset < end {
            return Some(line);
        }
    }
    lines.last().map(|&(line, _)| line)
}

impl std::fmt::Debug for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proto")
            .field("name", &self.name)
            .field("params", &self.num_params)
            .field("upvalues", &self.num_upvalues)
            .field("code_len", &self.code.len())
            .field("constants_len", &self.constants.len())
            .field("children", &self.children)
            .finish()
    }
}

/// Everything produced by one compilation
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub vector_size: u8,
    /// Prototypes, children before parents
    pub protos: Vec<Proto>,
    /// Index of the main function
    pub main: u32,
}

impl Chunk {
    #[must_use]
    pub fn main_proto(&self) -> Option<&Proto> {
        self.protos.get(self.main as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read() {
        let mut proto = Proto::new(None, 0);
        proto.write_op_u16(OpCode::Const, 0x1234, 1);
        proto.write_u32(0xdead_beef, 1);
        assert_eq!(proto.read_byte(0), Some(OpCode::Const as u8));
        assert_eq!(proto.read_u16(1), Some(0x1234));
        assert_eq!(proto.read_u32(3), Some(0xdead_beef));
    }

    #[test]
    fn constants_are_deduplicated() {
        let mut proto = Proto::new(None, 0);
        let a = proto.add_constant(Constant::Number(42.0)).unwrap();
        let b = proto.add_constant(Constant::Number(42.0)).unwrap();
        let c = proto.add_constant(Constant::String(b"x".to_vec())).unwrap();
        assert_eq!(a, b);
        assert_eq!(c, 1);
        assert_eq!(proto.constant(c), Some(&Constant::String(b"x".to_vec())));
    }

    #[test]
    fn line_runs() {
        let mut proto = Proto::new(None, 0);
        proto.write_op_u16(OpCode::Const, 0, 1);
        proto.write_op(OpCode::Pop, 2);
        assert_eq!(proto.line_at(0), Some(1));
        assert_eq!(proto.line_at(2), Some(1));
        assert_eq!(proto.line_at(3), Some(2));
        assert_eq!(proto.line_runs(), &[(1, 3), (2, 1)]);
        proto.strip_lines();
        assert_eq!(proto.line_at(0), None);
    }

    #[test]
    fn forward_and_backward_jumps() {
        let mut proto = Proto::new(None, 0);
        let start = proto.current_offset();
        proto.write_op(OpCode::Nil, 1);
        proto.write_op(OpCode::Jump, 1);
        let operand = proto.write_jump_placeholder(1);
        proto.write_op(OpCode::Nil, 1);
        proto.write_op(OpCode::Pop, 1);
        assert!(proto.patch_jump(operand));
        assert_eq!(proto.read_i16(operand), Some(2));

        proto.write_op(OpCode::Jump, 1);
        assert!(proto.write_jump_back(start, 1));
        let back = proto.current_offset() - 2;
        assert_eq!(proto.read_i16(back), Some(-(proto.current_offset() as i16)));
    }

    #[test]
    fn oversized_jump_is_rejected() {
        let mut proto = Proto::new(None, 0);
        proto.write_op(OpCode::Jump, 1);
        let operand = proto.write_jump_placeholder(1);
        for _ in 0..40_000 {
            proto.write_op(OpCode::Nil, 1);
        }
        assert!(!proto.patch_jump(operand));
    }
}
