//! Bytecode module for the corvid virtual machine
//!
//! This module provides:
//! - `OpCode`: The bytecode instruction set
//! - `Proto` and `Chunk`: compiled functions and compilation units
//! - `compile`: source text to a serialized chunk
//! - The binary chunk format (`Chunk::to_bytes` / `Chunk::from_bytes`)
//! - Disassembler utilities for debugging

mod chunk;
mod compiler;
mod constant;
mod debug;
mod error;
mod opcode;
mod options;
mod serialize;

pub use chunk::{line_for_offset, Chunk, DebugInfo, LocalVar, Proto};
pub use compiler::{compile, compile_chunk, Compiler};
pub use constant::Constant;
pub use debug::{disassemble_chunk, disassemble_instruction, disassemble_proto};
pub use error::{CompileError, CompileErrorKind, CompileResult};
pub use opcode::{OpCode, MULTI};
pub use options::{CompileOptions, VECTOR_SIZE};
pub use serialize::{DecodeError, BYTECODE_VERSION};
