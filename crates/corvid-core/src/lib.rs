//! Corvid - an embeddable Luau-style scripting engine
//!
//! This crate provides:
//! - Lexer and parser for the source dialect
//! - Bytecode compiler with a deterministic binary format
//! - VM: stack-based host API, interpreter, coroutines and metatables
//! - Arena heap with an incremental garbage collector
//! - A small standard library and a sandbox mode for untrusted scripts
//!
//! ```no_run
//! use corvid_core::VM;
//!
//! let mut vm = VM::new();
//! vm.do_string("return 1 + 2").unwrap();
//! assert_eq!(vm.to_number(-1).unwrap(), 3.0);
//! ```

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lexer module - tokenization of source text
pub mod lexer;

/// Abstract syntax tree produced by the parser
pub mod ast;

/// Parser module - converts tokens into an AST
pub mod parser;

/// Bytecode module - instruction set, compiler and binary format
pub mod bytecode;

/// Runtime values and heap object layouts
pub mod value;

/// Garbage collected heap
pub mod gc;

/// Virtual machine - host API and execution
pub mod vm;

/// Standard library
pub mod stdlib;

/// Test utilities - helpers for testing scripts
pub mod testutil;

/// Convenience re-export of the VM
pub use vm::VM;

/// Convenience re-export of value types
pub use value::{Tag, Value, Vector};

/// Convenience re-export of error types
pub use vm::{Error, RuntimeError, TraceFrame, VmResult};

/// Convenience re-export of host API types
pub use vm::{
    InterruptAction, OutputCapture, OutputSink, RefHandle, ResumeOutcome, ThreadStatus, VmConfig, MULTRET,
};

/// Convenience re-export of collector types
pub use gc::{GcConfig, GcStats};

/// Convenience re-export of the compiler entry points
pub use bytecode::{compile, CompileError, CompileOptions};
