//! Integration tests for compiler determinism and the chunk format

use std::cell::Cell;
use std::rc::Rc;

use corvid_core::bytecode::{compile_chunk, disassemble_chunk, Chunk, OpCode, Proto, VECTOR_SIZE};
use corvid_core::{compile, CompileOptions, Error, InterruptAction, VmConfig, VM};

const PROGRAM: &str = r"
local Account = {}
Account.__index = Account

function Account.new(balance)
    return setmetatable({balance = balance}, Account)
end

function Account:deposit(v)
    self.balance = self.balance + v
    return self.balance
end

local a = Account.new(100)
local total = 0
for i = 1, 10 do total = total + a:deposit(i) end
return total, `balance {a.balance}`
";

#[test]
fn test_identical_input_gives_identical_bytes() {
    let options = CompileOptions::default();
    let first = compile(PROGRAM, "=account", &options).unwrap();
    let second = compile(PROGRAM, "=account", &options).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_every_option_set_is_deterministic() {
    for debug_level in 0..=2 {
        for optimization_level in 0..=2 {
            let options = CompileOptions {
                debug_level,
                optimization_level,
                ..CompileOptions::default()
            };
            let a = compile(PROGRAM, "=account", &options).unwrap();
            let b = compile(PROGRAM, "=account", &options).unwrap();
            assert_eq!(a, b, "debug {debug_level} opt {optimization_level}");
        }
    }
}

#[test]
fn test_debug_level_changes_output() {
    let stripped = CompileOptions {
        debug_level: 0,
        ..CompileOptions::default()
    };
    let a = compile(PROGRAM, "=account", &stripped).unwrap();
    let b = compile(PROGRAM, "=account", &CompileOptions::default()).unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_serialized_chunk_runs_in_any_vm() {
    let bytes = compile(PROGRAM, "=account", &CompileOptions::default()).unwrap();
    for _ in 0..2 {
        let mut vm = VM::new();
        vm.load("=account", &bytes).unwrap();
        vm.protected_call(0, 2).unwrap();
        assert_eq!(vm.to_number(-2).unwrap(), 1220.0);
        assert_eq!(vm.to_str(-1).unwrap(), "balance 155");
    }
}

#[test]
fn test_decode_encode_is_stable() {
    let bytes = compile(PROGRAM, "=account", &CompileOptions::default()).unwrap();
    let chunk = Chunk::from_bytes(&bytes).unwrap();
    assert_eq!(chunk.to_bytes(), bytes);
}

#[test]
fn test_loading_does_not_execute() {
    let mut vm = VM::new();
    let bytes = compile("ran = true", "=side", &CompileOptions::default()).unwrap();
    vm.load("=side", &bytes).unwrap();
    vm.get_global("ran").unwrap();
    assert!(vm.read(-1).is_nil());
}

#[test]
fn test_corrupt_chunks_are_rejected() {
    let bytes = compile("return 1", "=one", &CompileOptions::default()).unwrap();
    let mut vm = VM::new();

    let truncated = &bytes[..bytes.len() / 2];
    assert!(matches!(vm.load("=one", truncated), Err(Error::Load(_))));

    let mut wrong_version = bytes.clone();
    wrong_version[0] = wrong_version[0].wrapping_add(1);
    match vm.load("=one", &wrong_version) {
        Err(Error::Load(message)) => assert!(message.contains("version"), "{message}"),
        other => panic!("expected load error, got {other:?}"),
    }
    assert!(matches!(vm.load("=one", &[]), Err(Error::Load(_))));
    assert_eq!(vm.top(), 0);
}

#[test]
fn test_unbalanced_stack_use_is_a_runtime_error() {
    let mut main = Proto::new(Some("main".into()), 0);
    main.is_vararg = true;
    main.max_stack = 1;
    // CALL with no function pushed
    for byte in [OpCode::Call as u8, 0, 0, 0, OpCode::Return as u8, 0, 0] {
        main.write_byte(byte, 1);
    }
    let chunk = Chunk {
        vector_size: VECTOR_SIZE,
        protos: vec![main],
        main: 0,
    };

    let mut vm = VM::new();
    vm.load("=bad", &chunk.to_bytes()).unwrap();
    match vm.protected_call(0, 0) {
        Err(Error::Runtime(err)) => assert!(err.message.contains("malformed bytecode"), "{}", err.message),
        other => panic!("expected runtime error, got {other:?}"),
    }
    assert_eq!(vm.top(), 0);
}

const MUTATED: &str = r"
local t = {10, 20, x = 'y'}
local sum = 0
for i = 1, 3 do sum = sum + i end
for k, v in t do if k ~= 'x' then sum = sum + v end end
local function join(...)
    local parts = {...}
    return parts[1] .. '-' .. #parts
end
return sum, join('a', 'b')
";

#[test]
fn test_mutated_chunks_fail_without_panicking() {
    let bytes = compile(MUTATED, "=mutated", &CompileOptions::default()).unwrap();
    for index in 0..bytes.len() {
        let original = bytes[index];
        for replacement in [0, 1, 0x7f, 0xff, original ^ 1] {
            if replacement == original {
                continue;
            }
            let mut mutated = bytes.clone();
            mutated[index] = replacement;

            let mut vm = VM::with_config(VmConfig {
                open_libs: false,
                interrupt_interval: 64,
                memory_limit: Some(64 << 20),
                ..VmConfig::default()
            });
            let polls = Rc::new(Cell::new(0u32));
            let counter = Rc::clone(&polls);
            vm.set_interrupt(move || {
                counter.set(counter.get() + 1);
                if counter.get() > 50 {
                    InterruptAction::Abort
                } else {
                    InterruptAction::Continue
                }
            });

            if vm.load("=mutated", &mutated).is_ok() {
                let _ = vm.protected_call(0, 0);
            }
            assert_eq!(vm.top(), 0, "byte {index} set to {replacement:#04x}");
        }
    }
}

#[test]
fn test_disassembly_lists_every_function() {
    let chunk = compile_chunk(PROGRAM, "account", &CompileOptions::default()).unwrap();
    let listing = disassemble_chunk(&chunk, "account");
    assert!(listing.contains("account"));
    assert!(listing.contains("new"));
    assert!(listing.contains("deposit"));
}
