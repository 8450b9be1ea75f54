//! Integration tests for protected calls, error values and fatal failures

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use corvid_core::{Error, InterruptAction, Value, VM};

#[test]
fn test_error_value_is_carried_unchanged() {
    let mut vm = VM::new();
    vm.push_number(1.0);
    let before = vm.top();
    vm.load_source("=boom", "error('boom')").unwrap();
    let err = vm.protected_call(0, 0).unwrap_err();
    let runtime = err.as_runtime().expect("runtime error");
    assert_eq!(runtime.message, "boom");
    match runtime.value {
        Value::String(_) => {}
        other => panic!("expected a string error value, got {other:?}"),
    }
    assert_eq!(vm.top(), before);
}

#[test]
fn test_table_error_values_survive_until_next_call() {
    let mut vm = VM::new();
    let err = vm.do_string("error({code = 42})").unwrap_err();
    let value = err.as_runtime().unwrap().value;
    assert!(matches!(value, Value::Table(_)));
    vm.collect_garbage();
    assert!(vm.is_handle_live(value));
    assert!(err.to_string().contains("error object is a table value"));
}

#[test]
fn test_compile_error_produces_no_chunk() {
    let mut vm = VM::new();
    let err = vm.load_source("=broken", "return (").unwrap_err();
    match err {
        Error::Compile(compile) => {
            assert_eq!(compile.chunk, "broken");
            assert!(!compile.message().is_empty());
        }
        other => panic!("expected compile error, got {other:?}"),
    }
    assert_eq!(vm.top(), 0);
}

#[test]
fn test_runtime_error_carries_location_and_traceback() {
    let mut vm = VM::new();
    let source = "local function f(t)\n  return t.x.y\nend\nf({})";
    let err = vm.do_string(source).unwrap_err();
    let runtime = err.as_runtime().unwrap();
    assert_eq!(runtime.message, "string:2: attempt to index a nil value");
    assert_eq!(runtime.chunk.as_deref(), Some("string"));
    assert_eq!(runtime.line, Some(2));
    assert!(runtime.report().contains("stack traceback:"));
}

#[test]
fn test_stack_overflow_is_catchable() {
    let mut vm = VM::new();
    vm.do_string("local function f() return f() + 1 end return pcall(f)").unwrap();
    assert!(!vm.to_boolean(-2).unwrap());
    assert!(vm.to_str(-1).unwrap().ends_with("stack overflow"));
}

#[test]
fn test_vm_is_usable_after_a_failed_call() {
    let mut vm = VM::new();
    assert!(vm.do_string("local x = nil + 1").is_err());
    let n = vm.do_string("return 'still alive'").unwrap();
    assert_eq!(n, 1);
    assert_eq!(vm.to_str(-1).unwrap(), "still alive");
}

#[test]
fn test_unprotected_failure_runs_panic_handler() {
    let seen = Rc::new(RefCell::new(None));
    let mut vm = VM::new();
    let sink = Rc::clone(&seen);
    vm.set_panic_handler(move |err| *sink.borrow_mut() = Some(err.to_string()));
    vm.load_source("=fatal", "error('fatal', 0)").unwrap();

    let result = catch_unwind(AssertUnwindSafe(|| vm.call(0, 0)));
    assert!(result.is_err());
    assert_eq!(seen.borrow().as_deref(), Some("fatal"));
}

#[test]
fn test_interrupt_cancels_runaway_script() {
    let mut vm = VM::new();
    let polls = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&polls);
    vm.set_interrupt(move || {
        *counter.borrow_mut() += 1;
        if *counter.borrow() >= 10 {
            InterruptAction::Abort
        } else {
            InterruptAction::Continue
        }
    });
    let err = vm.do_string("local n = 0 while true do n = n + 1 end").unwrap_err();
    assert!(matches!(err, Error::Interrupted));
    assert_eq!(*polls.borrow(), 10);

    vm.clear_interrupt();
    assert!(vm.do_string("return 1").is_ok());
}
