//! `coroutine` library


use super::{intrinsic_body, new_lib, set_function, LibFn};
use crate::value::Value;
use crate::vm::{Completion, Intrinsic, VmResult, VM};

const FUNCTIONS: &[(&str, LibFn)] = &[
    ("create", create),
    ("resume", resume),
    ("status", status),
    ("wrap", wrap),
    ("isyieldable", isyieldable),
    ("running", running),
    ("close", close),
];

pub(crate) fn open(vm: &mut VM) {
    let lib = new_lib(vm, "coroutine", FUNCTIONS);
    set_function(vm, lib, "yield", intrinsic_body, Some(Intrinsic::Yield));
}

fn create(vm: &mut VM) -> VmResult<usize> {
    let function = vm.check_function(1)?;
    vm.push_value(function);
    vm.new_thread()?;
    Ok(1)
}

/// Arguments after the first, moved off the stack
fn take_args(vm: &mut VM, from: usize) -> Vec<Value> {
    let start = vm.stack_base() + from - 1;
    if start >= vm.state.stack.len() {
        return Vec::new();
    }
    vm.state.stack.split_off(start)
}

fn resume(vm: &mut VM) -> VmResult<usize> {
    let thread = vm.check_thread(1)?;
    let args = take_args(vm, 2);
    match vm.resume_thread(thread, args) {
        Ok(Completion::Yielded(values) | Completion::Finished(values)) => {
            vm.push_boolean(true);
            Ok(1 + vm.push_results(values))
        }
        Err(err) if err.is_catchable() => {
            let value = vm.error_value_of(err);
            vm.push_boolean(false);
            vm.push_value(value);
            Ok(2)
        }
        Err(err) => Err(err),
    }
}

fn status(vm: &mut VM) -> VmResult<usize> {
    let thread = vm.check_thread(1)?;
    let status = vm.coroutine_status(thread);
    vm.push_string(status.name());
    Ok(1)
}

fn wrap(vm: &mut VM) -> VmResult<usize> {
    create(vm)?;
    vm.push_closure("wrap", wrapped, 1);
    Ok(1)
}

/// Body of a `coroutine.wrap` function: resume and rethrow errors
fn wrapped(vm: &mut VM) -> VmResult<usize> {
    let Value::Thread(thread) = vm.upvalue(1) else {
        return Err(vm.raise_message("invalid wrapped coroutine"));
    };
    let args = take_args(vm, 1);
    match vm.resume_thread(thread, args)? {
        Completion::Yielded(values) | Completion::Finished(values) => Ok(vm.push_results(values)),
    }
}

fn isyieldable(vm: &mut VM) -> VmResult<usize> {
    let yieldable = vm.is_yieldable();
    vm.push_boolean(yieldable);
    Ok(1)
}

fn running(vm: &mut VM) -> VmResult<usize> {
    vm.push_value(Value::Thread(vm.current));
    Ok(1)
}

fn close(vm: &mut VM) -> VmResult<usize> {
    let thread = vm.check_thread(1)?;
    vm.close_thread(thread)?;
    vm.push_boolean(true);
    Ok(1)
}
