//! `vector` library
//!
//! The global `vector` is both the library table and, through `__call`,
//! the constructor: `vector(1, 2, 3)`.

use std::rc::Rc;

use super::{new_lib, set_raw, LibFn};
use crate::value::{Value, Vector};
use crate::vm::{Event, VmResult, VM};

const FUNCTIONS: &[(&str, LibFn)] = &[("create", create), ("magnitude", magnitude), ("dot", dot)];

pub(crate) fn open(vm: &mut VM) {
    let lib = new_lib(vm, "vector", FUNCTIONS);
    set_raw(vm, lib, "zero", Value::Vector(Vector::default()));
    set_raw(vm, lib, "one", Value::Vector(Vector::new(1.0, 1.0, 1.0)));

    let meta = vm.heap.new_table(0, 1);
    let constructor = vm.alloc_native("vector", Rc::new(call), Vec::new(), None);
    let key = vm.event_key(Event::Call);
    vm.raw_set_table(meta, key, constructor);
    vm.heap.table_mut(lib).metatable = Some(meta);
    vm.heap.barrier_handle(lib, meta);
}

/// Build a vector from the number arguments starting at `first`
fn construct(vm: &mut VM, first: usize) -> VmResult<usize> {
    let x = vm.check_number(first)?;
    let y = vm.check_number(first + 1)?;
    let z = vm.opt_number(first + 2, 0.0)?;
    vm.push_vector(Vector::new(x as f32, y as f32, z as f32));
    Ok(1)
}

fn create(vm: &mut VM) -> VmResult<usize> {
    construct(vm, 1)
}

/// `__call` handler; argument 1 is the library table itself
fn call(vm: &mut VM) -> VmResult<usize> {
    construct(vm, 2)
}

fn check_vector(vm: &mut VM, arg: usize) -> VmResult<Vector> {
    match vm.arg(arg) {
        Value::Vector(v) => Ok(v),
        other => {
            let found = vm.type_name_of(other);
            Err(vm.arg_error(arg, &format!("vector expected, got {found}")))
        }
    }
}

fn magnitude(vm: &mut VM) -> VmResult<usize> {
    let v = check_vector(vm, 1)?;
    vm.push_number(f64::from(v.magnitude()));
    Ok(1)
}

fn dot(vm: &mut VM) -> VmResult<usize> {
    let a = check_vector(vm, 1)?;
    let b = check_vector(vm, 2)?;
    vm.push_number(f64::from(a.dot(b)));
    Ok(1)
}
