//! Standard library
//!
//! Each library is a table of native functions installed into the globals
//! by [`open_libs`]. Library functions follow the host calling convention:
//! arguments at indices `1..=top`, results pushed on top.

pub mod base;
pub mod buffer;
pub mod coroutine;
pub mod math;
pub mod string;
pub mod table;
pub mod vector;

use std::rc::Rc;

use tracing::debug;

use crate::gc::Handle;
use crate::value::Value;
use crate::vm::{Intrinsic, VmResult, VM};

/// Signature of a library function
pub type LibFn = fn(&mut VM) -> VmResult<usize>;

/// Install every library into the globals
pub fn open_libs(vm: &mut VM) {
    base::open(vm);
    let string = string::open(vm);
    table::open(vm);
    math::open(vm);
    coroutine::open(vm);
    buffer::open(vm);
    vector::open(vm);

    let meta = vm.heap.new_table(0, 1);
    let index = vm.event_key(crate::vm::Event::Index);
    vm.raw_set_table(meta, index, Value::Table(string));
    vm.string_meta = Some(meta);
    debug!("standard library opened");
}

/// Create a global library table holding `functions`
pub(crate) fn new_lib(vm: &mut VM, name: &str, functions: &[(&str, LibFn)]) -> Handle {
    let table = vm.heap.new_table(0, functions.len());
    for &(fname, f) in functions {
        set_function(vm, table, fname, f, None);
    }
    set_global_raw(vm, name, Value::Table(table));
    table
}

pub(crate) fn set_function(vm: &mut VM, table: Handle, name: &str, f: LibFn, intrinsic: Option<Intrinsic>) {
    let function = vm.alloc_native(name, Rc::new(f), Vec::new(), intrinsic);
    set_raw(vm, table, name, function);
}

pub(crate) fn set_raw(vm: &mut VM, table: Handle, name: &str, value: Value) {
    let key = Value::String(vm.heap.intern(name.as_bytes()));
    vm.raw_set_table(table, key, value);
}

pub(crate) fn set_global_raw(vm: &mut VM, name: &str, value: Value) {
    let globals = vm.globals;
    set_raw(vm, globals, name, value);
}

/// Placeholder body for functions the call path handles itself
pub(crate) fn intrinsic_body(vm: &mut VM) -> VmResult<usize> {
    Err(vm.raise_message("intrinsic called directly"))
}

#[cfg(test)]
mod tests {
    use crate::testutil::run;
    use crate::vm::{VmConfig, VM};

    #[test]
    fn test_libraries_are_global_tables() {
        let values = run("return type(string), type(table), type(math), type(coroutine), type(buffer), type(vector)")
            .unwrap();
        assert_eq!(values, vec!["table"; 6]);
    }

    #[test]
    fn test_string_methods_through_metatable() {
        assert_eq!(run("local s = 'abc' return s:upper(), ('x'):rep(3)").unwrap(), vec!["ABC", "xxx"]);
    }

    #[test]
    fn test_bare_vm_has_no_libraries() {
        let mut vm = VM::with_config(VmConfig {
            open_libs: false,
            ..VmConfig::default()
        });
        vm.do_string("return string").unwrap();
        assert!(vm.read(-1).is_nil());
    }
}
