//! Sandboxing
//!
//! After [`VM::sandbox`] the builtin libraries are frozen and each chunk
//! loaded afterwards gets a private environment whose reads fall through
//! to the globals, so scripts cannot tamper with shared state.

use std::rc::Rc;

use tracing::debug;

use super::{VmResult, VM};
use crate::gc::Handle;
use crate::value::Value;

impl VM {
    /// Freeze the globals, every library table in them and the string metatable
    pub fn sandbox(&mut self) {
        let libraries: Vec<Handle> = self
            .heap
            .table(self.globals)
            .iter()
            .filter_map(|(_, value)| value.as_table())
            .collect();
        for table in &libraries {
            self.heap.table_mut(*table).readonly = true;
        }
        self.heap.table_mut(self.globals).readonly = true;
        if let Some(meta) = self.string_meta {
            self.heap.table_mut(meta).readonly = true;
        }
        self.sandboxed = true;
        debug!(libraries = libraries.len(), "vm sandboxed");
    }

    #[must_use]
    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    /// Environment for a newly loaded chunk
    pub(crate) fn chunk_env(&mut self) -> Handle {
        if !self.sandboxed {
            return self.globals;
        }
        let proxy = self.heap.new_table(0, 0);
        let meta = self.heap.new_table(0, 2);
        let index = self.event_key(super::Event::Index);
        self.raw_set_table(meta, index, Value::Table(self.globals));
        let newindex = self.event_key(super::Event::NewIndex);
        let guard = self.alloc_native(
            "__newindex",
            Rc::new(sandbox_newindex),
            vec![Value::Table(self.globals)],
            None,
        );
        self.raw_set_table(meta, newindex, guard);
        let meta_table = self.heap.table_mut(meta);
        meta_table.readonly = true;
        let proxy_table = self.heap.table_mut(proxy);
        proxy_table.metatable = Some(meta);
        proxy
    }
}

/// `__newindex` of a sandboxed environment: shadowing builtins is refused,
/// new names land in the private environment.
fn sandbox_newindex(vm: &mut VM) -> VmResult<usize> {
    let Value::Table(env) = vm.arg(1) else {
        return Err(vm.raise_message("invalid environment"));
    };
    let key = vm.arg(2);
    let value = vm.arg(3);
    let Value::Table(globals) = vm.upvalue(1) else {
        return Err(vm.raise_message("invalid environment"));
    };
    if !vm.heap.table(globals).get(&key).is_nil() {
        return Err(vm.raise_message("attempt to modify a readonly table"));
    }
    vm.raw_store(env, key, value)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use crate::vm::VM;

    #[test]
    fn test_sandboxed_chunks_cannot_replace_builtins() {
        let mut vm = VM::new();
        vm.sandbox();
        assert!(vm.is_sandboxed());
        let err = vm.do_string("string = nil").unwrap_err();
        assert!(err.to_string().contains("attempt to modify a readonly table"), "{err}");
        let err = vm.do_string("string.upper = nil").unwrap_err();
        assert!(err.to_string().contains("attempt to modify a readonly table"), "{err}");
    }

    #[test]
    fn test_sandboxed_chunks_keep_private_globals() {
        let mut vm = VM::new();
        vm.sandbox();
        let n = vm.do_string("counter = 1 counter = counter + 1 return counter, math.abs(-3)").unwrap();
        assert_eq!(n, 2);
        assert_eq!(vm.to_number(-2).unwrap(), 2.0);
        assert_eq!(vm.to_number(-1).unwrap(), 3.0);
        vm.pop(2);

        vm.do_string("return counter").unwrap();
        assert!(vm.read(-1).is_nil());
    }

    #[test]
    fn test_sandbox_freezes_string_metatable() {
        let mut vm = VM::new();
        vm.sandbox();
        let err = vm.do_string("getmetatable('').__index = {}").unwrap_err();
        assert!(err.to_string().contains("readonly"), "{err}");
    }
}
