//! Registry references
//!
//! A [`RefHandle`] pins a value in the registry so the host can hold on to
//! it across calls. Dropping the handle queues the slot for release; the
//! VM frees queued slots before its next collection.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use super::{Error, VmResult, VM};
use crate::value::Value;

/// Key used for references to nil; never stored
const NIL_REF: i32 = -1;

/// Owned reference to a value pinned in a VM's registry
#[derive(Debug)]
pub struct RefHandle {
    key: i32,
    vm_id: u64,
    releases: Rc<RefCell<Vec<i32>>>,
}

impl RefHandle {
    /// Registry key; negative for a reference to nil
    #[must_use]
    pub fn key(&self) -> i32 {
        self.key
    }

    /// Release the reference now
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RefHandle {
    fn drop(&mut self) {
        if self.key > 0 {
            self.releases.borrow_mut().push(self.key);
        }
    }
}

impl VM {
    /// Pin the value at `index`, optionally removing it from the stack
    pub fn store_ref(&mut self, index: i32, remove_original: bool) -> RefHandle {
        let value = self.value_at(index);
        if remove_original {
            self.remove(index);
        }
        let key = if value.is_nil() {
            NIL_REF
        } else {
            self.process_releases();
            let key = self.refs.free.pop().unwrap_or_else(|| {
                let key = self.refs.next;
                self.refs.next += 1;
                key
            });
            self.heap.table_set_int(self.registry, key as usize, value);
            trace!(key, "registry ref stored");
            key
        };
        RefHandle {
            key,
            vm_id: self.id,
            releases: Rc::clone(&self.refs.releases),
        }
    }

    /// Push the value a reference pins
    pub fn push_ref(&mut self, handle: &RefHandle) -> VmResult<()> {
        if handle.vm_id != self.id {
            return Err(Error::StateMismatch);
        }
        let value = if handle.key > 0 {
            self.heap.table(self.registry).get_int(i64::from(handle.key))
        } else {
            Value::Nil
        };
        self.push_value(value);
        Ok(())
    }

    /// Unpin slots whose handles were dropped
    pub(crate) fn process_releases(&mut self) {
        let released: Vec<i32> = self.refs.releases.borrow_mut().drain(..).collect();
        for key in released {
            self.heap.table_set_int(self.registry, key as usize, Value::Nil);
            self.refs.free.push(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_keeps_value_alive() {
        let mut vm = VM::new();
        vm.new_table();
        let table = vm.read(-1);
        let handle = vm.store_ref(-1, true);
        assert_eq!(vm.top(), 0);
        vm.collect_garbage();
        assert!(vm.is_handle_live(table));
        vm.push_ref(&handle).unwrap();
        assert!(vm.read(-1).raw_equal(&table));
        vm.pop(1);

        handle.release();
        vm.collect_garbage();
        assert!(!vm.is_handle_live(table));
    }

    #[test]
    fn test_nil_ref_is_negative() {
        let mut vm = VM::new();
        vm.push_nil();
        let handle = vm.store_ref(-1, false);
        assert!(handle.key() < 0);
        vm.push_ref(&handle).unwrap();
        assert!(vm.read(-1).is_nil());
    }

    #[test]
    fn test_released_keys_are_reused() {
        let mut vm = VM::new();
        vm.push_number(1.0);
        let first = vm.store_ref(-1, true);
        let key = first.key();
        drop(first);
        vm.push_number(2.0);
        let second = vm.store_ref(-1, true);
        assert_eq!(second.key(), key);
        vm.push_ref(&second).unwrap();
        assert_eq!(vm.to_number(-1).unwrap(), 2.0);
    }

    #[test]
    fn test_ref_from_other_vm_is_rejected() {
        let mut a = VM::new();
        let mut b = VM::new();
        a.push_boolean(true);
        let handle = a.store_ref(-1, true);
        assert!(matches!(b.push_ref(&handle), Err(Error::StateMismatch)));
    }
}
