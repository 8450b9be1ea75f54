//! Host stack API
//!
//! Positive indices count from the bottom of the current frame (1 is the
//! first argument of a native function), negative indices from the top.
//! Index 0 and negative indices below the frame are programmer errors and
//! panic; positive indices above the top read as "no value".

use std::rc::Rc;

use super::{Error, VmResult, VM};
use crate::bytecode::MULTI;
use crate::gc::Handle;
use crate::value::{Destructor, Object, Tag, ThreadObject, Userdata, Value, Vector};
use crate::vm::{ThreadState, ThreadStatus};

/// Result count asking for every value a call produces
pub const MULTRET: i32 = -1;

pub(crate) fn wanted(nresults: i32) -> u8 {
    if nresults < 0 {
        MULTI
    } else {
        nresults.min(i32::from(MULTI) - 1) as u8
    }
}

impl VM {
    // ===== Index resolution =====

    pub(crate) fn stack_base(&self) -> usize {
        self.state.frames.last().map_or(0, |frame| frame.base + 1)
    }

    /// Absolute slot of an existing value
    pub(crate) fn abs_index(&self, index: i32) -> usize {
        let base = self.stack_base();
        let top = self.state.stack.len();
        if index > 0 {
            let slot = base + index as usize - 1;
            assert!(slot < top, "stack index {index} is above the top ({})", top - base);
            slot
        } else if index < 0 {
            let depth = index.unsigned_abs() as usize;
            assert!(depth <= top - base, "stack index {index} is below the frame");
            top - depth
        } else {
            panic!("stack index 0 is not valid");
        }
    }

    /// Value at an index; positions above the top read as nil
    pub(crate) fn value_at(&self, index: i32) -> Value {
        if index > 0 {
            let slot = self.stack_base() + index as usize - 1;
            self.state.stack.get(slot).copied().unwrap_or_default()
        } else {
            self.state.stack[self.abs_index(index)]
        }
    }

    fn exists(&self, index: i32) -> bool {
        index < 0 || self.stack_base() + (index as usize) <= self.state.stack.len()
    }

    fn mismatch(&self, index: i32, expected: &'static str) -> Error {
        let found = if self.exists(index) {
            self.value_at(index).type_name()
        } else {
            "no value"
        };
        Error::TypeMismatch { index, expected, found }
    }

    // ===== Stack shape =====

    /// Number of values in the current frame
    #[must_use]
    pub fn top(&self) -> usize {
        self.state.stack.len() - self.stack_base()
    }

    /// Grow with nils or shrink to exactly `count` values
    pub fn set_top(&mut self, count: usize) {
        let base = self.stack_base();
        self.state.stack.resize(base + count, Value::Nil);
    }

    /// Remove `count` values from the top
    pub fn pop(&mut self, count: usize) {
        let top = self.top();
        assert!(count <= top, "cannot pop {count} values from a frame of {top}");
        let len = self.state.stack.len() - count;
        self.state.stack.truncate(len);
    }

    pub fn duplicate(&mut self, index: i32) {
        let value = self.value_at(index);
        self.state.stack.push(value);
    }

    /// Overwrite the top value with a copy of the value at `index`
    pub fn copy_to_top(&mut self, index: i32) {
        let value = self.value_at(index);
        let top = self.abs_index(-1);
        self.state.stack[top] = value;
    }

    /// Move the top value into `index`, shifting values above it up
    pub fn insert(&mut self, index: i32) {
        let slot = self.abs_index(index);
        let value = self.state.stack.pop().unwrap_or_default();
        self.state.stack.insert(slot, value);
    }

    pub fn remove(&mut self, index: i32) {
        let slot = self.abs_index(index);
        self.state.stack.remove(slot);
    }

    /// Pop the top value into `index`
    pub fn replace(&mut self, index: i32) {
        let slot = self.abs_index(index);
        let value = self.state.stack.pop().unwrap_or_default();
        if let Some(target) = self.state.stack.get_mut(slot) {
            *target = value;
        }
    }

    // ===== Pushing =====

    pub fn push_value(&mut self, value: Value) {
        self.state.stack.push(value);
    }

    pub fn push_nil(&mut self) {
        self.push_value(Value::Nil);
    }

    pub fn push_boolean(&mut self, b: bool) {
        self.push_value(Value::Boolean(b));
    }

    pub fn push_number(&mut self, n: f64) {
        self.push_value(Value::Number(n));
    }

    pub fn push_integer(&mut self, i: i32) {
        self.push_value(Value::Integer(i));
    }

    pub fn push_unsigned(&mut self, u: u32) {
        self.push_value(Value::UnsignedInteger(u));
    }

    pub fn push_vector(&mut self, v: Vector) {
        self.push_value(Value::Vector(v));
    }

    pub fn push_light_userdata(&mut self, p: usize) {
        self.push_value(Value::LightUserdata(p));
    }

    pub fn push_string(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let handle = self.heap.intern(bytes);
        self.push_value(Value::String(handle));
        self.after_alloc();
    }

    /// Push a host function; `name` shows up in tracebacks and argument errors
    pub fn push_function(&mut self, name: &str, f: impl Fn(&mut VM) -> VmResult<usize> + 'static) {
        let function = self.alloc_native(name, Rc::new(f), Vec::new(), None);
        self.push_value(function);
        self.after_alloc();
    }

    /// Push a host function capturing the top `nupvalues` values
    pub fn push_closure(
        &mut self,
        name: &str,
        f: impl Fn(&mut VM) -> VmResult<usize> + 'static,
        nupvalues: usize,
    ) {
        assert!(nupvalues <= self.top(), "not enough values for {nupvalues} upvalues");
        let at = self.state.stack.len() - nupvalues;
        let upvalues: Vec<Value> = self.state.stack[at..].to_vec();
        let function = self.alloc_native(name, Rc::new(f), upvalues, None);
        self.state.stack.truncate(at);
        self.push_value(function);
        self.after_alloc();
    }

    /// Upvalue `index` (1-based) of the running native function
    #[must_use]
    pub fn upvalue(&self, index: usize) -> Value {
        let Some(frame) = self.state.frames.last() else {
            return Value::Nil;
        };
        match self.heap.function(frame.function) {
            crate::value::Function::Native(native) => {
                index.checked_sub(1).and_then(|i| native.upvalues.get(i)).copied().unwrap_or_default()
            }
            crate::value::Function::Lua(_) => Value::Nil,
        }
    }

    pub fn set_upvalue(&mut self, index: usize, value: Value) {
        let Some(function) = self.state.frames.last().map(|frame| frame.function) else {
            return;
        };
        if let crate::value::Function::Native(native) = self.heap.function_mut(function) {
            if let Some(slot) = index.checked_sub(1).and_then(|i| native.upvalues.get_mut(i)) {
                *slot = value;
            }
        }
        self.heap.barrier(function, value);
    }

    pub fn new_table(&mut self) {
        self.create_table(0, 0);
    }

    /// New table with preallocated array and hash parts
    pub fn create_table(&mut self, array: usize, hash: usize) {
        let handle = self.heap.new_table(array, hash);
        self.push_value(Value::Table(handle));
        self.after_alloc();
    }

    /// Push a full userdata owning `data`; `destructor` runs once when it is freed
    pub fn new_userdata(&mut self, tag: i32, data: Vec<u8>, destructor: Option<Destructor>) {
        let handle = self.heap.alloc(Object::Userdata(Userdata {
            tag,
            data,
            destructor,
            metatable: None,
        }));
        self.push_value(Value::Userdata(handle));
        self.after_alloc();
    }

    /// Push a zero-filled buffer
    pub fn new_buffer(&mut self, len: usize) {
        self.push_buffer(&vec![0; len]);
    }

    pub fn push_buffer(&mut self, bytes: &[u8]) {
        let handle = self.heap.alloc(Object::Buffer(bytes.to_vec()));
        self.push_value(Value::Buffer(handle));
        self.after_alloc();
    }

    /// Replace the function on top with a new suspended coroutine running it
    pub fn new_thread(&mut self) -> VmResult<()> {
        let function = self.value_at(-1);
        if !matches!(function, Value::Function(_)) {
            return Err(self.mismatch(-1, "function"));
        }
        let handle = self.heap.alloc(Object::Thread(ThreadObject {
            state: Some(Box::new(ThreadState::with_function(function))),
            status: ThreadStatus::Suspended,
        }));
        let top = self.abs_index(-1);
        self.state.stack[top] = Value::Thread(handle);
        self.after_alloc();
        Ok(())
    }

    // ===== Reading =====

    /// Type of the value at `index`; positions above the top read as nil
    #[must_use]
    pub fn type_of(&self, index: i32) -> Tag {
        self.value_at(index).tag()
    }

    #[must_use]
    pub fn type_name(&self, index: i32) -> &'static str {
        self.value_at(index).type_name()
    }

    #[must_use]
    pub fn read(&self, index: i32) -> Value {
        self.value_at(index)
    }

    /// Strict boolean read
    pub fn to_boolean(&self, index: i32) -> VmResult<bool> {
        match self.value_at(index) {
            Value::Boolean(b) => Ok(b),
            _ => Err(self.mismatch(index, "boolean")),
        }
    }

    /// Truthiness of any value
    #[must_use]
    pub fn is_truthy(&self, index: i32) -> bool {
        self.value_at(index).is_truthy()
    }

    pub fn to_number(&self, index: i32) -> VmResult<f64> {
        self.value_at(index)
            .as_number()
            .ok_or_else(|| self.mismatch(index, "number"))
    }

    /// Number read that also accepts numeric strings
    pub fn to_number_converting(&self, index: i32) -> VmResult<f64> {
        self.coerce_number(self.value_at(index))
            .ok_or_else(|| self.mismatch(index, "number"))
    }

    /// Exact 32-bit integer read
    pub fn to_integer(&self, index: i32) -> VmResult<i32> {
        let exact = match self.value_at(index) {
            Value::Integer(i) => Some(i),
            Value::UnsignedInteger(u) => i32::try_from(u).ok(),
            Value::Number(n) if n.fract() == 0.0 && n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX) => {
                Some(n as i32)
            }
            _ => None,
        };
        exact.ok_or_else(|| self.mismatch(index, "integer"))
    }

    /// Integer read that truncates numbers and accepts numeric strings
    pub fn to_integer_converting(&self, index: i32) -> VmResult<i32> {
        match self.value_at(index) {
            Value::Integer(i) => Ok(i),
            other => self
                .coerce_number(other)
                .map(f64::trunc)
                .filter(|n| *n >= f64::from(i32::MIN) && *n <= f64::from(i32::MAX))
                .map(|n| n as i32)
                .ok_or_else(|| self.mismatch(index, "integer")),
        }
    }

    pub fn to_unsigned(&self, index: i32) -> VmResult<u32> {
        let exact = match self.value_at(index) {
            Value::UnsignedInteger(u) => Some(u),
            Value::Integer(i) => u32::try_from(i).ok(),
            Value::Number(n) if n.fract() == 0.0 && n >= 0.0 && n <= f64::from(u32::MAX) => Some(n as u32),
            _ => None,
        };
        exact.ok_or_else(|| self.mismatch(index, "unsigned integer"))
    }

    /// String read; invalid UTF-8 is replaced
    pub fn to_str(&self, index: i32) -> VmResult<String> {
        match self.value_at(index) {
            Value::String(h) => Ok(String::from_utf8_lossy(self.heap.string(h)).into_owned()),
            _ => Err(self.mismatch(index, "string")),
        }
    }

    pub fn to_bytes(&self, index: i32) -> VmResult<&[u8]> {
        match self.value_at(index) {
            Value::String(h) => Ok(self.heap.string(h)),
            _ => Err(self.mismatch(index, "string")),
        }
    }

    /// `tostring` of any value, honoring `__tostring`
    pub fn to_string_converting(&mut self, index: i32) -> VmResult<String> {
        let value = self.value_at(index);
        let text = self.tostring_value(value)?;
        Ok(self.display_value(text))
    }

    pub fn to_vector(&self, index: i32) -> VmResult<Vector> {
        match self.value_at(index) {
            Value::Vector(v) => Ok(v),
            _ => Err(self.mismatch(index, "vector")),
        }
    }

    pub fn to_userdata(&self, index: i32) -> VmResult<&[u8]> {
        match self.value_at(index) {
            Value::Userdata(h) => Ok(self.heap.userdata(h).data.as_slice()),
            _ => Err(self.mismatch(index, "userdata")),
        }
    }

    pub fn to_userdata_mut(&mut self, index: i32) -> VmResult<&mut [u8]> {
        match self.value_at(index) {
            Value::Userdata(h) => Ok(self.heap.userdata_mut(h).data.as_mut_slice()),
            _ => Err(self.mismatch(index, "userdata")),
        }
    }

    pub fn userdata_tag(&self, index: i32) -> VmResult<i32> {
        match self.value_at(index) {
            Value::Userdata(h) => Ok(self.heap.userdata(h).tag),
            _ => Err(self.mismatch(index, "userdata")),
        }
    }

    pub fn to_buffer(&self, index: i32) -> VmResult<&[u8]> {
        match self.value_at(index) {
            Value::Buffer(h) => Ok(self.heap.buffer(h).as_slice()),
            _ => Err(self.mismatch(index, "buffer")),
        }
    }

    pub fn to_buffer_mut(&mut self, index: i32) -> VmResult<&mut [u8]> {
        match self.value_at(index) {
            Value::Buffer(h) => Ok(self.heap.buffer_mut(h).as_mut_slice()),
            _ => Err(self.mismatch(index, "buffer")),
        }
    }

    pub fn to_light_userdata(&self, index: i32) -> VmResult<usize> {
        match self.value_at(index) {
            Value::LightUserdata(p) => Ok(p),
            _ => Err(self.mismatch(index, "light userdata")),
        }
    }

    /// Length without `__len`: bytes of strings and buffers, border of tables
    #[must_use]
    pub fn raw_len(&self, index: i32) -> usize {
        match self.value_at(index) {
            Value::String(h) => self.heap.string(h).len(),
            Value::Buffer(h) => self.heap.buffer(h).len(),
            Value::Table(h) => self.heap.table(h).len(),
            Value::Userdata(h) => self.heap.userdata(h).data.len(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        self.value_at(a).raw_equal(&self.value_at(b))
    }

    // ===== Tables =====

    fn table_at(&self, index: i32) -> VmResult<Handle> {
        match self.value_at(index) {
            Value::Table(h) => Ok(h),
            _ => Err(self.mismatch(index, "table")),
        }
    }

    /// Push `t[name]`, honoring `__index`
    pub fn get_field(&mut self, index: i32, name: &str) -> VmResult<Tag> {
        let object = self.value_at(index);
        let key = Value::String(self.heap.intern(name.as_bytes()));
        let value = self.index_value(object, key)?;
        self.push_value(value);
        Ok(value.tag())
    }

    /// Pop a value into `t[name]`, honoring `__newindex`
    pub fn set_field(&mut self, index: i32, name: &str) -> VmResult<()> {
        let object = self.value_at(index);
        let value = self.value_at(-1);
        let key = Value::String(self.heap.intern(name.as_bytes()));
        self.set_index(object, key, value)?;
        self.pop(1);
        Ok(())
    }

    /// Pop a key, push `t[key]`
    pub fn get_table(&mut self, index: i32) -> VmResult<Tag> {
        let object = self.value_at(index);
        let key = self.value_at(-1);
        let value = self.index_value(object, key)?;
        let top = self.abs_index(-1);
        self.state.stack[top] = value;
        Ok(value.tag())
    }

    /// Pop a value and a key, store `t[key] = value`
    pub fn set_table(&mut self, index: i32) -> VmResult<()> {
        let object = self.value_at(index);
        let key = self.value_at(-2);
        let value = self.value_at(-1);
        self.set_index(object, key, value)?;
        self.pop(2);
        Ok(())
    }

    /// Pop a key, push the raw value
    pub fn raw_get(&mut self, index: i32) -> VmResult<Tag> {
        let table = self.table_at(index)?;
        let key = self.value_at(-1);
        let value = self.heap.table(table).get(&key);
        let top = self.abs_index(-1);
        self.state.stack[top] = value;
        Ok(value.tag())
    }

    /// Pop a value and a key, store without metamethods
    pub fn raw_set(&mut self, index: i32) -> VmResult<()> {
        let table = self.table_at(index)?;
        let key = self.value_at(-2);
        let value = self.value_at(-1);
        self.raw_store(table, key, value)?;
        self.pop(2);
        Ok(())
    }

    pub fn raw_get_index(&mut self, index: i32, n: i64) -> VmResult<Tag> {
        let table = self.table_at(index)?;
        let value = self.heap.table(table).get_int(n);
        self.push_value(value);
        Ok(value.tag())
    }

    /// Pop a value into `t[n]` without metamethods
    pub fn raw_set_index(&mut self, index: i32, n: i64) -> VmResult<()> {
        let table = self.table_at(index)?;
        let value = self.value_at(-1);
        self.raw_store(table, Value::Number(n as f64), value)?;
        self.pop(1);
        Ok(())
    }

    /// Pop a key and push the next key and value; returns `false` at the end
    pub fn next(&mut self, index: i32) -> VmResult<bool> {
        let table = self.table_at(index)?;
        let key = self.value_at(-1);
        self.pop(1);
        match self.heap.table(table).next(&key) {
            Ok(Some((k, v))) => {
                self.push_value(k);
                self.push_value(v);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => Err(self.runtime_error(err.to_string())),
        }
    }

    /// Push the metatable if there is one
    pub fn get_metatable(&mut self, index: i32) -> bool {
        match self.metatable_of(self.value_at(index)) {
            Some(mt) => {
                self.push_value(Value::Table(mt));
                true
            }
            None => false,
        }
    }

    /// Pop a table (or nil) and make it the metatable of the value at `index`
    pub fn set_metatable(&mut self, index: i32) -> VmResult<()> {
        let target = self.value_at(index);
        let metatable = match self.value_at(-1) {
            Value::Table(h) => Some(h),
            Value::Nil => None,
            _ => return Err(self.mismatch(-1, "table or nil")),
        };
        self.assign_metatable(target, metatable)?;
        self.pop(1);
        Ok(())
    }

    pub(crate) fn assign_metatable(&mut self, target: Value, metatable: Option<Handle>) -> VmResult<()> {
        match target {
            Value::Table(h) => {
                if self.heap.table(h).readonly {
                    return Err(self.runtime_error("attempt to modify a readonly table"));
                }
                self.heap.table_mut(h).metatable = metatable;
            }
            Value::Userdata(h) => self.heap.userdata_mut(h).metatable = metatable,
            Value::String(_) => self.string_meta = metatable,
            other => {
                return Err(self.runtime_error(format!("cannot set the metatable of a {} value", other.type_name())))
            }
        }
        if let (Some(container), Some(mt)) = (target.handle(), metatable) {
            self.heap.barrier_handle(container, mt);
        }
        Ok(())
    }

    pub fn set_readonly(&mut self, index: i32, readonly: bool) -> VmResult<()> {
        let table = self.table_at(index)?;
        self.heap.table_mut(table).readonly = readonly;
        Ok(())
    }

    #[must_use]
    pub fn is_readonly(&self, index: i32) -> bool {
        match self.value_at(index) {
            Value::Table(h) => self.heap.table(h).readonly,
            _ => false,
        }
    }

    // ===== Globals =====

    pub fn get_global(&mut self, name: &str) -> VmResult<Tag> {
        let key = Value::String(self.heap.intern(name.as_bytes()));
        let value = self.index_value(Value::Table(self.globals), key)?;
        self.push_value(value);
        Ok(value.tag())
    }

    /// Pop a value into the global `name`
    pub fn set_global(&mut self, name: &str) -> VmResult<()> {
        let value = self.value_at(-1);
        let key = Value::String(self.heap.intern(name.as_bytes()));
        self.set_index(Value::Table(self.globals), key, value)?;
        self.pop(1);
        Ok(())
    }

    /// Define a global host function
    pub fn register(&mut self, name: &str, f: impl Fn(&mut VM) -> VmResult<usize> + 'static) -> VmResult<()> {
        self.push_function(name, f);
        self.set_global(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_read_back() {
        let mut vm = VM::new();
        vm.push_number(1.5);
        vm.push_integer(-7);
        vm.push_unsigned(7);
        vm.push_boolean(true);
        vm.push_string("héllo");
        vm.push_vector(Vector::new(1.0, 2.0, 3.0));
        vm.push_light_userdata(0xdead);
        assert_eq!(vm.top(), 7);
        assert_eq!(vm.to_number(1).unwrap(), 1.5);
        assert_eq!(vm.to_integer(2).unwrap(), -7);
        assert_eq!(vm.type_of(2), Tag::Integer);
        assert_eq!(vm.to_unsigned(3).unwrap(), 7);
        assert_eq!(vm.type_of(3), Tag::UnsignedInteger);
        assert!(vm.to_boolean(4).unwrap());
        assert_eq!(vm.to_str(5).unwrap(), "héllo");
        assert_eq!(vm.to_vector(-2).unwrap(), Vector::new(1.0, 2.0, 3.0));
        assert_eq!(vm.to_light_userdata(-1).unwrap(), 0xdead);
    }

    #[test]
    fn test_type_mismatch_reports_index() {
        let mut vm = VM::new();
        vm.push_string("x");
        match vm.to_number(1) {
            Err(Error::TypeMismatch { index, expected, found }) => {
                assert_eq!(index, 1);
                assert_eq!(expected, "number");
                assert_eq!(found, "string");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            vm.to_boolean(4),
            Err(Error::TypeMismatch { found: "no value", .. })
        ));
    }

    #[test]
    fn test_converting_reads() {
        let mut vm = VM::new();
        vm.push_string("  42  ");
        vm.push_number(3.9);
        vm.push_nil();
        assert_eq!(vm.to_number_converting(1).unwrap(), 42.0);
        assert!(vm.to_number(1).is_err());
        assert_eq!(vm.to_integer_converting(2).unwrap(), 3);
        assert!(vm.to_integer(2).is_err());
        assert_eq!(vm.to_string_converting(2).unwrap(), "3.9");
        assert_eq!(vm.to_string_converting(3).unwrap(), "nil");

        vm.push_number(-7.5);
        assert_eq!(vm.to_integer_converting(-1).unwrap(), -7);
        vm.push_number(1e20);
        assert!(vm.to_integer_converting(-1).is_err());
        vm.push_string("99999999999");
        assert!(vm.to_integer_converting(-1).is_err());
        vm.push_unsigned(u32::MAX);
        assert!(vm.to_integer_converting(-1).is_err());
        vm.push_number(f64::INFINITY);
        assert!(vm.to_integer_converting(-1).is_err());
        vm.push_number(f64::NAN);
        assert!(vm.to_integer_converting(-1).is_err());
    }

    #[test]
    fn test_stack_shuffles() {
        let mut vm = VM::new();
        for n in 1..=4 {
            vm.push_number(f64::from(n));
        }
        vm.insert(1); // 4 1 2 3
        assert_eq!(vm.to_number(1).unwrap(), 4.0);
        vm.remove(2); // 4 2 3
        assert_eq!(vm.top(), 3);
        vm.duplicate(1); // 4 2 3 4
        assert_eq!(vm.to_number(-1).unwrap(), 4.0);
        vm.copy_to_top(2); // 4 2 3 2
        assert_eq!(vm.to_number(-1).unwrap(), 2.0);
        assert_eq!(vm.top(), 4);
        vm.push_number(9.0);
        vm.replace(1); // 9 2 3 2
        assert_eq!(vm.to_number(1).unwrap(), 9.0);
        assert_eq!(vm.top(), 4);
        vm.set_top(1);
        assert_eq!(vm.top(), 1);
        vm.set_top(3);
        assert!(vm.read(3).is_nil());
    }

    #[test]
    #[should_panic(expected = "stack index 0")]
    fn test_index_zero_panics() {
        let vm = VM::new();
        let _ = vm.abs_index(0);
    }

    #[test]
    fn test_table_accessors() {
        let mut vm = VM::new();
        vm.new_table();
        vm.push_number(5.0);
        vm.set_field(1, "five").unwrap();
        vm.push_string("k");
        vm.push_boolean(true);
        vm.raw_set(1).unwrap();
        vm.push_string("v");
        vm.raw_set_index(1, 1).unwrap();
        assert_eq!(vm.top(), 1);

        assert_eq!(vm.get_field(1, "five").unwrap(), Tag::Number);
        vm.push_string("k");
        assert_eq!(vm.raw_get(1).unwrap(), Tag::Boolean);
        assert_eq!(vm.raw_get_index(1, 1).unwrap(), Tag::String);
        assert_eq!(vm.raw_len(1), 1);
        vm.pop(3);

        let mut count = 0;
        vm.push_nil();
        while vm.next(1).unwrap() {
            count += 1;
            vm.pop(1);
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_readonly_table_rejects_writes() {
        let mut vm = VM::new();
        vm.new_table();
        vm.set_readonly(1, true).unwrap();
        assert!(vm.is_readonly(1));
        vm.push_number(1.0);
        let err = vm.set_field(1, "x").unwrap_err();
        assert!(err.to_string().contains("attempt to modify a readonly table"));
    }

    #[test]
    fn test_metatable_round_trip() {
        let mut vm = VM::new();
        vm.new_table();
        assert!(!vm.get_metatable(1));
        vm.new_table();
        vm.set_metatable(1).unwrap();
        assert!(vm.get_metatable(1));
        assert_eq!(vm.type_of(-1), Tag::Table);
    }

    #[test]
    fn test_register_and_call_host_function() {
        let mut vm = VM::new();
        vm.register("add", |vm| {
            let a = vm.check_number(1)?;
            let b = vm.check_number(2)?;
            vm.push_number(a + b);
            Ok(1)
        })
        .unwrap();
        vm.do_string("result = add(2, 3)").unwrap();
        vm.get_global("result").unwrap();
        assert_eq!(vm.to_number(-1).unwrap(), 5.0);
    }

    #[test]
    fn test_native_closure_upvalues() {
        let mut vm = VM::new();
        vm.push_number(0.0);
        vm.push_closure(
            "counter",
            |vm| {
                let n = vm.upvalue(1).as_number().unwrap_or(0.0) + 1.0;
                vm.set_upvalue(1, Value::Number(n));
                vm.push_number(n);
                Ok(1)
            },
            1,
        );
        vm.set_global("counter").unwrap();
        vm.do_string("counter() counter()").unwrap();
        let n = vm.do_string("return counter()").unwrap();
        assert_eq!(n, 1);
        assert_eq!(vm.to_number(-1).unwrap(), 3.0);
    }

    #[test]
    fn test_userdata_and_buffers() {
        let mut vm = VM::new();
        vm.new_userdata(7, vec![1, 2, 3], None);
        assert_eq!(vm.userdata_tag(1).unwrap(), 7);
        vm.to_userdata_mut(1).unwrap()[0] = 9;
        assert_eq!(vm.to_userdata(1).unwrap(), &[9, 2, 3]);
        assert_eq!(vm.type_name(1), "userdata");

        vm.new_buffer(4);
        vm.to_buffer_mut(2).unwrap()[3] = 0xff;
        assert_eq!(vm.to_buffer(2).unwrap(), &[0, 0, 0, 0xff]);
        assert_eq!(vm.raw_len(2), 4);
    }
}
