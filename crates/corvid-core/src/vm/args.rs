//! Argument checking for native functions
//!
//! The `check_*` helpers raise the conventional
//! `bad argument #n to 'name' (...)` errors, naming the running native.

use super::{Error, VmResult, VM};
use crate::gc::Handle;
use crate::value::Value;

impl VM {
    /// Argument `n` (1-based) of the running native; nil when absent
    #[must_use]
    pub fn arg(&self, n: usize) -> Value {
        let slot = self.stack_base() + n - 1;
        self.state.stack.get(slot).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.top()
    }

    pub fn check_arg_count(&mut self, n: usize) -> VmResult<()> {
        let top = self.top();
        if top < n {
            return Err(self.runtime_error(format!("expected at least {n} arguments, got {top}")));
        }
        Ok(())
    }

    fn native_name(&self) -> String {
        self.state
            .frames
            .last()
            .and_then(|frame| self.heap.function(frame.function).name())
            .unwrap_or("?")
            .to_string()
    }

    /// A `bad argument` error for argument `arg` of the running native
    pub fn arg_error(&mut self, arg: usize, message: &str) -> Error {
        let name = self.native_name();
        self.runtime_error(format!("bad argument #{arg} to '{name}' ({message})"))
    }

    fn type_error(&mut self, arg: usize, expected: &str) -> Error {
        let found = if arg > self.top() {
            "no value".to_string()
        } else {
            self.type_name_of(self.arg(arg))
        };
        self.arg_error(arg, &format!("{expected} expected, got {found}"))
    }

    /// Any value, including nil, but not a missing one
    pub fn check_any(&mut self, arg: usize) -> VmResult<Value> {
        if arg > self.top() {
            return Err(self.arg_error(arg, "value expected"));
        }
        Ok(self.arg(arg))
    }

    /// A number, converting numeric strings
    pub fn check_number(&mut self, arg: usize) -> VmResult<f64> {
        match self.coerce_number(self.arg(arg)) {
            Some(n) => Ok(n),
            None => Err(self.type_error(arg, "number")),
        }
    }

    /// A number truncated toward zero
    pub fn check_integer(&mut self, arg: usize) -> VmResult<i64> {
        let n = self.check_number(arg)?;
        if n.is_nan() {
            return Err(self.arg_error(arg, "number has no integer representation"));
        }
        Ok(n as i64)
    }

    /// String bytes; numbers convert to their text
    pub fn check_string(&mut self, arg: usize) -> VmResult<Vec<u8>> {
        match self.arg(arg) {
            Value::String(h) => Ok(self.heap.string(h).to_vec()),
            value if value.is_number() => Ok(self.display_value(value).into_bytes()),
            _ => Err(self.type_error(arg, "string")),
        }
    }

    pub fn check_str(&mut self, arg: usize) -> VmResult<String> {
        let bytes = self.check_string(arg)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn check_table(&mut self, arg: usize) -> VmResult<Handle> {
        match self.arg(arg) {
            Value::Table(h) => Ok(h),
            _ => Err(self.type_error(arg, "table")),
        }
    }

    pub fn check_boolean(&mut self, arg: usize) -> VmResult<bool> {
        match self.arg(arg) {
            Value::Boolean(b) => Ok(b),
            _ => Err(self.type_error(arg, "boolean")),
        }
    }

    pub fn check_buffer(&mut self, arg: usize) -> VmResult<Handle> {
        match self.arg(arg) {
            Value::Buffer(h) => Ok(h),
            _ => Err(self.type_error(arg, "buffer")),
        }
    }

    pub fn check_thread(&mut self, arg: usize) -> VmResult<Handle> {
        match self.arg(arg) {
            Value::Thread(h) => Ok(h),
            _ => Err(self.type_error(arg, "thread")),
        }
    }

    pub fn check_function(&mut self, arg: usize) -> VmResult<Value> {
        match self.arg(arg) {
            value @ Value::Function(_) => Ok(value),
            _ => Err(self.type_error(arg, "function")),
        }
    }

    pub fn opt_number(&mut self, arg: usize, default: f64) -> VmResult<f64> {
        if self.arg(arg).is_nil() {
            Ok(default)
        } else {
            self.check_number(arg)
        }
    }

    pub fn opt_integer(&mut self, arg: usize, default: i64) -> VmResult<i64> {
        if self.arg(arg).is_nil() {
            Ok(default)
        } else {
            self.check_integer(arg)
        }
    }
}
