//! Calls, returns and error recovery
//!
//! Script-to-script calls push a frame and stay inside the dispatch loop.
//! Natives run on the Rust stack inside a native frame. `pcall` and
//! `xpcall` install a [`Protect`] record on the callee's frame instead of
//! recursing, so the loop can recover from errors and coroutines can yield
//! through them. Everything that must re-enter the loop from Rust
//! (metamethods, host calls) goes through [`VM::call_at`], which counts as
//! a native boundary for yields.

use std::rc::Rc;

use super::{CallFrame, Error, Protect, VmResult, VM};
use crate::bytecode::MULTI;
use crate::gc::Handle;
use crate::value::{Function, LoadedProto, NativeFn, Value};

/// Builtins implemented by the call path itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    PCall,
    XPCall,
    Yield,
}

/// How a call set-up left the machine
pub(crate) enum CallOutcome {
    /// A script frame was pushed and the loop should run it
    Lua,
    /// A native ran to completion; results are in place
    Done,
    /// The running coroutine yielded
    Yield,
}

/// How a dispatch loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecOutcome {
    Finished,
    Yielded,
}

const MAX_CALL_CHAIN: usize = 100;

enum Callee {
    Lua(Rc<LoadedProto>),
    Native(NativeFn, Option<Intrinsic>),
}

impl VM {
    /// Replace non-function callees by their `__call` handlers
    fn resolve_callable(&mut self, func: usize) -> VmResult<(Handle, Callee)> {
        for _ in 0..MAX_CALL_CHAIN {
            let callee = self.state.stack[func];
            if let Value::Function(handle) = callee {
                let callee = match self.heap.function(handle) {
                    Function::Lua(closure) => Callee::Lua(Rc::clone(&closure.proto)),
                    Function::Native(native) => Callee::Native(Rc::clone(&native.func), native.intrinsic),
                };
                return Ok((handle, callee));
            }
            let handler = self.metamethod(callee, super::Event::Call);
            if handler.is_nil() {
                let name = self.type_name_of(callee);
                return Err(self.runtime_error(format!("attempt to call a {name} value")));
            }
            self.state.stack.insert(func, handler);
        }
        Err(self.runtime_error("'__call' chain too long; possible loop"))
    }

    /// Set up a call of the value at `func` with everything above it as arguments
    pub(crate) fn prepare_call(&mut self, func: usize, nresults: u8) -> VmResult<CallOutcome> {
        let (handle, callee) = self.resolve_callable(func)?;
        match callee {
            Callee::Lua(proto) => {
                self.push_lua_frame(func, handle, proto, nresults, None)?;
                Ok(CallOutcome::Lua)
            }
            Callee::Native(_, Some(intrinsic)) => self.call_intrinsic(intrinsic, func, nresults),
            Callee::Native(f, None) => {
                self.call_native(func, handle, &f, nresults)?;
                Ok(CallOutcome::Done)
            }
        }
    }

    fn push_lua_frame(
        &mut self,
        func: usize,
        function: Handle,
        proto: Rc<LoadedProto>,
        nresults: u8,
        protect: Option<Protect>,
    ) -> VmResult<()> {
        if self.state.frames.len() >= self.config.max_call_depth {
            return Err(self.runtime_error("stack overflow"));
        }
        let nargs = self.state.stack.len() - func - 1;
        let params = usize::from(proto.num_params);
        let varargs = if proto.is_vararg && nargs > params {
            self.state.stack.split_off(func + 1 + params)
        } else {
            Vec::new()
        };
        self.state.stack.resize(func + 1 + params, Value::Nil);
        if self.state.stack.len() + usize::from(proto.max_stack) > self.config.max_stack_slots {
            return Err(self.runtime_error("stack overflow"));
        }
        self.state.frames.push(CallFrame {
            function,
            proto: Some(proto),
            ip: 0,
            base: func,
            nresults,
            varargs,
            multi: 0,
            protect,
        });
        Ok(())
    }

    fn call_native(&mut self, func: usize, function: Handle, f: &NativeFn, nresults: u8) -> VmResult<()> {
        if self.state.frames.len() >= self.config.max_call_depth {
            return Err(self.runtime_error("stack overflow"));
        }
        self.state.frames.push(CallFrame::native(function, func, nresults));
        let count = f(self)?;
        self.state.frames.pop();

        let top = self.state.stack.len();
        let count = count.min(top.saturating_sub(func + 1));
        self.state.stack.copy_within(top - count..top, func);
        self.state.stack.truncate(func + count);
        self.adjust_results(func, count, nresults);
        Ok(())
    }

    /// Pad or cut results starting at `dest`, or record an open-ended count
    pub(crate) fn adjust_results(&mut self, dest: usize, count: usize, wanted: u8) {
        if wanted == MULTI {
            if let Some(frame) = self.state.frames.last_mut() {
                frame.multi = count;
            }
        } else {
            self.state.stack.resize(dest + usize::from(wanted), Value::Nil);
        }
    }

    fn call_intrinsic(&mut self, intrinsic: Intrinsic, func: usize, nresults: u8) -> VmResult<CallOutcome> {
        let nargs = self.state.stack.len() - func - 1;
        match intrinsic {
            Intrinsic::PCall => {
                if nargs == 0 {
                    return Err(self.runtime_error("bad argument #1 to 'pcall' (value expected)"));
                }
                let protect = Protect {
                    result_slot: func,
                    nresults,
                    handler: None,
                };
                self.protected_dispatch(func, protect)
            }
            Intrinsic::XPCall => {
                if nargs < 2 {
                    return Err(self.runtime_error("bad argument #2 to 'xpcall' (value expected)"));
                }
                // [xpcall f handler args..] -> [handler f args..]; the handler
                // stays rooted in the result slot until the call finishes
                let handler = self.state.stack.remove(func + 2);
                self.state.stack[func] = handler;
                let protect = Protect {
                    result_slot: func,
                    nresults,
                    handler: Some(handler),
                };
                self.protected_dispatch(func, protect)
            }
            Intrinsic::Yield => {
                if self.resumers.is_empty() {
                    return Err(self.runtime_error("attempt to yield from outside a coroutine"));
                }
                if self.state.nny > 0 {
                    return Err(self.runtime_error("attempt to yield across a native call boundary"));
                }
                self.state.yield_target = Some((func, nresults));
                Ok(CallOutcome::Yield)
            }
        }
    }

    /// Call the value above `protect.result_slot` under a recovery point
    fn protected_dispatch(&mut self, func: usize, protect: Protect) -> VmResult<CallOutcome> {
        let callee_slot = func + 1;
        let (handle, callee) = match self.resolve_callable(callee_slot) {
            Ok(resolved) => resolved,
            Err(err) => return self.recover_in_place(protect, err),
        };
        match callee {
            Callee::Lua(proto) => {
                match self.push_lua_frame(callee_slot, handle, proto, MULTI, Some(protect.clone())) {
                    Ok(()) => Ok(CallOutcome::Lua),
                    Err(err) => self.recover_in_place(protect, err),
                }
            }
            Callee::Native(f, intrinsic) => {
                let depth = self.state.frames.len();
                self.state.nny += 1;
                let result = match intrinsic {
                    Some(intrinsic) => match self.call_intrinsic(intrinsic, callee_slot, MULTI) {
                        Ok(CallOutcome::Lua) => self.execute(depth).map(|_| ()),
                        Ok(_) => Ok(()),
                        Err(err) => Err(err),
                    },
                    None => self.call_native(callee_slot, handle, &f, MULTI),
                };
                self.state.nny -= 1;
                match result {
                    Ok(()) => {
                        let count = self.state.stack.len() - callee_slot;
                        self.state.stack[func] = Value::Boolean(true);
                        self.adjust_results(func, count + 1, protect.nresults);
                        Ok(CallOutcome::Done)
                    }
                    Err(err) => {
                        self.close_upvalues(callee_slot);
                        self.state.frames.truncate(depth);
                        self.recover_in_place(protect, err)
                    }
                }
            }
        }
    }

    fn recover_in_place(&mut self, protect: Protect, err: Error) -> VmResult<CallOutcome> {
        if !err.is_catchable() {
            return Err(err);
        }
        let value = self.error_value_of(err);
        self.finish_protected_error(&protect, value)?;
        Ok(CallOutcome::Done)
    }

    /// Leave `false, err` (or the handler's result) in a protect record's result slot
    fn finish_protected_error(&mut self, protect: &Protect, value: Value) -> VmResult<()> {
        let slot = protect.result_slot;
        self.close_upvalues(slot);
        self.state.stack.truncate(slot);
        let value = match protect.handler {
            Some(handler) => {
                self.state.stack.push(handler);
                self.state.stack.push(value);
                match self.call_at(slot, 1) {
                    Ok(()) => self.state.stack.get(slot).copied().unwrap_or_default(),
                    Err(err) if err.is_catchable() => Value::String(self.heap.intern(b"error in error handling")),
                    Err(err) => return Err(err),
                }
            }
            None => value,
        };
        self.state.stack.truncate(slot);
        self.state.stack.push(Value::Boolean(false));
        self.state.stack.push(value);
        self.adjust_results(slot, 2, protect.nresults);
        Ok(())
    }

    /// Finish a returning frame: move `count` values from the top to the
    /// frame's result slot.
    pub(crate) fn return_from(&mut self, frame: CallFrame, count: usize) {
        self.close_upvalues(frame.base);
        let top = self.state.stack.len();
        let src = top - count;
        match frame.protect {
            Some(protect) => {
                let dest = protect.result_slot;
                self.state.stack[dest] = Value::Boolean(true);
                self.state.stack.copy_within(src..top, dest + 1);
                self.state.stack.truncate(dest + 1 + count);
                self.adjust_results(dest, count + 1, protect.nresults);
            }
            None => {
                self.state.stack.copy_within(src..top, frame.base);
                self.state.stack.truncate(frame.base + count);
                self.adjust_results(frame.base, count, frame.nresults);
            }
        }
    }

    /// Run the dispatch loop until the frame count drops to `stop`,
    /// recovering at protected frames above it.
    pub(crate) fn execute(&mut self, stop: usize) -> VmResult<ExecOutcome> {
        loop {
            let err = match self.run(stop) {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            if !err.is_catchable() {
                return Err(err);
            }
            let Some(index) = (stop..self.state.frames.len())
                .rev()
                .find(|&i| self.state.frames[i].protect.is_some())
            else {
                return Err(err);
            };
            let value = self.error_value_of(err);
            let Some(protect) = self.state.frames[index].protect.clone() else {
                return Err(self.runtime_error("protected frame vanished"));
            };
            self.state.frames.truncate(index);
            self.finish_protected_error(&protect, value)?;
            if self.state.frames.len() <= stop {
                return Ok(ExecOutcome::Finished);
            }
        }
    }

    /// Call the value at `func` from Rust and run it to completion.
    ///
    /// This is a native boundary: the callee cannot yield.
    pub(crate) fn call_at(&mut self, func: usize, nresults: u8) -> VmResult<()> {
        if self.native_depth >= self.config.max_native_depth {
            return Err(self.runtime_error("C stack overflow"));
        }
        let depth = self.state.frames.len();
        self.native_depth += 1;
        self.state.nny += 1;
        let result = match self.prepare_call(func, nresults) {
            Ok(CallOutcome::Lua) => self.execute(depth).map(|_| ()),
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };
        self.state.nny -= 1;
        self.native_depth -= 1;
        if result.is_err() {
            self.close_upvalues(func);
            self.state.frames.truncate(depth);
        }
        result
    }

    /// Call `f(args)` for one result, keeping everything rooted on the stack
    pub(crate) fn call_meta(&mut self, f: Value, args: &[Value]) -> VmResult<Value> {
        let func = self.state.stack.len();
        self.state.stack.push(f);
        self.state.stack.extend_from_slice(args);
        self.call_at(func, 1)?;
        let result = self.state.stack.get(func).copied().unwrap_or_default();
        self.state.stack.truncate(func);
        Ok(result)
    }

    // ===== Host entry points =====

    fn call_target(&self, nargs: usize) -> usize {
        let base = self.stack_base();
        let len = self.state.stack.len();
        assert!(
            len >= base + nargs + 1,
            "call needs a function and {nargs} arguments on the stack"
        );
        len - nargs - 1
    }

    /// Call the function below `nargs` arguments without protection.
    ///
    /// A failure invokes the panic handler, then panics.
    pub fn call(&mut self, nargs: usize, nresults: i32) {
        if let Err(err) = self.check_alive() {
            self.unprotected_failure(err);
        }
        let func = self.call_target(nargs);
        if let Err(err) = self.call_at(func, super::stack::wanted(nresults)) {
            self.unprotected_failure(err);
        }
    }

    /// Call the function below `nargs` arguments, catching errors.
    ///
    /// On failure the function and its arguments are removed and the error
    /// is returned; its value stays valid until the next protected call.
    pub fn protected_call(&mut self, nargs: usize, nresults: i32) -> VmResult<()> {
        self.check_alive()?;
        self.error_value = Value::Nil;
        let func = self.call_target(nargs);
        match self.call_at(func, super::stack::wanted(nresults)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state.stack.truncate(func);
                if let Error::Runtime(runtime) = &err {
                    self.error_value = runtime.value;
                }
                Err(err)
            }
        }
    }
}
