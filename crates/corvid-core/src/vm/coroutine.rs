//! Coroutine switching
//!
//! Each coroutine owns a [`ThreadState`]. Resuming moves the target's state
//! into the VM and parks the resumer's state on the `resumers` stack; a
//! yield or return swaps them back. Nothing recurses on the Rust stack
//! except the native `resume` call itself.

use tracing::trace;

use super::{CallOutcome, ExecOutcome, ResumeOutcome, ThreadStatus, VmResult, VM};
use crate::bytecode::MULTI;
use crate::gc::Handle;
use crate::value::{Upvalue, Value};

/// How a resume ended, with the values moved out of the coroutine
pub(crate) enum Completion {
    Yielded(Vec<Value>),
    Finished(Vec<Value>),
}

impl VM {
    /// Status of a coroutine as scripts see it
    pub(crate) fn coroutine_status(&self, thread: Handle) -> ThreadStatus {
        if thread == self.current {
            ThreadStatus::Running
        } else {
            self.heap.thread(thread).status
        }
    }

    /// An error whose value is `message` without a position prefix
    fn plain_error(&mut self, message: &str) -> super::Error {
        let value = Value::String(self.heap.intern(message.as_bytes()));
        self.error_from_value(value)
    }

    /// Run `thread` with `args` until it yields, returns or fails
    pub(crate) fn resume_thread(&mut self, thread: Handle, args: Vec<Value>) -> VmResult<Completion> {
        match self.coroutine_status(thread) {
            ThreadStatus::Suspended => {}
            ThreadStatus::Dead => return Err(self.plain_error("cannot resume dead coroutine")),
            ThreadStatus::Running | ThreadStatus::Normal => {
                return Err(self.plain_error("cannot resume non-suspended coroutine"))
            }
        }
        if self.resumers.len() >= self.config.max_native_depth {
            return Err(self.runtime_error("C stack overflow"));
        }

        let object = self.heap.thread_mut(thread);
        let state = object.state.take().map(|state| *state).unwrap_or_default();
        object.status = ThreadStatus::Running;
        let previous = self.current;
        self.heap.thread_mut(previous).status = ThreadStatus::Normal;
        let parked = std::mem::replace(&mut self.state, state);
        self.resumers.push((previous, parked));
        self.current = thread;
        self.heap.resize(thread);
        trace!(depth = self.resumers.len(), "coroutine resumed");

        let result = self.run_coroutine(args);
        if result.is_err() {
            self.close_upvalues(0);
        }

        let (previous, parked) = self
            .resumers
            .pop()
            .unwrap_or_else(|| unreachable!("resumer stack emptied while a coroutine ran"));
        let state = std::mem::replace(&mut self.state, parked);
        self.current = previous;
        self.heap.thread_mut(previous).status = ThreadStatus::Running;
        let object = self.heap.thread_mut(thread);
        match &result {
            Ok(Completion::Yielded(_)) => {
                object.status = ThreadStatus::Suspended;
                object.state = Some(Box::new(state));
            }
            _ => {
                object.status = ThreadStatus::Dead;
                object.state = None;
            }
        }
        self.heap.resize(thread);
        result
    }

    fn run_coroutine(&mut self, args: Vec<Value>) -> VmResult<Completion> {
        let outcome = match self.state.yield_target.take() {
            Some((slot, wanted)) => {
                self.state.stack.truncate(slot);
                let count = args.len();
                self.state.stack.extend(args);
                self.adjust_results(slot, count, wanted);
                if self.state.frames.is_empty() {
                    ExecOutcome::Finished
                } else {
                    self.execute(0)?
                }
            }
            None => {
                self.state.stack.extend(args);
                match self.prepare_call(0, MULTI)? {
                    CallOutcome::Lua => self.execute(0)?,
                    CallOutcome::Done => ExecOutcome::Finished,
                    CallOutcome::Yield => ExecOutcome::Yielded,
                }
            }
        };
        match outcome {
            ExecOutcome::Yielded => {
                let Some((slot, _)) = self.state.yield_target else {
                    return Ok(Completion::Yielded(Vec::new()));
                };
                let values = self.state.stack.split_off(slot + 1);
                self.state.stack.truncate(slot);
                Ok(Completion::Yielded(values))
            }
            ExecOutcome::Finished => Ok(Completion::Finished(std::mem::take(&mut self.state.stack))),
        }
    }

    /// Kill a suspended coroutine, closing its captured variables
    pub(crate) fn close_thread(&mut self, thread: Handle) -> VmResult<()> {
        match self.coroutine_status(thread) {
            ThreadStatus::Suspended | ThreadStatus::Dead => {}
            status => {
                return Err(self.runtime_error(format!("cannot close a {} coroutine", status.name())));
            }
        }
        let object = self.heap.thread_mut(thread);
        object.status = ThreadStatus::Dead;
        let Some(state) = object.state.take() else {
            return Ok(());
        };
        for &(slot, cell) in &state.open_upvalues {
            let value = state.stack.get(slot).copied().unwrap_or_default();
            self.heap.set_upvalue(cell, Upvalue::Closed(value));
        }
        self.heap.resize(thread);
        Ok(())
    }

    /// Resume the thread at `thread_index` with the top `nargs` values.
    ///
    /// Yielded or returned values replace the arguments on the stack.
    pub fn resume(&mut self, thread_index: i32, nargs: usize) -> VmResult<ResumeOutcome> {
        self.check_alive()?;
        let thread = match self.value_at(thread_index) {
            Value::Thread(h) => h,
            _ => {
                return Err(super::Error::TypeMismatch {
                    index: thread_index,
                    expected: "thread",
                    found: self.value_at(thread_index).type_name(),
                })
            }
        };
        assert!(nargs <= self.top(), "resume needs {nargs} arguments on the stack");
        let at = self.state.stack.len() - nargs;
        let args = self.state.stack.split_off(at);
        match self.resume_thread(thread, args)? {
            Completion::Yielded(values) => {
                let count = values.len();
                self.state.stack.extend(values);
                Ok(ResumeOutcome::Yielded(count))
            }
            Completion::Finished(values) => {
                let count = values.len();
                self.state.stack.extend(values);
                Ok(ResumeOutcome::Finished(count))
            }
        }
    }

    /// Status of the thread at `index`
    pub fn thread_status(&self, index: i32) -> VmResult<ThreadStatus> {
        match self.value_at(index) {
            Value::Thread(h) => Ok(self.coroutine_status(h)),
            other => Err(super::Error::TypeMismatch {
                index,
                expected: "thread",
                found: other.type_name(),
            }),
        }
    }

    /// Whether the running code may yield
    pub(crate) fn is_yieldable(&self) -> bool {
        !self.resumers.is_empty() && self.state.nny == 0
    }

    pub(crate) fn push_results(&mut self, results: Vec<Value>) -> usize {
        let count = results.len();
        self.state.stack.extend(results);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{run, run_err};

    #[test]
    fn test_generator_yields_in_order() {
        let source = r"
            local co = coroutine.create(function(a)
                local b = coroutine.yield(a + 1)
                local c = coroutine.yield(b * 2)
                return c, 'done'
            end)
            local _, x = coroutine.resume(co, 1)
            local _, y = coroutine.resume(co, 10)
            local ok, z, tag = coroutine.resume(co, 'last')
            return x, y, z, tag, coroutine.status(co)
        ";
        assert_eq!(run(source).unwrap(), vec!["2", "20", "last", "done", "dead"]);
    }

    #[test]
    fn test_resume_dead_coroutine_fails() {
        let source = r"
            local co = coroutine.create(function() end)
            coroutine.resume(co)
            return coroutine.resume(co)
        ";
        assert_eq!(run(source).unwrap(), vec!["false", "cannot resume dead coroutine"]);
    }

    #[test]
    fn test_error_inside_coroutine_kills_it() {
        let source = r"
            local co = coroutine.create(function() error('oops') end)
            local ok, e = coroutine.resume(co)
            return ok, e, coroutine.status(co)
        ";
        assert_eq!(run(source).unwrap(), vec!["false", "oops", "dead"]);
    }

    #[test]
    fn test_yield_outside_coroutine() {
        let err = run_err("coroutine.yield(1)");
        assert_eq!(err, "string:1: attempt to yield from outside a coroutine");
    }

    #[test]
    fn test_yield_across_pcall() {
        let source = r"
            local co = coroutine.create(function()
                local ok, v = pcall(function()
                    local got = coroutine.yield('inside')
                    return got * 2
                end)
                return ok, v
            end)
            local _, first = coroutine.resume(co)
            local _, ok, v = coroutine.resume(co, 21)
            return first, ok, v
        ";
        assert_eq!(run(source).unwrap(), vec!["inside", "true", "42"]);
    }

    #[test]
    fn test_yield_across_metamethod_is_rejected() {
        let source = r"
            local t = setmetatable({}, {__index = function() return coroutine.yield() end})
            local co = coroutine.create(function() return t.x end)
            return coroutine.resume(co)
        ";
        let values = run(source).unwrap();
        assert_eq!(values[0], "false");
        assert!(values[1].ends_with("attempt to yield across a native call boundary"));
    }

    #[test]
    fn test_wrap_and_status() {
        let source = r"
            local gen = coroutine.wrap(function()
                for i = 1, 3 do coroutine.yield(i) end
            end)
            local co
            co = coroutine.create(function() return coroutine.status(co), coroutine.running() == co end)
            local _, status, same = coroutine.resume(co)
            return gen(), gen(), gen(), status, same
        ";
        assert_eq!(run(source).unwrap(), vec!["1", "2", "3", "running", "true"]);
    }

    #[test]
    fn test_upvalues_shared_across_threads() {
        let source = r"
            local count = 0
            local co = coroutine.wrap(function()
                while true do
                    count = count + 1
                    coroutine.yield()
                end
            end)
            co() co() co()
            return count
        ";
        assert_eq!(run(source).unwrap(), vec!["3"]);
    }

    #[test]
    fn test_close_suspended_coroutine() {
        let source = r"
            local get
            local co = coroutine.create(function()
                local x = 5
                get = function() return x end
                coroutine.yield()
                x = 6
            end)
            coroutine.resume(co)
            local closed = coroutine.close(co)
            return closed, coroutine.status(co), get()
        ";
        assert_eq!(run(source).unwrap(), vec!["true", "dead", "5"]);
    }

    #[test]
    fn test_host_resume() {
        let mut vm = VM::new();
        vm.load_source("gen", "local a = ... local b = coroutine.yield(a * 2) return b + 1")
            .unwrap();
        vm.new_thread().unwrap();
        vm.push_number(4.0);
        assert_eq!(vm.resume(1, 1).unwrap(), ResumeOutcome::Yielded(1));
        assert_eq!(vm.to_number(-1).unwrap(), 8.0);
        assert_eq!(vm.thread_status(1).unwrap(), ThreadStatus::Suspended);
        vm.pop(1);
        vm.push_number(9.0);
        assert_eq!(vm.resume(1, 1).unwrap(), ResumeOutcome::Finished(1));
        assert_eq!(vm.to_number(-1).unwrap(), 10.0);
        assert_eq!(vm.thread_status(1).unwrap(), ThreadStatus::Dead);
    }
}
