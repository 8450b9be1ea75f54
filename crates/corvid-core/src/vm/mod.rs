//! Virtual machine for executing corvid bytecode
//!
//! A [`VM`] owns the heap, the globals and registry tables, and the state of
//! the running thread. Hosts drive it through the stack API (`push_*`,
//! `to_*`, table accessors) and run code with [`VM::load`] plus
//! [`VM::protected_call`].

mod args;
mod call;
mod config;
mod coroutine;
mod error;
mod interp;
mod load;
mod meta;
mod output;
mod registry;
mod sandbox;
mod stack;
mod thread;

pub use call::Intrinsic;
pub use config::{ConfigError, VmConfig};
pub use error::{Error, RuntimeError, TraceFrame, VmResult};
pub use meta::Event;
pub use output::{OutputCapture, OutputSink, StdoutSink};
pub use registry::RefHandle;
pub use stack::MULTRET;
pub use thread::{ResumeOutcome, ThreadState, ThreadStatus};

pub(crate) use call::{CallOutcome, ExecOutcome};
pub(crate) use coroutine::Completion;
pub(crate) use thread::{CallFrame, Protect};

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::gc::{GcConfig, GcStats, Handle, Heap};
use crate::value::{Function, NativeClosure, NativeFn, Object, ThreadObject, Value};

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// What the interrupt hook wants the interpreter to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    Continue,
    Abort,
}

type InterruptHook = Box<dyn FnMut() -> InterruptAction>;
type PanicHandler = Box<dyn Fn(&Error)>;

/// Bookkeeping for registry references
#[derive(Debug, Default)]
pub(crate) struct RefTable {
    pub(crate) free: Vec<i32>,
    pub(crate) next: i32,
    /// Keys queued by dropped [`RefHandle`]s
    pub(crate) releases: Rc<RefCell<Vec<i32>>>,
}

/// The virtual machine
pub struct VM {
    pub(crate) heap: Heap,
    /// State of the thread that is running now
    pub(crate) state: ThreadState,
    pub(crate) current: Handle,
    pub(crate) main_thread: Handle,
    /// Threads waiting on a resume, innermost last
    pub(crate) resumers: Vec<(Handle, ThreadState)>,
    pub(crate) registry: Handle,
    pub(crate) globals: Handle,
    pub(crate) string_meta: Option<Handle>,
    /// Iterator used when a `for ... in` loop walks a table directly
    pub(crate) next_fn: Value,
    /// Interned metamethod names, indexed by [`Event`]
    pub(crate) events: Box<[Handle]>,
    /// Last error value handed to the host
    pub(crate) error_value: Value,
    pub(crate) refs: RefTable,
    pub(crate) id: u64,
    pub(crate) config: VmConfig,
    pub(crate) sandboxed: bool,
    interrupt: Option<InterruptHook>,
    countdown: u32,
    panic_handler: Option<PanicHandler>,
    pub(crate) output: Box<dyn OutputSink>,
    pub(crate) native_depth: usize,
    dead: bool,
    roots: Vec<Handle>,
}

impl VM {
    /// A VM with the default configuration and the standard library
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut heap = Heap::new(config.gc, config.memory_limit);
        let main_thread = heap.alloc(Object::Thread(ThreadObject {
            state: None,
            status: ThreadStatus::Running,
        }));
        let registry = heap.new_table(0, 0);
        let globals = heap.new_table(0, 64);
        let events = Event::ALL
            .iter()
            .map(|event| heap.intern(event.name().as_bytes()))
            .collect();

        let mut vm = VM {
            heap,
            state: ThreadState::default(),
            current: main_thread,
            main_thread,
            resumers: Vec::new(),
            registry,
            globals,
            string_meta: None,
            next_fn: Value::Nil,
            events,
            error_value: Value::Nil,
            refs: RefTable {
                next: 1,
                ..RefTable::default()
            },
            id: NEXT_VM_ID.fetch_add(1, Ordering::Relaxed),
            config,
            sandboxed: false,
            interrupt: None,
            countdown: config.interrupt_interval.max(1),
            panic_handler: None,
            output: Box::new(StdoutSink),
            native_depth: 0,
            dead: false,
            roots: Vec::new(),
        };

        let g = vm.heap.intern(b"_G");
        vm.raw_set_table(globals, Value::String(g), Value::Table(globals));
        vm.next_fn = vm.alloc_native("next", Rc::new(crate::stdlib::base::next), Vec::new(), None);
        if config.open_libs {
            crate::stdlib::open_libs(&mut vm);
        }
        debug!(id = vm.id, open_libs = config.open_libs, "vm created");
        vm
    }

    #[must_use]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Read-only view of the heap, for inspection and statistics
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Fail fast once the VM has run out of memory
    pub(crate) fn check_alive(&self) -> VmResult<()> {
        if self.dead {
            Err(Error::OutOfMemory)
        } else {
            Ok(())
        }
    }

    pub(crate) fn alloc_native(
        &mut self,
        name: &str,
        func: NativeFn,
        upvalues: Vec<Value>,
        intrinsic: Option<Intrinsic>,
    ) -> Value {
        let handle = self.heap.alloc(Object::Function(Function::Native(NativeClosure {
            name: Rc::from(name),
            func,
            upvalues,
            intrinsic,
        })));
        Value::Function(handle)
    }

    /// Raw store that cannot fail for string keys; used while building tables
    pub(crate) fn raw_set_table(&mut self, table: Handle, key: Value, value: Value) {
        // Keys built by the VM are never nil or NaN
        let _ = self.heap.table_set(table, key, value);
    }

    // ===== Garbage collection =====

    fn gather_roots(&mut self) -> Vec<Handle> {
        self.process_releases();
        let mut roots = std::mem::take(&mut self.roots);
        roots.clear();
        roots.extend([self.registry, self.globals, self.main_thread, self.current]);
        roots.extend(self.string_meta);
        roots.extend(self.next_fn.handle());
        roots.extend(self.error_value.handle());
        roots.extend(self.events.iter().copied());
        self.state.references(&mut roots);
        for (thread, state) in &self.resumers {
            roots.push(*thread);
            state.references(&mut roots);
        }
        roots
    }

    /// Collector work at an instruction boundary or API entry
    pub(crate) fn gc_safe_point(&mut self) -> VmResult<()> {
        if self.heap.over_limit() {
            warn!(
                bytes = self.heap.bytes(),
                limit = ?self.heap.memory_limit(),
                "memory limit exceeded, running emergency collection"
            );
            self.collect_garbage();
            if self.heap.over_limit() {
                self.dead = true;
                return Err(Error::OutOfMemory);
            }
        }
        if self.heap.should_step() {
            let roots = self.gather_roots();
            self.heap.step(&roots);
            self.roots = roots;
        }
        Ok(())
    }

    /// Step after a host allocation; limit violations surface at the next safe point
    pub(crate) fn after_alloc(&mut self) {
        if self.heap.should_step() {
            let roots = self.gather_roots();
            self.heap.step(&roots);
            self.roots = roots;
        }
    }

    /// Run a complete collection cycle
    pub fn collect_garbage(&mut self) {
        let roots = self.gather_roots();
        self.heap.full_collect(&roots);
        self.roots = roots;
    }

    /// Run one incremental step; returns `true` if it finished a cycle
    pub fn gc_step(&mut self) -> bool {
        let roots = self.gather_roots();
        let finished = self.heap.step(&roots);
        self.roots = roots;
        finished
    }

    #[must_use]
    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    #[must_use]
    pub fn gc_config(&self) -> GcConfig {
        self.heap.config()
    }

    pub fn set_gc_config(&mut self, config: GcConfig) {
        self.config.gc = config;
        self.heap.set_config(config);
    }

    /// Whether the object behind a value still exists; scalars are always live
    #[must_use]
    pub fn is_handle_live(&self, value: Value) -> bool {
        value.handle().map_or(true, |handle| self.heap.is_live(handle))
    }

    // ===== Host hooks =====

    /// Install a hook called every `interrupt_interval` instructions
    pub fn set_interrupt(&mut self, hook: impl FnMut() -> InterruptAction + 'static) {
        self.interrupt = Some(Box::new(hook));
        self.countdown = self.config.interrupt_interval.max(1);
    }

    pub fn clear_interrupt(&mut self) {
        self.interrupt = None;
    }

    /// Handler invoked before an unprotected [`VM::call`] panics
    pub fn set_panic_handler(&mut self, handler: impl Fn(&Error) + 'static) {
        self.panic_handler = Some(Box::new(handler));
    }

    pub fn set_output(&mut self, sink: impl OutputSink + 'static) {
        self.output = Box::new(sink);
    }

    pub(crate) fn poll_interrupt(&mut self) -> VmResult<()> {
        let Some(hook) = self.interrupt.as_mut() else {
            return Ok(());
        };
        self.countdown -= 1;
        if self.countdown > 0 {
            return Ok(());
        }
        self.countdown = self.config.interrupt_interval.max(1);
        match hook() {
            InterruptAction::Continue => Ok(()),
            InterruptAction::Abort => {
                debug!("interrupt hook aborted execution");
                Err(Error::Interrupted)
            }
        }
    }

    pub(crate) fn unprotected_failure(&self, err: Error) -> ! {
        if let Some(handler) = &self.panic_handler {
            handler(&err);
        }
        panic!("unprotected error in call: {err}");
    }

    // ===== Error construction =====

    /// Chunk and line of the innermost script frame
    pub(crate) fn current_location(&self) -> Option<(String, u32)> {
        let frame = self.state.frames.iter().rev().find(|f| !f.is_native())?;
        let line = frame.current_line()?;
        let proto = frame.proto.as_ref()?;
        Some((proto.chunk_name.to_string(), line))
    }

    /// Location of a frame counted from the top, 0 being the running one
    pub(crate) fn level_location(&self, level: usize) -> Option<(String, u32)> {
        let frame = self.state.frames.iter().rev().nth(level)?;
        let line = frame.current_line()?;
        let proto = frame.proto.as_ref()?;
        Some((proto.chunk_name.to_string(), line))
    }

    pub(crate) fn traceback(&self) -> Vec<TraceFrame> {
        self.state
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let name = self.heap.function(frame.function).name().map(str::to_string);
                match &frame.proto {
                    Some(proto) => {
                        let function = match name {
                            Some(name) => format!("function '{name}'"),
                            None if proto.line_defined == 0 => "main chunk".to_string(),
                            None => format!("function <{}:{}>", proto.chunk_name, proto.line_defined),
                        };
                        TraceFrame {
                            function,
                            chunk: Some(proto.chunk_name.to_string()),
                            line: frame.current_line(),
                        }
                    }
                    None => TraceFrame {
                        function: format!("function '{}'", name.unwrap_or_default()),
                        chunk: None,
                        line: None,
                    },
                }
            })
            .collect()
    }

    /// A string error prefixed with the innermost script position
    pub(crate) fn runtime_error(&mut self, message: impl Into<String>) -> Error {
        let message = message.into();
        let location = self.current_location();
        let text = match &location {
            Some((chunk, line)) => format!("{chunk}:{line}: {message}"),
            None => message,
        };
        let value = Value::String(self.heap.intern(text.as_bytes()));
        self.build_error(value, text, location)
    }

    /// An error carrying an arbitrary value unchanged
    pub(crate) fn error_from_value(&mut self, value: Value) -> Error {
        let message = self.error_message(value);
        let location = self.current_location();
        self.build_error(value, message, location)
    }

    fn build_error(&self, value: Value, message: String, location: Option<(String, u32)>) -> Error {
        let (chunk, line) = match location {
            Some((chunk, line)) => (Some(chunk), Some(line)),
            None => (None, None),
        };
        Error::Runtime(Box::new(
            RuntimeError::new(value, message)
                .with_location(chunk, line)
                .with_trace(self.traceback()),
        ))
    }

    fn error_message(&self, value: Value) -> String {
        match value {
            Value::String(h) => String::from_utf8_lossy(self.heap.string(h)).into_owned(),
            Value::Number(_) | Value::Integer(_) | Value::UnsignedInteger(_) => self.display_value(value),
            other => format!("(error object is a {} value)", other.type_name()),
        }
    }

    /// The value a script sees for a caught error
    pub(crate) fn error_value_of(&mut self, err: Error) -> Value {
        match err {
            Error::Runtime(err) => err.value,
            other => {
                let text = match self.current_location() {
                    Some((chunk, line)) => format!("{chunk}:{line}: {other}"),
                    None => other.to_string(),
                };
                Value::String(self.heap.intern(text.as_bytes()))
            }
        }
    }

    /// Raise a string error from a native function:
    /// `return Err(vm.raise_message("bad input"))`
    pub fn raise_message(&mut self, message: impl Into<String>) -> Error {
        self.runtime_error(message)
    }

    /// Raise the value on top of the stack as the error object
    pub fn raise_top(&mut self) -> Error {
        let base = self.stack_base();
        let value = if self.state.stack.len() > base {
            self.state.stack.pop().unwrap_or_default()
        } else {
            Value::Nil
        };
        self.error_from_value(value)
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VM {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VM")
            .field("id", &self.id)
            .field("stack", &self.state.stack.len())
            .field("frames", &self.state.frames.len())
            .field("sandboxed", &self.sandboxed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_vm_has_globals() {
        let mut vm = VM::new();
        vm.get_global("_G").unwrap();
        assert_eq!(vm.type_of(-1), crate::value::Tag::Table);
        vm.get_global("print").unwrap();
        assert_eq!(vm.type_of(-1), crate::value::Tag::Function);
        assert_eq!(vm.top(), 2);
    }

    #[test]
    fn test_bare_vm_has_no_libraries() {
        let mut vm = VM::with_config(VmConfig {
            open_libs: false,
            ..VmConfig::default()
        });
        vm.get_global("print").unwrap();
        assert!(vm.read(-1).is_nil());
    }

    #[test]
    fn test_vm_ids_are_distinct() {
        let a = VM::new();
        let b = VM::new();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_interrupt_aborts_loop() {
        let mut vm = VM::new();
        let mut calls = 0;
        vm.set_interrupt(move || {
            calls += 1;
            if calls > 3 {
                InterruptAction::Abort
            } else {
                InterruptAction::Continue
            }
        });
        vm.load_source("spin", "while true do end").unwrap();
        let err = vm.protected_call(0, 0).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[test]
    fn test_interrupt_is_not_caught_by_pcall() {
        let mut vm = VM::new();
        vm.set_interrupt(|| InterruptAction::Abort);
        let err = vm
            .do_string("local ok = pcall(function() while true do end end) return ok")
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[test]
    fn test_memory_limit_kills_vm() {
        let mut vm = VM::with_config(VmConfig {
            memory_limit: Some(256 * 1024),
            ..VmConfig::default()
        });
        let err = vm
            .do_string("local t = {} for i = 1, 1e7 do t[i] = tostring(i) end")
            .unwrap_err();
        assert!(matches!(err, Error::OutOfMemory));
        assert!(matches!(vm.do_string("return 1"), Err(Error::OutOfMemory)));
    }

    #[test]
    fn test_traceback_names_functions() {
        let mut vm = VM::new();
        let err = vm
            .do_string("local function inner() error('deep', 1) end\nlocal function outer() inner() end\nouter()")
            .unwrap_err();
        let runtime = err.as_runtime().unwrap();
        assert_eq!(runtime.message, "string:1: deep");
        let names: Vec<&str> = runtime.traceback.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(
            names,
            vec!["function 'error'", "function 'inner'", "function 'outer'", "main chunk"]
        );
    }
}
