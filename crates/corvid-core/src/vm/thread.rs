//! Per-thread execution state: value stack, call frames, open upvalues

use std::rc::Rc;

use crate::gc::Handle;
use crate::value::{LoadedProto, Value};

/// Lifecycle of a coroutine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created or yielded; may be resumed
    Suspended,
    /// Currently executing
    Running,
    /// Resumed another coroutine and is waiting for it
    Normal,
    /// Returned or raised an error
    Dead,
}

impl ThreadStatus {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
        }
    }
}

/// How a resume ended; the count is the number of values pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Yielded(usize),
    Finished(usize),
}

/// Recovery point installed by `pcall`/`xpcall`
#[derive(Debug, Clone)]
pub(crate) struct Protect {
    /// Where `true`/`false` and the results go
    pub(crate) result_slot: usize,
    pub(crate) nresults: u8,
    /// `xpcall` message handler
    pub(crate) handler: Option<Value>,
}

#[derive(Debug, Clone)]
pub(crate) struct CallFrame {
    pub(crate) function: Handle,
    /// `None` for native frames
    pub(crate) proto: Option<Rc<LoadedProto>>,
    pub(crate) ip: usize,
    /// Stack slot of the callee; arguments and locals follow it
    pub(crate) base: usize,
    pub(crate) nresults: u8,
    pub(crate) varargs: Vec<Value>,
    /// Values produced by the last open-ended call or `...`
    pub(crate) multi: usize,
    pub(crate) protect: Option<Protect>,
}

impl CallFrame {
    pub(crate) fn native(function: Handle, base: usize, nresults: u8) -> Self {
        Self {
            function,
            proto: None,
            ip: 0,
            base,
            nresults,
            varargs: Vec::new(),
            multi: 0,
            protect: None,
        }
    }

    pub(crate) fn is_native(&self) -> bool {
        self.proto.is_none()
    }

    /// Source line of the instruction that is executing
    pub(crate) fn current_line(&self) -> Option<u32> {
        self.proto
            .as_ref()
            .and_then(|proto| proto.line_at(self.ip.saturating_sub(1)))
    }
}

#[derive(Debug, Default)]
pub struct ThreadState {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalue cells sorted by stack slot
    pub(crate) open_upvalues: Vec<(usize, Handle)>,
    /// Active native boundaries; yielding needs zero
    pub(crate) nny: u32,
    /// Slot and wanted count for the values of the next resume
    pub(crate) yield_target: Option<(usize, u8)>,
}

impl ThreadState {
    pub(crate) fn with_function(function: Value) -> Self {
        Self {
            stack: vec![function],
            ..Self::default()
        }
    }

    pub(crate) fn references(&self, out: &mut Vec<Handle>) {
        out.extend(self.stack.iter().filter_map(Value::handle));
        for frame in &self.frames {
            out.push(frame.function);
            out.extend(frame.varargs.iter().filter_map(Value::handle));
            if let Some(handler) = frame.protect.as_ref().and_then(|p| p.handler) {
                out.extend(handler.handle());
            }
        }
        out.extend(self.open_upvalues.iter().map(|&(_, cell)| cell));
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.stack.capacity() * std::mem::size_of::<Value>()
            + self.frames.capacity() * std::mem::size_of::<CallFrame>()
            + self.open_upvalues.capacity() * std::mem::size_of::<(usize, Handle)>()
    }
}
