//! Heap-resident objects stored in the collector's arena

use std::fmt;
use std::rc::Rc;

use super::{Table, Tag, Value};
use crate::bytecode::line_for_offset;
use crate::gc::Handle;
use crate::vm::{Intrinsic, ThreadState, ThreadStatus, VmResult, VM};

/// Host function signature: reads arguments from the stack, pushes results
/// and returns how many it pushed.
pub type NativeFn = Rc<dyn Fn(&mut VM) -> VmResult<usize>>;

/// Userdata finalizer, run exactly once with the payload
pub type Destructor = Box<dyn FnOnce(&mut [u8])>;

/// An interned byte string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuaString {
    bytes: Box<[u8]>,
}

impl LuaString {
    #[must_use]
    pub fn new(bytes: &[u8]) -> Self {
        Self { bytes: bytes.into() }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn to_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A prototype after loading: constants resolved to values and children
/// resolved to prototype objects.
#[derive(Debug)]
pub struct LoadedProto {
    pub code: Box<[u8]>,
    pub constants: Box<[Value]>,
    pub children: Box<[Handle]>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub num_upvalues: u8,
    pub max_stack: u8,
    pub name: Option<Rc<str>>,
    pub chunk_name: Rc<str>,
    pub line_defined: u32,
    pub lines: Box<[(u32, u32)]>,
}

impl LoadedProto {
    #[must_use]
    pub fn line_at(&self, offset: usize) -> Option<u32> {
        line_for_offset(&self.lines, offset)
    }

    fn byte_size(&self) -> usize {
        std::mem::size_of::<LoadedProto>()
            + self.code.len()
            + self.constants.len() * std::mem::size_of::<Value>()
            + self.children.len() * std::mem::size_of::<Handle>()
            + self.lines.len() * 8
    }
}

/// A script function: prototype plus captured upvalue cells
#[derive(Debug, Clone)]
pub struct LuaClosure {
    pub proto: Rc<LoadedProto>,
    pub proto_handle: Handle,
    pub upvalues: Box<[Handle]>,
    /// Table used for global lookups
    pub env: Handle,
}

/// A host function with optional captured values
#[derive(Clone)]
pub struct NativeClosure {
    pub name: Rc<str>,
    pub func: NativeFn,
    pub upvalues: Vec<Value>,
    /// Builtins the call path implements directly
    pub intrinsic: Option<Intrinsic>,
}

impl fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeClosure")
            .field("name", &self.name)
            .field("upvalues", &self.upvalues.len())
            .field("intrinsic", &self.intrinsic)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Function {
    Lua(LuaClosure),
    Native(NativeClosure),
}

impl Function {
    /// Name used in tracebacks and argument errors
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Function::Lua(closure) => closure.proto.name.as_deref(),
            Function::Native(native) => Some(&native.name),
        }
    }
}

/// A captured variable.
///
/// Open cells alias a live stack slot of the thread that declared the
/// variable; they become closed, owning the value, when that frame exits.
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    Open { thread: Handle, slot: usize },
    Closed(Value),
}

pub struct Userdata {
    pub tag: i32,
    pub data: Vec<u8>,
    pub destructor: Option<Destructor>,
    pub metatable: Option<Handle>,
}

impl Userdata {
    /// Run the destructor if it has not run yet
    pub fn finalize(&mut self) {
        if let Some(destructor) = self.destructor.take() {
            destructor(&mut self.data);
        }
    }
}

impl fmt::Debug for Userdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Userdata")
            .field("tag", &self.tag)
            .field("len", &self.data.len())
            .field("has_destructor", &self.destructor.is_some())
            .finish()
    }
}

/// A coroutine. Its state lives here while suspended and moves into the
/// VM while it runs.
#[derive(Debug)]
pub struct ThreadObject {
    pub state: Option<Box<ThreadState>>,
    pub status: ThreadStatus,
}

/// Raw bytes of a `buffer` value
pub type Buffer = Vec<u8>;

#[derive(Debug)]
pub enum Object {
    String(LuaString),
    Table(Table),
    Function(Function),
    Upvalue(Upvalue),
    Proto(Rc<LoadedProto>),
    Userdata(Userdata),
    Thread(ThreadObject),
    Buffer(Buffer),
}

impl Object {
    #[must_use]
    pub fn tag(&self) -> Tag {
        match self {
            Object::String(_) => Tag::String,
            Object::Table(_) => Tag::Table,
            Object::Function(_) => Tag::Function,
            Object::Upvalue(_) => Tag::Upvalue,
            Object::Proto(_) => Tag::Proto,
            Object::Userdata(_) => Tag::Userdata,
            Object::Thread(_) => Tag::Thread,
            Object::Buffer(_) => Tag::Buffer,
        }
    }

    /// Whether the object can reference other objects
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Object::String(_) | Object::Buffer(_))
    }

    /// Approximate heap footprint, used for collector pacing
    #[must_use]
    pub fn byte_size(&self) -> usize {
        let base = std::mem::size_of::<Object>();
        base + match self {
            Object::String(s) => s.len(),
            Object::Table(t) => t.byte_size(),
            Object::Function(Function::Lua(c)) => c.upvalues.len() * std::mem::size_of::<Handle>(),
            Object::Function(Function::Native(n)) => {
                n.name.len() + n.upvalues.len() * std::mem::size_of::<Value>()
            }
            Object::Upvalue(_) => 0,
            Object::Proto(p) => p.byte_size(),
            Object::Userdata(u) => u.data.len(),
            Object::Thread(t) => t.state.as_ref().map_or(0, |s| s.byte_size()),
            Object::Buffer(b) => b.len(),
        }
    }

    /// Push every handle this object keeps alive
    pub fn references(&self, out: &mut Vec<Handle>) {
        match self {
            Object::String(_) | Object::Buffer(_) => {}
            Object::Table(t) => t.references(out),
            Object::Function(Function::Lua(c)) => {
                out.push(c.proto_handle);
                out.extend_from_slice(&c.upvalues);
                out.push(c.env);
            }
            Object::Function(Function::Native(n)) => {
                out.extend(n.upvalues.iter().filter_map(Value::handle));
            }
            Object::Upvalue(Upvalue::Closed(v)) => out.extend(v.handle()),
            Object::Upvalue(Upvalue::Open { thread, .. }) => out.push(*thread),
            Object::Proto(p) => {
                out.extend(p.constants.iter().filter_map(Value::handle));
                out.extend_from_slice(&p.children);
            }
            Object::Userdata(u) => out.extend(u.metatable),
            Object::Thread(t) => {
                if let Some(state) = &t.state {
                    state.references(out);
                }
            }
        }
    }
}
