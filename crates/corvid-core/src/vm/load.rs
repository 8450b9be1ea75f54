//! Loading compiled chunks and source text

use std::rc::Rc;

use tracing::debug;

use super::{Error, VmResult, VM, MULTRET};
use crate::bytecode::{compile_chunk, Chunk, CompileOptions, Constant, VECTOR_SIZE};
use crate::gc::Handle;
use crate::value::{Function, LoadedProto, LuaClosure, Object, Value};

/// Display form of a chunk name: a leading `=` or `@` is dropped
fn display_chunk_name(name: &str) -> &str {
    name.strip_prefix(['=', '@']).unwrap_or(name)
}

impl VM {
    /// Decode a serialized chunk and push its main function
    pub fn load(&mut self, chunk_name: &str, bytes: &[u8]) -> VmResult<()> {
        self.check_alive()?;
        let chunk = Chunk::from_bytes(bytes).map_err(|e| Error::Load(e.to_string()))?;
        self.load_chunk(chunk_name, &chunk)
    }

    /// Compile source text with default options and push its main function
    pub fn load_source(&mut self, chunk_name: &str, source: &str) -> VmResult<()> {
        self.check_alive()?;
        let chunk = compile_chunk(source, display_chunk_name(chunk_name), &CompileOptions::default())?;
        self.load_chunk(chunk_name, &chunk)
    }

    /// Push a closure for an in-memory chunk
    pub fn load_chunk(&mut self, chunk_name: &str, chunk: &Chunk) -> VmResult<()> {
        if chunk.vector_size != VECTOR_SIZE {
            return Err(Error::Load(format!(
                "unsupported vector size {} (expected {VECTOR_SIZE})",
                chunk.vector_size
            )));
        }
        let name: Rc<str> = Rc::from(display_chunk_name(chunk_name));
        let mut loaded: Vec<Handle> = Vec::with_capacity(chunk.protos.len());
        for (index, proto) in chunk.protos.iter().enumerate() {
            let constants = proto
                .constants()
                .iter()
                .map(|constant| match constant {
                    Constant::Nil => Value::Nil,
                    Constant::Boolean(b) => Value::Boolean(*b),
                    Constant::Number(n) => Value::Number(*n),
                    Constant::String(bytes) => Value::String(self.heap.intern(bytes)),
                })
                .collect();
            let mut children = Vec::with_capacity(proto.children.len());
            for &child in &proto.children {
                match loaded.get(child as usize) {
                    Some(&handle) => children.push(handle),
                    None => {
                        return Err(Error::Load(format!(
                            "prototype {index} references child {child} before it is defined"
                        )))
                    }
                }
            }
            let handle = self.heap.alloc(Object::Proto(Rc::new(LoadedProto {
                code: proto.code().into(),
                constants,
                children: children.into_boxed_slice(),
                num_params: proto.num_params,
                is_vararg: proto.is_vararg,
                num_upvalues: proto.num_upvalues,
                max_stack: proto.max_stack,
                name: proto.name.as_deref().map(Rc::from),
                chunk_name: Rc::clone(&name),
                line_defined: proto.line_defined,
                lines: proto.line_runs().into(),
            })));
            loaded.push(handle);
        }

        let Some(&main) = loaded.get(chunk.main as usize) else {
            return Err(Error::Load(format!("main prototype {} is missing", chunk.main)));
        };
        let proto = Rc::clone(self.heap.proto(main));
        if proto.num_upvalues != 0 {
            return Err(Error::Load("main function cannot capture upvalues".to_string()));
        }
        let env = self.chunk_env();
        let closure = self.heap.alloc(Object::Function(Function::Lua(LuaClosure {
            proto,
            proto_handle: main,
            upvalues: Box::new([]),
            env,
        })));
        self.push_value(Value::Function(closure));
        debug!(chunk = %name, protos = loaded.len(), "chunk loaded");
        self.after_alloc();
        Ok(())
    }

    /// Compile and run `source`, leaving its results on the stack.
    ///
    /// Returns how many values were pushed.
    pub fn do_string(&mut self, source: &str) -> VmResult<usize> {
        let before = self.top();
        self.load_source("string", source)?;
        self.protected_call(0, MULTRET)?;
        Ok(self.top() - before)
    }
}
