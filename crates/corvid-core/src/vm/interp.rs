//! The bytecode dispatch loop

use super::{CallOutcome, ExecOutcome, VmResult, VM};
use crate::bytecode::{OpCode, MULTI};
use crate::gc::Handle;
use crate::value::number::{self, ArithOp};
use crate::value::{Function, Object, Upvalue, Value};

#[inline]
fn read_u8(code: &[u8], at: usize) -> u8 {
    code.get(at).copied().unwrap_or(0)
}

#[inline]
fn read_u16(code: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([read_u8(code, at), read_u8(code, at + 1)])
}

#[inline]
fn read_i16(code: &[u8], at: usize) -> i16 {
    read_u16(code, at) as i16
}

#[inline]
fn read_u32(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([
        read_u8(code, at),
        read_u8(code, at + 1),
        read_u8(code, at + 2),
        read_u8(code, at + 3),
    ])
}

#[inline]
fn jump(next: usize, offset: i16) -> usize {
    next.wrapping_add_signed(isize::from(offset))
}

/// Values an instruction consumes from the top of the stack, not counting
/// pending multi values
fn fixed_operands(op: OpCode, code: &[u8], ip: usize) -> usize {
    match op {
        OpCode::Pop
        | OpCode::Dup
        | OpCode::SetLocal
        | OpCode::SetUpvalue
        | OpCode::SetGlobal
        | OpCode::GetField
        | OpCode::SelfOp
        | OpCode::Unm
        | OpCode::Not
        | OpCode::Len
        | OpCode::ToStr
        | OpCode::JumpIfFalse
        | OpCode::JumpIfTrue
        | OpCode::JumpIfFalseOrPop
        | OpCode::JumpIfTrueOrPop => 1,
        OpCode::GetIndex
        | OpCode::SetField
        | OpCode::InitField
        | OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Div
        | OpCode::IDiv
        | OpCode::Mod
        | OpCode::Pow
        | OpCode::Eq
        | OpCode::Ne
        | OpCode::Lt
        | OpCode::Le
        | OpCode::Gt
        | OpCode::Ge => 2,
        OpCode::SetIndex | OpCode::InitIndex => 3,
        OpCode::PopN | OpCode::Concat | OpCode::Return => usize::from(read_u8(code, ip + 1)),
        OpCode::Pick | OpCode::Call | OpCode::SetList => usize::from(read_u8(code, ip + 1)) + 1,
        OpCode::ForInLoop => usize::from(read_u8(code, ip + 2)),
        _ => 0,
    }
}

impl VM {
    // ===== Stack helpers =====

    #[inline]
    fn push(&mut self, value: Value) {
        self.state.stack.push(value);
    }

    #[inline]
    fn pop_top(&mut self) -> Value {
        self.state.stack.pop().unwrap_or_default()
    }

    /// Value `depth` slots below the top without removing it
    #[inline]
    fn peek(&self, depth: usize) -> Value {
        let len = self.state.stack.len();
        self.state.stack.get(len.wrapping_sub(depth + 1)).copied().unwrap_or_default()
    }

    #[inline]
    fn set_top_value(&mut self, value: Value) {
        if let Some(top) = self.state.stack.last_mut() {
            *top = value;
        }
    }

    fn drop_values(&mut self, count: usize) {
        let len = self.state.stack.len().saturating_sub(count);
        self.state.stack.truncate(len);
    }

    // ===== Upvalues =====

    /// Find or create the open cell for an absolute stack slot
    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        match self.state.open_upvalues.binary_search_by_key(&slot, |&(s, _)| s) {
            Ok(i) => self.state.open_upvalues[i].1,
            Err(i) => {
                let cell = self.heap.alloc(Object::Upvalue(Upvalue::Open {
                    thread: self.current,
                    slot,
                }));
                self.state.open_upvalues.insert(i, (slot, cell));
                cell
            }
        }
    }

    /// Close every open cell at or above `from`, copying the slot's value in
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let start = self.state.open_upvalues.partition_point(|&(slot, _)| slot < from);
        if start == self.state.open_upvalues.len() {
            return;
        }
        let closing = self.state.open_upvalues.split_off(start);
        for (slot, cell) in closing {
            let value = self.state.stack.get(slot).copied().unwrap_or_default();
            self.heap.set_upvalue(cell, Upvalue::Closed(value));
        }
    }

    pub(crate) fn read_upvalue(&self, cell: Handle) -> Value {
        match self.heap.upvalue(cell) {
            Upvalue::Closed(value) => value,
            Upvalue::Open { thread, slot } => self
                .thread_stack(thread)
                .and_then(|stack| stack.get(slot).copied())
                .unwrap_or_default(),
        }
    }

    pub(crate) fn write_upvalue(&mut self, cell: Handle, value: Value) {
        match self.heap.upvalue(cell) {
            Upvalue::Closed(_) => self.heap.set_upvalue(cell, Upvalue::Closed(value)),
            Upvalue::Open { thread, slot } => {
                if thread == self.current {
                    if let Some(target) = self.state.stack.get_mut(slot) {
                        *target = value;
                    }
                } else if let Some((_, state)) = self.resumers.iter_mut().find(|(h, _)| *h == thread) {
                    if let Some(target) = state.stack.get_mut(slot) {
                        *target = value;
                    }
                } else {
                    if let Some(state) = self.heap.thread_mut(thread).state.as_mut() {
                        if let Some(target) = state.stack.get_mut(slot) {
                            *target = value;
                        }
                    }
                    self.heap.barrier(thread, value);
                }
            }
        }
    }

    fn thread_stack(&self, thread: Handle) -> Option<&Vec<Value>> {
        if thread == self.current {
            return Some(&self.state.stack);
        }
        if let Some((_, state)) = self.resumers.iter().find(|(h, _)| *h == thread) {
            return Some(&state.stack);
        }
        self.heap.thread(thread).state.as_ref().map(|state| &state.stack)
    }

    fn closure_upvalue(&self, closure: Handle, index: usize) -> Option<Handle> {
        match self.heap.function(closure) {
            Function::Lua(c) => c.upvalues.get(index).copied(),
            Function::Native(_) => None,
        }
    }

    // ===== Safe points =====

    #[inline]
    fn safe_point(&mut self) -> VmResult<()> {
        if self.heap.should_step() || self.heap.over_limit() {
            self.gc_safe_point()?;
        }
        self.poll_interrupt()
    }

    fn for_number(&mut self, value: Value, what: &str) -> VmResult<f64> {
        match self.coerce_number(value) {
            Some(n) => Ok(n),
            None => Err(self.runtime_error(format!("'for' {what} must be a number"))),
        }
    }

    fn bad_bytecode(&mut self, what: &str) -> crate::vm::Error {
        self.runtime_error(format!("malformed bytecode: {what}"))
    }

    /// Start of the top `count` values, which must lie above the frame's
    /// closure slot at `base`
    fn operands(&mut self, base: usize, count: usize) -> VmResult<usize> {
        match self.state.stack.len().checked_sub(count) {
            Some(start) if start > base => Ok(start),
            _ => Err(self.bad_bytecode("stack underflow")),
        }
    }

    /// Absolute slot of a loop's three control values
    fn loop_slot(&mut self, base: usize, code: &[u8], ip: usize) -> VmResult<usize> {
        let slot = base + usize::from(read_u8(code, ip + 1));
        if slot + 2 < self.state.stack.len() {
            Ok(slot)
        } else {
            Err(self.bad_bytecode("loop slot out of range"))
        }
    }

    /// Execute script frames until the frame count drops to `stop`
    pub(crate) fn run(&mut self, stop: usize) -> VmResult<ExecOutcome> {
        'frame: loop {
            if self.state.frames.len() <= stop {
                return Ok(ExecOutcome::Finished);
            }
            let fi = self.state.frames.len() - 1;
            let (proto, base, closure) = {
                let frame = &self.state.frames[fi];
                match &frame.proto {
                    Some(proto) => (std::rc::Rc::clone(proto), frame.base, frame.function),
                    None => return Err(self.bad_bytecode("native frame in dispatch loop")),
                }
            };
            let env = match self.heap.function(closure) {
                Function::Lua(c) => c.env,
                Function::Native(_) => self.globals,
            };
            let code: &[u8] = &proto.code;
            let constants = &proto.constants;

            loop {
                self.safe_point()?;
                let ip = self.state.frames[fi].ip;
                let Some(&byte) = code.get(ip) else {
                    return Err(self.bad_bytecode("instruction pointer out of range"));
                };
                let Ok(op) = OpCode::try_from(byte) else {
                    return Err(self.bad_bytecode("invalid opcode"));
                };
                let next = ip + op.size();
                self.state.frames[fi].ip = next;
                let needed = fixed_operands(op, code, ip);
                if needed > 0 {
                    self.operands(base, needed)?;
                }

                match op {
                    // ===== Stack operations =====
                    OpCode::Nil => self.push(Value::Nil),
                    OpCode::True => self.push(Value::Boolean(true)),
                    OpCode::False => self.push(Value::Boolean(false)),
                    OpCode::Const => {
                        let k = usize::from(read_u16(code, ip + 1));
                        let value = constants.get(k).copied().unwrap_or_default();
                        self.push(value);
                    }
                    OpCode::Pop => {
                        self.pop_top();
                    }
                    OpCode::PopN => self.drop_values(usize::from(read_u8(code, ip + 1))),
                    OpCode::Dup => {
                        let value = self.peek(0);
                        self.push(value);
                    }
                    OpCode::Pick => {
                        let value = self.peek(usize::from(read_u8(code, ip + 1)));
                        self.push(value);
                    }

                    // ===== Variables =====
                    OpCode::GetLocal => {
                        let slot = base + usize::from(read_u8(code, ip + 1));
                        let Some(&value) = self.state.stack.get(slot) else {
                            return Err(self.bad_bytecode("local slot out of range"));
                        };
                        self.push(value);
                    }
                    OpCode::SetLocal => {
                        let slot = base + usize::from(read_u8(code, ip + 1));
                        let value = self.pop_top();
                        match self.state.stack.get_mut(slot) {
                            Some(target) => *target = value,
                            None => return Err(self.bad_bytecode("local slot out of range")),
                        }
                    }
                    OpCode::GetUpvalue => {
                        let index = usize::from(read_u8(code, ip + 1));
                        let Some(cell) = self.closure_upvalue(closure, index) else {
                            return Err(self.bad_bytecode("upvalue index out of range"));
                        };
                        let value = self.read_upvalue(cell);
                        self.push(value);
                    }
                    OpCode::SetUpvalue => {
                        let index = usize::from(read_u8(code, ip + 1));
                        let Some(cell) = self.closure_upvalue(closure, index) else {
                            return Err(self.bad_bytecode("upvalue index out of range"));
                        };
                        let value = self.pop_top();
                        self.write_upvalue(cell, value);
                    }
                    OpCode::Close => {
                        let slot = base + usize::from(read_u8(code, ip + 1));
                        self.close_upvalues(slot);
                    }
                    OpCode::GetGlobal => {
                        let name = constants.get(usize::from(read_u16(code, ip + 1))).copied().unwrap_or_default();
                        let value = self.index_value(Value::Table(env), name)?;
                        self.push(value);
                    }
                    OpCode::SetGlobal => {
                        let name = constants.get(usize::from(read_u16(code, ip + 1))).copied().unwrap_or_default();
                        let value = self.peek(0);
                        self.set_index(Value::Table(env), name, value)?;
                        self.pop_top();
                    }

                    // ===== Tables =====
                    OpCode::NewTable => {
                        let array = usize::from(read_u16(code, ip + 1));
                        let hash = usize::from(read_u16(code, ip + 3));
                        let table = self.heap.new_table(array, hash);
                        self.push(Value::Table(table));
                    }
                    OpCode::GetIndex => {
                        let key = self.peek(0);
                        let object = self.peek(1);
                        let value = self.index_value(object, key)?;
                        self.drop_values(2);
                        self.push(value);
                    }
                    OpCode::SetIndex => {
                        let value = self.peek(0);
                        let key = self.peek(1);
                        let object = self.peek(2);
                        self.set_index(object, key, value)?;
                        self.drop_values(3);
                    }
                    OpCode::GetField => {
                        let name = constants.get(usize::from(read_u16(code, ip + 1))).copied().unwrap_or_default();
                        let object = self.peek(0);
                        let value = self.index_value(object, name)?;
                        self.set_top_value(value);
                    }
                    OpCode::SetField => {
                        let name = constants.get(usize::from(read_u16(code, ip + 1))).copied().unwrap_or_default();
                        let value = self.peek(0);
                        let object = self.peek(1);
                        self.set_index(object, name, value)?;
                        self.drop_values(2);
                    }
                    OpCode::InitField => {
                        let name = constants.get(usize::from(read_u16(code, ip + 1))).copied().unwrap_or_default();
                        let value = self.peek(0);
                        if let Value::Table(table) = self.peek(1) {
                            self.raw_store(table, name, value)?;
                        }
                        self.pop_top();
                    }
                    OpCode::InitIndex => {
                        let value = self.peek(0);
                        let key = self.peek(1);
                        if let Value::Table(table) = self.peek(2) {
                            self.raw_store(table, key, value)?;
                        }
                        self.drop_values(2);
                    }
                    OpCode::SetList => {
                        let count = usize::from(read_u8(code, ip + 1));
                        let multi = read_u8(code, ip + 2) != 0;
                        let start = read_u32(code, ip + 3) as usize;
                        let n = count + if multi { self.state.frames[fi].multi } else { 0 };
                        let slot = self.operands(base, n + 1)?;
                        if let Value::Table(table) = self.state.stack[slot] {
                            let values: Vec<Value> = self.state.stack[slot + 1..].to_vec();
                            self.heap.table_set_list(table, start, &values);
                        }
                        self.drop_values(n);
                    }
                    OpCode::SelfOp => {
                        let name = constants.get(usize::from(read_u16(code, ip + 1))).copied().unwrap_or_default();
                        let object = self.peek(0);
                        let method = self.index_value(object, name)?;
                        self.set_top_value(method);
                        self.push(object);
                    }

                    // ===== Arithmetic and logic =====
                    OpCode::Add
                    | OpCode::Sub
                    | OpCode::Mul
                    | OpCode::Div
                    | OpCode::IDiv
                    | OpCode::Mod
                    | OpCode::Pow => {
                        let op = match op {
                            OpCode::Add => ArithOp::Add,
                            OpCode::Sub => ArithOp::Sub,
                            OpCode::Mul => ArithOp::Mul,
                            OpCode::Div => ArithOp::Div,
                            OpCode::IDiv => ArithOp::IDiv,
                            OpCode::Mod => ArithOp::Mod,
                            _ => ArithOp::Pow,
                        };
                        let b = self.peek(0);
                        let a = self.peek(1);
                        let result = if let (Value::Number(x), Value::Number(y)) = (a, b) {
                            Value::Number(number::arith(op, x, y))
                        } else {
                            self.arith(op, a, b)?
                        };
                        self.drop_values(2);
                        self.push(result);
                    }
                    OpCode::Unm => {
                        let value = self.peek(0);
                        let result = match value {
                            Value::Number(n) => Value::Number(-n),
                            _ => self.unary_minus(value)?,
                        };
                        self.set_top_value(result);
                    }
                    OpCode::Not => {
                        let value = self.peek(0);
                        self.set_top_value(Value::Boolean(!value.is_truthy()));
                    }
                    OpCode::Len => {
                        let value = self.peek(0);
                        let result = self.length(value)?;
                        self.set_top_value(result);
                    }
                    OpCode::Concat => {
                        let count = usize::from(read_u8(code, ip + 1));
                        let result = self.concat(count)?;
                        self.drop_values(count);
                        self.push(result);
                    }
                    OpCode::ToStr => {
                        let value = self.peek(0);
                        let result = self.tostring_value(value)?;
                        self.set_top_value(result);
                    }

                    // ===== Comparison =====
                    OpCode::Eq | OpCode::Ne => {
                        let b = self.peek(0);
                        let a = self.peek(1);
                        let equal = self.equals(a, b)?;
                        self.drop_values(2);
                        self.push(Value::Boolean(equal == (op == OpCode::Eq)));
                    }
                    OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge => {
                        let b = self.peek(0);
                        let a = self.peek(1);
                        let result = match op {
                            OpCode::Lt => self.less_than(a, b)?,
                            OpCode::Le => self.less_equal(a, b)?,
                            OpCode::Gt => self.less_than(b, a)?,
                            _ => self.less_equal(b, a)?,
                        };
                        self.drop_values(2);
                        self.push(Value::Boolean(result));
                    }

                    // ===== Control flow =====
                    OpCode::Jump => {
                        self.state.frames[fi].ip = jump(next, read_i16(code, ip + 1));
                    }
                    OpCode::JumpIfFalse => {
                        if !self.pop_top().is_truthy() {
                            self.state.frames[fi].ip = jump(next, read_i16(code, ip + 1));
                        }
                    }
                    OpCode::JumpIfTrue => {
                        if self.pop_top().is_truthy() {
                            self.state.frames[fi].ip = jump(next, read_i16(code, ip + 1));
                        }
                    }
                    OpCode::JumpIfFalseOrPop => {
                        if self.peek(0).is_truthy() {
                            self.pop_top();
                        } else {
                            self.state.frames[fi].ip = jump(next, read_i16(code, ip + 1));
                        }
                    }
                    OpCode::JumpIfTrueOrPop => {
                        if self.peek(0).is_truthy() {
                            self.state.frames[fi].ip = jump(next, read_i16(code, ip + 1));
                        } else {
                            self.pop_top();
                        }
                    }

                    // ===== Functions =====
                    OpCode::Call => {
                        let argc = usize::from(read_u8(code, ip + 1));
                        let multi = read_u8(code, ip + 2) != 0;
                        let nresults = read_u8(code, ip + 3);
                        let nargs = argc + if multi { self.state.frames[fi].multi } else { 0 };
                        let func = self.operands(base, nargs + 1)?;
                        match self.prepare_call(func, nresults)? {
                            CallOutcome::Lua => continue 'frame,
                            CallOutcome::Done => {}
                            CallOutcome::Yield => return Ok(ExecOutcome::Yielded),
                        }
                    }
                    OpCode::Return => {
                        let count = usize::from(read_u8(code, ip + 1));
                        let multi = read_u8(code, ip + 2) != 0;
                        let count = count + if multi { self.state.frames[fi].multi } else { 0 };
                        self.operands(base, count)?;
                        let Some(frame) = self.state.frames.pop() else {
                            return Err(self.bad_bytecode("return without a frame"));
                        };
                        self.return_from(frame, count);
                        continue 'frame;
                    }
                    OpCode::Closure => {
                        let child = usize::from(read_u16(code, ip + 1));
                        let Some(&proto_handle) = proto.children.get(child) else {
                            return Err(self.bad_bytecode("child prototype out of range"));
                        };
                        let child_proto = std::rc::Rc::clone(self.heap.proto(proto_handle));
                        let count = usize::from(child_proto.num_upvalues);
                        let mut upvalues = Vec::with_capacity(count);
                        for i in 0..count {
                            let is_local = read_u8(code, next + 2 * i) != 0;
                            let index = usize::from(read_u8(code, next + 2 * i + 1));
                            let cell = if is_local {
                                self.capture_upvalue(base + index)
                            } else {
                                match self.closure_upvalue(closure, index) {
                                    Some(cell) => cell,
                                    None => return Err(self.bad_bytecode("upvalue index out of range")),
                                }
                            };
                            upvalues.push(cell);
                        }
                        self.state.frames[fi].ip = next + 2 * count;
                        let function = self.heap.alloc(Object::Function(Function::Lua(crate::value::LuaClosure {
                            proto: child_proto,
                            proto_handle,
                            upvalues: upvalues.into_boxed_slice(),
                            env,
                        })));
                        self.push(Value::Function(function));
                    }
                    OpCode::VarArg => {
                        let wanted = read_u8(code, ip + 1);
                        let frame = &self.state.frames[fi];
                        let available = frame.varargs.len();
                        if wanted == MULTI {
                            let varargs = frame.varargs.clone();
                            self.state.stack.extend_from_slice(&varargs);
                            self.state.frames[fi].multi = available;
                        } else {
                            let wanted = usize::from(wanted);
                            let varargs: Vec<Value> = frame.varargs.iter().copied().take(wanted).collect();
                            self.state.stack.extend_from_slice(&varargs);
                            for _ in available..wanted {
                                self.push(Value::Nil);
                            }
                        }
                    }

                    // ===== Loops =====
                    OpCode::ForPrep => {
                        let slot = self.loop_slot(base, code, ip)?;
                        let start = self.state.stack[slot];
                        let limit = self.state.stack[slot + 1];
                        let step = self.state.stack[slot + 2];
                        let start = self.for_number(start, "initial value")?;
                        let limit = self.for_number(limit, "limit")?;
                        let step = self.for_number(step, "step")?;
                        if step == 0.0 {
                            return Err(self.runtime_error("'for' step is zero"));
                        }
                        self.state.stack[slot] = Value::Number(start);
                        self.state.stack[slot + 1] = Value::Number(limit);
                        self.state.stack[slot + 2] = Value::Number(step);
                        let enters = if step > 0.0 { start <= limit } else { start >= limit };
                        if !enters {
                            self.state.frames[fi].ip = jump(next, read_i16(code, ip + 2));
                        }
                    }
                    OpCode::ForLoop => {
                        let slot = self.loop_slot(base, code, ip)?;
                        if let (Value::Number(index), Value::Number(limit), Value::Number(step)) = (
                            self.state.stack[slot],
                            self.state.stack[slot + 1],
                            self.state.stack[slot + 2],
                        ) {
                            let index = index + step;
                            self.state.stack[slot] = Value::Number(index);
                            let continues = if step > 0.0 { index <= limit } else { index >= limit };
                            if continues {
                                self.state.frames[fi].ip = jump(next, read_i16(code, ip + 2));
                            }
                        }
                    }
                    OpCode::ForInPrep => {
                        let slot = self.loop_slot(base, code, ip)?;
                        self.prepare_generic_for(slot)?;
                    }
                    OpCode::ForInCall => {
                        let slot = self.loop_slot(base, code, ip)?;
                        let count = read_u8(code, ip + 2);
                        if self.next_fast_path(slot, usize::from(count))? {
                            continue;
                        }
                        let func = self.state.stack.len();
                        let (generator, state, control) = (
                            self.state.stack[slot],
                            self.state.stack[slot + 1],
                            self.state.stack[slot + 2],
                        );
                        self.state.stack.extend_from_slice(&[generator, state, control]);
                        match self.prepare_call(func, count)? {
                            CallOutcome::Lua => continue 'frame,
                            CallOutcome::Done => {}
                            CallOutcome::Yield => return Ok(ExecOutcome::Yielded),
                        }
                    }
                    OpCode::ForInLoop => {
                        let slot = self.loop_slot(base, code, ip)?;
                        let count = usize::from(read_u8(code, ip + 2));
                        let first = self.peek(count.saturating_sub(1));
                        if first.is_nil() {
                            self.drop_values(count);
                            self.state.frames[fi].ip = jump(next, read_i16(code, ip + 3));
                        } else {
                            self.state.stack[slot + 2] = first;
                        }
                    }
                }
            }
        }
    }

    /// Resolve what a generic `for` iterates over
    fn prepare_generic_for(&mut self, slot: usize) -> VmResult<()> {
        let generator = self.state.stack[slot];
        if matches!(generator, Value::Function(_)) {
            return Ok(());
        }
        let iter = self.metamethod(generator, super::Event::Iter);
        if !iter.is_nil() {
            let func = self.state.stack.len();
            self.state.stack.extend_from_slice(&[iter, generator]);
            self.call_at(func, 3)?;
            let produced: Vec<Value> = self.state.stack.drain(func..).collect();
            for (target, value) in self.state.stack[slot..slot + 3].iter_mut().zip(produced) {
                *target = value;
            }
            return Ok(());
        }
        let callable = !self.metamethod(generator, super::Event::Call).is_nil();
        match generator {
            Value::Table(_) if !callable => {
                self.state.stack[slot] = self.next_fn;
                self.state.stack[slot + 1] = generator;
                self.state.stack[slot + 2] = Value::Nil;
                Ok(())
            }
            _ if callable => Ok(()),
            _ => {
                let name = self.type_name_of(generator);
                Err(self.runtime_error(format!("attempt to iterate over a {name} value")))
            }
        }
    }

    /// Iterate a plain table without calling `next` through the call path
    fn next_fast_path(&mut self, slot: usize, count: usize) -> VmResult<bool> {
        let generator = self.state.stack[slot];
        let Value::Table(table) = self.state.stack[slot + 1] else {
            return Ok(false);
        };
        if !generator.raw_equal(&self.next_fn) {
            return Ok(false);
        }
        let control = self.state.stack[slot + 2];
        let entry = match self.heap.table(table).next(&control) {
            Ok(entry) => entry,
            Err(err) => return Err(self.runtime_error(err.to_string())),
        };
        let (key, value) = entry.unwrap_or((Value::Nil, Value::Nil));
        let values = [key, value];
        for i in 0..count {
            let v = values.get(i).copied().unwrap_or_default();
            self.state.stack.push(v);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{run, run_err};

    #[test]
    fn test_locals_and_arithmetic() {
        assert_eq!(run("local x = 10 local y = 20 return x + y").unwrap(), vec!["30"]);
        assert_eq!(run("return 7 // 2, 7 % 3, 2 ^ 10, -7 % 3").unwrap(), vec!["3", "1", "1024", "2"]);
        assert_eq!(run("return 1 / 0, -1 / 0").unwrap(), vec!["inf", "-inf"]);
    }

    #[test]
    fn test_string_coercion_in_arithmetic() {
        assert_eq!(run("return '10' + 5, '0x10' * 1").unwrap(), vec!["15", "16"]);
        assert_eq!(run_err("return 'abc' + 1"), "string:1: attempt to perform arithmetic on a string value");
    }

    #[test]
    fn test_numeric_for() {
        assert_eq!(run("local s = 0 for i = 1, 10 do s += i end return s").unwrap(), vec!["55"]);
        assert_eq!(run("local s = 0 for i = 10, 1, -2 do s += i end return s").unwrap(), vec!["30"]);
        assert_eq!(run("local n = 0 for i = 1, 0 do n += 1 end return n").unwrap(), vec!["0"]);
        assert_eq!(run_err("for i = 1, 2, 0 do end"), "string:1: 'for' step is zero");
        assert_eq!(run_err("for i = 'x', 2 do end"), "string:1: 'for' initial value must be a number");
    }

    #[test]
    fn test_generic_for_over_pairs_and_tables() {
        let source = r"
            local t = {10, 20, 30}
            local s = 0
            for i, v in ipairs(t) do s += i * v end
            for k, v in t do s += v end
            local keys = 0
            for k in pairs({a = 1, b = 2}) do keys += 1 end
            return s, keys
        ";
        assert_eq!(run(source).unwrap(), vec!["200", "2"]);
    }

    #[test]
    fn test_generic_for_with_closure_iterator() {
        let source = r"
            local function range(n)
                local i = 0
                return function()
                    i += 1
                    if i <= n then return i end
                end
            end
            local s = 0
            for i in range(4) do s += i end
            return s
        ";
        assert_eq!(run(source).unwrap(), vec!["10"]);
    }

    #[test]
    fn test_iter_metamethod() {
        let source = r"
            local obj = setmetatable({}, {__iter = function(self)
                local i = 0
                return function() i += 1 if i <= 3 then return i, i * i end end
            end})
            local s = 0
            for i, sq in obj do s += sq end
            return s
        ";
        assert_eq!(run(source).unwrap(), vec!["14"]);
        assert_eq!(run_err("for x in 5 do end"), "string:1: attempt to iterate over a number value");
    }

    #[test]
    fn test_closures_share_upvalues() {
        let source = r"
            local function counter()
                local n = 0
                return function() n += 1 return n end, function() return n end
            end
            local inc, get = counter()
            inc() inc() inc()
            return get()
        ";
        assert_eq!(run(source).unwrap(), vec!["3"]);
    }

    #[test]
    fn test_loop_closures_capture_fresh_locals() {
        let source = r"
            local fns = {}
            for i = 1, 3 do
                fns[i] = function() return i end
            end
            return fns[1]() + fns[2]() + fns[3]()
        ";
        assert_eq!(run(source).unwrap(), vec!["6"]);
    }

    #[test]
    fn test_varargs_and_select() {
        let source = r"
            local function f(...)
                local a, b = ...
                return select('#', ...), a, b, ...
            end
            return f(1, nil, 3)
        ";
        assert_eq!(run(source).unwrap(), vec!["3", "1", "nil", "1", "nil", "3"]);
    }

    #[test]
    fn test_multiple_returns_expand_in_tables_and_calls() {
        let source = r"
            local function three() return 1, 2, 3 end
            local t = {three(), three()}
            return #t, select('#', three(), three())
        ";
        assert_eq!(run(source).unwrap(), vec!["4", "4"]);
    }

    #[test]
    fn test_logical_operators_short_circuit() {
        assert_eq!(run("return nil and 1, false or 'x', 1 and 2, nil or false").unwrap(), vec![
            "nil", "x", "2", "false"
        ]);
    }

    #[test]
    fn test_repeat_and_continue() {
        let source = r"
            local i, s = 0, 0
            repeat
                i += 1
                if i % 2 == 0 then continue end
                s += i
            until i >= 9
            return s
        ";
        assert_eq!(run(source).unwrap(), vec!["25"]);
    }

    #[test]
    fn test_string_interpolation_and_concat() {
        assert_eq!(run("local n = 3 return `n = {n}!`, 'a' .. 1 .. 'b'").unwrap(), vec!["n = 3!", "a1b"]);
        assert_eq!(run_err("return 'a' .. {}"), "string:1: attempt to concatenate a table value");
    }

    #[test]
    fn test_method_calls() {
        let source = r"
            local obj = {n = 5}
            function obj:add(k) self.n += k return self end
            obj:add(2):add(3)
            return obj.n, ('abc'):upper()
        ";
        assert_eq!(run(source).unwrap(), vec!["10", "ABC"]);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(run("return 1 < 2, 'a' < 'b', 2 >= 2, 3 > 4").unwrap(), vec!["true", "true", "true", "false"]);
        assert_eq!(run_err("return 1 < 'x'"), "string:1: attempt to compare number with string");
        assert_eq!(run_err("return {} < {}"), "string:1: attempt to compare two table values");
    }

    #[test]
    fn test_if_expression_and_while() {
        let source = r"
            local n, steps = 27, 0
            while n ~= 1 do
                n = if n % 2 == 0 then n // 2 else 3 * n + 1
                steps += 1
            end
            return steps
        ";
        assert_eq!(run(source).unwrap(), vec!["111"]);
    }

    #[test]
    fn test_vector_arithmetic_and_fields() {
        let source = r"
            local v = vector(1, 2, 3) + vector(1, 1, 1) * 2
            return v.x, v.Y, v.z, -v
        ";
        assert_eq!(run(source).unwrap(), vec!["3", "4", "5", "-3, -4, -5"]);
    }
}
