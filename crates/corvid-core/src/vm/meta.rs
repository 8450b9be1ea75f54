//! Metatable-aware operations: indexing, arithmetic, comparison, concatenation

use super::{VmResult, VM};
use crate::gc::Handle;
use crate::value::number::{self, ArithOp};
use crate::value::{Function, Value, Vector};

/// Longest `__index`/`__newindex` chain followed before giving up
const MAX_META_CHAIN: usize = 100;

/// Metamethod names the VM looks up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Index,
    NewIndex,
    Call,
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Unm,
    Concat,
    Len,
    Eq,
    Lt,
    Le,
    ToString,
    Metatable,
    Iter,
    Name,
    Type,
}

impl Event {
    pub const ALL: [Event; 21] = [
        Event::Index,
        Event::NewIndex,
        Event::Call,
        Event::Add,
        Event::Sub,
        Event::Mul,
        Event::Div,
        Event::IDiv,
        Event::Mod,
        Event::Pow,
        Event::Unm,
        Event::Concat,
        Event::Len,
        Event::Eq,
        Event::Lt,
        Event::Le,
        Event::ToString,
        Event::Metatable,
        Event::Iter,
        Event::Name,
        Event::Type,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Event::Index => "__index",
            Event::NewIndex => "__newindex",
            Event::Call => "__call",
            Event::Add => "__add",
            Event::Sub => "__sub",
            Event::Mul => "__mul",
            Event::Div => "__div",
            Event::IDiv => "__idiv",
            Event::Mod => "__mod",
            Event::Pow => "__pow",
            Event::Unm => "__unm",
            Event::Concat => "__concat",
            Event::Len => "__len",
            Event::Eq => "__eq",
            Event::Lt => "__lt",
            Event::Le => "__le",
            Event::ToString => "__tostring",
            Event::Metatable => "__metatable",
            Event::Iter => "__iter",
            Event::Name => "__name",
            Event::Type => "__type",
        }
    }

    fn for_arith(op: ArithOp) -> Event {
        match op {
            ArithOp::Add => Event::Add,
            ArithOp::Sub => Event::Sub,
            ArithOp::Mul => Event::Mul,
            ArithOp::Div => Event::Div,
            ArithOp::IDiv => Event::IDiv,
            ArithOp::Mod => Event::Mod,
            ArithOp::Pow => Event::Pow,
        }
    }
}

impl VM {
    pub(crate) fn event_key(&self, event: Event) -> Value {
        Value::String(self.events[event as usize])
    }

    pub(crate) fn metatable_of(&self, value: Value) -> Option<Handle> {
        match value {
            Value::Table(h) => self.heap.table(h).metatable,
            Value::Userdata(h) => self.heap.userdata(h).metatable,
            Value::String(_) => self.string_meta,
            _ => None,
        }
    }

    /// Raw metatable field, or nil
    pub(crate) fn metamethod(&self, value: Value, event: Event) -> Value {
        match self.metatable_of(value) {
            Some(mt) => self.heap.table(mt).get(&self.event_key(event)),
            None => Value::Nil,
        }
    }

    /// Type name for messages, honoring `__name`
    pub(crate) fn type_name_of(&self, value: Value) -> String {
        if matches!(value, Value::Table(_) | Value::Userdata(_)) {
            if let Value::String(name) = self.metamethod(value, Event::Name) {
                return String::from_utf8_lossy(self.heap.string(name)).into_owned();
            }
        }
        value.type_name().to_string()
    }

    /// `typeof`: `__type` for userdata, otherwise the plain type name
    pub(crate) fn typeof_name(&self, value: Value) -> String {
        if let Value::Userdata(_) = value {
            if let Value::String(name) = self.metamethod(value, Event::Type) {
                return String::from_utf8_lossy(self.heap.string(name)).into_owned();
            }
        }
        value.type_name().to_string()
    }

    pub(crate) fn coerce_number(&self, value: Value) -> Option<f64> {
        match value {
            Value::String(h) => number::str_to_number(self.heap.string(h)),
            other => other.as_number(),
        }
    }

    // ===== Indexing =====

    /// Raw store honoring the readonly flag
    pub(crate) fn raw_store(&mut self, table: Handle, key: Value, value: Value) -> VmResult<()> {
        if self.heap.table(table).readonly {
            return Err(self.runtime_error("attempt to modify a readonly table"));
        }
        match self.heap.table_set(table, key, value) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.runtime_error(err.to_string())),
        }
    }

    fn index_error(&mut self, object: Value) -> super::Error {
        let name = self.type_name_of(object);
        self.runtime_error(format!("attempt to index a {name} value"))
    }

    /// `object[key]` with `__index`
    pub(crate) fn index_value(&mut self, object: Value, key: Value) -> VmResult<Value> {
        let mut object = object;
        for _ in 0..MAX_META_CHAIN {
            let handler = match object {
                Value::Table(h) => {
                    let table = self.heap.table(h);
                    let value = table.get(&key);
                    if !value.is_nil() {
                        return Ok(value);
                    }
                    let Some(mt) = table.metatable else {
                        return Ok(Value::Nil);
                    };
                    let handler = self.heap.table(mt).get(&self.event_key(Event::Index));
                    if handler.is_nil() {
                        return Ok(Value::Nil);
                    }
                    handler
                }
                Value::Vector(v) => return self.vector_field(v, key),
                _ => {
                    let handler = self.metamethod(object, Event::Index);
                    if handler.is_nil() {
                        return Err(self.index_error(object));
                    }
                    handler
                }
            };
            if let Value::Function(_) = handler {
                return self.call_meta(handler, &[object, key]);
            }
            object = handler;
        }
        Err(self.runtime_error("'__index' chain too long; possible loop"))
    }

    fn vector_field(&mut self, v: Vector, key: Value) -> VmResult<Value> {
        if let Value::String(h) = key {
            let component = match self.heap.string(h) {
                b"x" | b"X" => Some(v.x),
                b"y" | b"Y" => Some(v.y),
                b"z" | b"Z" => Some(v.z),
                _ => None,
            };
            if let Some(c) = component {
                return Ok(Value::Number(f64::from(c)));
            }
            let name = String::from_utf8_lossy(self.heap.string(h)).into_owned();
            return Err(self.runtime_error(format!("attempt to index vector with '{name}'")));
        }
        Err(self.runtime_error("attempt to index a vector value"))
    }

    /// `object[key] = value` with `__newindex`
    pub(crate) fn set_index(&mut self, object: Value, key: Value, value: Value) -> VmResult<()> {
        let mut object = object;
        for _ in 0..MAX_META_CHAIN {
            let handler = match object {
                Value::Table(h) => {
                    let table = self.heap.table(h);
                    if table.readonly {
                        return Err(self.runtime_error("attempt to modify a readonly table"));
                    }
                    let handler = match table.metatable {
                        Some(mt) if table.get(&key).is_nil() => {
                            self.heap.table(mt).get(&self.event_key(Event::NewIndex))
                        }
                        _ => Value::Nil,
                    };
                    if handler.is_nil() {
                        return self.raw_store(h, key, value);
                    }
                    handler
                }
                _ => {
                    let handler = self.metamethod(object, Event::NewIndex);
                    if handler.is_nil() {
                        return Err(self.index_error(object));
                    }
                    handler
                }
            };
            if let Value::Function(_) = handler {
                let func = self.state.stack.len();
                self.state.stack.extend_from_slice(&[handler, object, key, value]);
                self.call_at(func, 0)?;
                self.state.stack.truncate(func);
                return Ok(());
            }
            object = handler;
        }
        Err(self.runtime_error("'__newindex' chain too long; possible loop"))
    }

    // ===== Arithmetic =====

    pub(crate) fn arith(&mut self, op: ArithOp, a: Value, b: Value) -> VmResult<Value> {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(Value::Number(number::arith(op, x, y)));
        }
        if let Some(v) = vector_arith(op, a, b) {
            return Ok(Value::Vector(v));
        }
        if let (Some(x), Some(y)) = (self.coerce_number(a), self.coerce_number(b)) {
            return Ok(Value::Number(number::arith(op, x, y)));
        }
        let event = Event::for_arith(op);
        let mut handler = self.metamethod(a, event);
        if handler.is_nil() {
            handler = self.metamethod(b, event);
        }
        if !handler.is_nil() {
            return self.call_meta(handler, &[a, b]);
        }
        let culprit = if self.coerce_number(a).is_none() && !matches!(a, Value::Vector(_)) {
            a
        } else {
            b
        };
        let name = self.type_name_of(culprit);
        Err(self.runtime_error(format!("attempt to perform arithmetic on a {name} value")))
    }

    pub(crate) fn unary_minus(&mut self, value: Value) -> VmResult<Value> {
        if let Value::Vector(v) = value {
            return Ok(Value::Vector(v.map(|c| -c)));
        }
        if let Some(n) = self.coerce_number(value) {
            return Ok(Value::Number(-n));
        }
        let handler = self.metamethod(value, Event::Unm);
        if !handler.is_nil() {
            return self.call_meta(handler, &[value, value]);
        }
        let name = self.type_name_of(value);
        Err(self.runtime_error(format!("attempt to perform arithmetic on a {name} value")))
    }

    /// `#value`
    pub(crate) fn length(&mut self, value: Value) -> VmResult<Value> {
        match value {
            Value::String(h) => Ok(Value::Number(self.heap.string(h).len() as f64)),
            Value::Buffer(h) => Ok(Value::Number(self.heap.buffer(h).len() as f64)),
            _ => {
                let handler = self.metamethod(value, Event::Len);
                if !handler.is_nil() {
                    return self.call_meta(handler, &[value]);
                }
                if let Value::Table(h) = value {
                    return Ok(Value::Number(self.heap.table(h).len() as f64));
                }
                let name = self.type_name_of(value);
                Err(self.runtime_error(format!("attempt to get length of a {name} value")))
            }
        }
    }

    // ===== Concatenation =====

    /// Bytes of a string or number operand
    fn concat_piece(&self, value: Value) -> Option<Vec<u8>> {
        match value {
            Value::String(h) => Some(self.heap.string(h).to_vec()),
            Value::Number(_) | Value::Integer(_) | Value::UnsignedInteger(_) => {
                Some(self.display_value(value).into_bytes())
            }
            _ => None,
        }
    }

    /// Concatenate the top `count` values, right to left, without popping them
    pub(crate) fn concat(&mut self, count: usize) -> VmResult<Value> {
        let len = self.state.stack.len();
        let start = len - count;
        let all_plain = self.state.stack[start..]
            .iter()
            .all(|v| matches!(v, Value::String(_) | Value::Number(_) | Value::Integer(_) | Value::UnsignedInteger(_)));
        if all_plain {
            let mut bytes = Vec::new();
            for i in start..len {
                if let Some(piece) = self.concat_piece(self.state.stack[i]) {
                    bytes.extend_from_slice(&piece);
                }
            }
            return Ok(Value::String(self.heap.intern(&bytes)));
        }

        // Fold pairwise in place so intermediate results stay rooted
        for i in (start..len - 1).rev() {
            let left = self.state.stack[i];
            let right = self.state.stack[i + 1];
            let joined = self.concat_pair(left, right)?;
            self.state.stack[i] = joined;
        }
        Ok(self.state.stack[start])
    }

    fn concat_pair(&mut self, left: Value, right: Value) -> VmResult<Value> {
        if let (Some(mut a), Some(b)) = (self.concat_piece(left), self.concat_piece(right)) {
            a.extend_from_slice(&b);
            return Ok(Value::String(self.heap.intern(&a)));
        }
        let mut handler = self.metamethod(left, Event::Concat);
        if handler.is_nil() {
            handler = self.metamethod(right, Event::Concat);
        }
        if !handler.is_nil() {
            return self.call_meta(handler, &[left, right]);
        }
        let culprit = if self.concat_piece(left).is_none() { left } else { right };
        let name = self.type_name_of(culprit);
        Err(self.runtime_error(format!("attempt to concatenate a {name} value")))
    }

    // ===== Comparison =====

    pub(crate) fn equals(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if a.raw_equal(&b) {
            return Ok(true);
        }
        let comparable = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
        );
        if !comparable {
            return Ok(false);
        }
        let mut handler = self.metamethod(a, Event::Eq);
        if handler.is_nil() {
            handler = self.metamethod(b, Event::Eq);
        }
        if handler.is_nil() {
            return Ok(false);
        }
        Ok(self.call_meta(handler, &[a, b])?.is_truthy())
    }

    fn compare_error(&mut self, a: Value, b: Value) -> super::Error {
        let (left, right) = (self.type_name_of(a), self.type_name_of(b));
        if left == right {
            self.runtime_error(format!("attempt to compare two {left} values"))
        } else {
            self.runtime_error(format!("attempt to compare {left} with {right}"))
        }
    }

    pub(crate) fn less_than(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(x < y);
        }
        if let (Value::String(x), Value::String(y)) = (a, b) {
            return Ok(self.heap.string(x) < self.heap.string(y));
        }
        let mut handler = self.metamethod(a, Event::Lt);
        if handler.is_nil() {
            handler = self.metamethod(b, Event::Lt);
        }
        if handler.is_nil() {
            return Err(self.compare_error(a, b));
        }
        Ok(self.call_meta(handler, &[a, b])?.is_truthy())
    }

    pub(crate) fn less_equal(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(x <= y);
        }
        if let (Value::String(x), Value::String(y)) = (a, b) {
            return Ok(self.heap.string(x) <= self.heap.string(y));
        }
        let mut handler = self.metamethod(a, Event::Le);
        if handler.is_nil() {
            handler = self.metamethod(b, Event::Le);
        }
        if !handler.is_nil() {
            return Ok(self.call_meta(handler, &[a, b])?.is_truthy());
        }
        let mut handler = self.metamethod(b, Event::Lt);
        if handler.is_nil() {
            handler = self.metamethod(a, Event::Lt);
        }
        if handler.is_nil() {
            return Err(self.compare_error(a, b));
        }
        Ok(!self.call_meta(handler, &[b, a])?.is_truthy())
    }

    // ===== String conversion =====

    /// Text for a value without consulting metamethods
    #[must_use]
    pub fn display_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => number::format_number(n),
            Value::Integer(i) => i.to_string(),
            Value::UnsignedInteger(u) => u.to_string(),
            Value::Vector(v) => v.to_string(),
            Value::LightUserdata(p) => format!("userdata: 0x{p:016x}"),
            Value::String(h) => String::from_utf8_lossy(self.heap.string(h)).into_owned(),
            Value::Function(h) => match self.heap.function(h) {
                Function::Native(_) => format!("function: builtin: 0x{:08x}", h.index()),
                Function::Lua(_) => format!("function: 0x{:08x}", h.index()),
            },
            Value::Table(h) | Value::Userdata(h) => {
                let name = self.type_name_of(value);
                format!("{name}: 0x{:08x}", h.index())
            }
            Value::Thread(h) => format!("thread: 0x{:08x}", h.index()),
            Value::Buffer(h) => format!("buffer: 0x{:08x}", h.index()),
        }
    }

    /// `tostring(value)` as a string value, honoring `__tostring`
    pub(crate) fn tostring_value(&mut self, value: Value) -> VmResult<Value> {
        if let Value::String(_) = value {
            return Ok(value);
        }
        let handler = self.metamethod(value, Event::ToString);
        if !handler.is_nil() {
            let result = self.call_meta(handler, &[value])?;
            if let Value::String(_) = result {
                return Ok(result);
            }
            return Err(self.runtime_error("'__tostring' must return a string"));
        }
        let text = self.display_value(value);
        Ok(Value::String(self.heap.intern(text.as_bytes())))
    }
}

fn vector_arith(op: ArithOp, a: Value, b: Value) -> Option<Vector> {
    let apply = |x: f32, y: f32| number::arith(op, f64::from(x), f64::from(y)) as f32;
    match (a, b) {
        (Value::Vector(x), Value::Vector(y)) if op != ArithOp::Pow && op != ArithOp::Mod => {
            Some(x.zip(y, apply))
        }
        (Value::Vector(x), s) if matches!(op, ArithOp::Mul | ArithOp::Div | ArithOp::IDiv) => {
            let s = s.as_number()? as f32;
            Some(x.map(|c| apply(c, s)))
        }
        (s, Value::Vector(y)) if matches!(op, ArithOp::Mul | ArithOp::Div) => {
            let s = s.as_number()? as f32;
            Some(y.map(|c| apply(s, c)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{run, run_err};

    #[test]
    fn test_index_chain_through_tables() {
        let source = r"
            local base = {greet = 'hi'}
            local mid = setmetatable({}, {__index = base})
            local top = setmetatable({}, {__index = mid})
            return top.greet, top.missing
        ";
        assert_eq!(run(source).unwrap(), vec!["hi", "nil"]);
    }

    #[test]
    fn test_index_function_and_newindex() {
        let source = r"
            local log = {}
            local proxy = setmetatable({}, {
                __index = function(t, k) return k .. '!' end,
                __newindex = function(t, k, v) rawset(t, k, v * 2) end,
            })
            proxy.a = 5
            return proxy.a, proxy.b
        ";
        assert_eq!(run(source).unwrap(), vec!["10", "b!"]);
    }

    #[test]
    fn test_index_loop_is_detected() {
        let source = "local t = {} setmetatable(t, {__index = t}) return t.x";
        assert_eq!(run_err(source), "string:1: '__index' chain too long; possible loop");
        assert_eq!(run_err("local x = nil return x.field"), "string:1: attempt to index a nil value");
    }

    #[test]
    fn test_arithmetic_metamethods() {
        let source = r"
            local mt = {}
            mt.__add = function(a, b) return setmetatable({v = a.v + b.v}, mt) end
            mt.__eq = function(a, b) return a.v == b.v end
            mt.__lt = function(a, b) return a.v < b.v end
            mt.__len = function(a) return a.v end
            mt.__unm = function(a) return setmetatable({v = -a.v}, mt) end
            local function new(v) return setmetatable({v = v}, mt) end
            local x = new(2) + new(3)
            return x.v, new(1) == new(1), new(1) < new(2), new(2) <= new(1), #new(9), (-new(4)).v
        ";
        assert_eq!(run(source).unwrap(), vec!["5", "true", "true", "false", "9", "-4"]);
    }

    #[test]
    fn test_concat_and_tostring_metamethods() {
        let source = r"
            local mt = {
                __concat = function(a, b) return 'joined' end,
                __tostring = function(self) return 'point' end,
            }
            local p = setmetatable({}, mt)
            return p .. 'x', 'x' .. p, tostring(p), `{p}`
        ";
        assert_eq!(run(source).unwrap(), vec!["joined", "joined", "point", "point"]);
    }

    #[test]
    fn test_name_in_messages() {
        let source = "local obj = setmetatable({}, {__name = 'Widget'}) return obj + 1";
        assert_eq!(run_err(source), "string:1: attempt to perform arithmetic on a Widget value");
    }

    #[test]
    fn test_string_methods_via_metatable() {
        assert_eq!(run("local s = 'hello' return s:len(), s:sub(2, 3)").unwrap(), vec!["5", "el"]);
    }

    #[test]
    fn test_vector_field_errors() {
        assert_eq!(
            run_err("local v = vector(1, 2, 3) return v.w"),
            "string:1: attempt to index vector with 'w'"
        );
    }
}
