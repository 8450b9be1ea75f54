//! Base library: globals such as `print`, `pcall`, `setmetatable` and `pairs`

use std::rc::Rc;

use super::{intrinsic_body, set_function, set_global_raw, set_raw, LibFn};
use crate::value::Value;
use crate::vm::{Event, Intrinsic, VmResult, VM};

const FUNCTIONS: &[(&str, LibFn)] = &[
    ("print", print),
    ("error", error),
    ("assert", assert),
    ("type", type_),
    ("typeof", typeof_),
    ("tostring", tostring),
    ("tonumber", tonumber),
    ("select", select),
    ("rawget", rawget),
    ("rawset", rawset),
    ("rawequal", rawequal),
    ("rawlen", rawlen),
    ("setmetatable", setmetatable),
    ("getmetatable", getmetatable),
    ("pairs", pairs),
    ("unpack", super::table::unpack),
];

pub(crate) fn open(vm: &mut VM) {
    let globals = vm.globals;
    for &(name, f) in FUNCTIONS {
        set_function(vm, globals, name, f, None);
    }
    set_function(vm, globals, "pcall", intrinsic_body, Some(Intrinsic::PCall));
    set_function(vm, globals, "xpcall", intrinsic_body, Some(Intrinsic::XPCall));
    let next_fn = vm.next_fn;
    set_raw(vm, globals, "next", next_fn);

    let iter = vm.alloc_native("ipairs_iterator", Rc::new(ipairs_iterator), Vec::new(), None);
    let ipairs = vm.alloc_native("ipairs", Rc::new(ipairs), vec![iter], None);
    set_global_raw(vm, "ipairs", ipairs);

    let version = Value::String(vm.heap.intern(b"corvid"));
    set_global_raw(vm, "_VERSION", version);
}

fn print(vm: &mut VM) -> VmResult<usize> {
    let mut line = String::new();
    for i in 1..=vm.arg_count() {
        if i > 1 {
            line.push('\t');
        }
        let text = vm.tostring_value(vm.arg(i))?;
        line.push_str(&vm.display_value(text));
    }
    vm.output.write_line(&line);
    Ok(0)
}

/// `error(value [, level])`: with a level, string messages get the
/// position of the function at that level
fn error(vm: &mut VM) -> VmResult<usize> {
    let value = vm.arg(1);
    let level = vm.opt_integer(2, 0)?;
    if let (Value::String(h), Ok(level @ 1..)) = (value, usize::try_from(level)) {
        if let Some((chunk, line)) = vm.level_location(level) {
            let message = format!("{chunk}:{line}: {}", String::from_utf8_lossy(vm.heap.string(h)));
            let prefixed = Value::String(vm.heap.intern(message.as_bytes()));
            return Err(vm.error_from_value(prefixed));
        }
    }
    Err(vm.error_from_value(value))
}

fn assert(vm: &mut VM) -> VmResult<usize> {
    let condition = vm.check_any(1)?;
    if condition.is_truthy() {
        return Ok(vm.arg_count());
    }
    if vm.arg_count() >= 2 {
        let message = vm.arg(2);
        return Err(vm.error_from_value(message));
    }
    Err(vm.raise_message("assertion failed!"))
}

fn type_(vm: &mut VM) -> VmResult<usize> {
    let value = vm.check_any(1)?;
    vm.push_string(value.type_name());
    Ok(1)
}

fn typeof_(vm: &mut VM) -> VmResult<usize> {
    let value = vm.check_any(1)?;
    let name = vm.typeof_name(value);
    vm.push_string(&name);
    Ok(1)
}

fn tostring(vm: &mut VM) -> VmResult<usize> {
    let value = vm.check_any(1)?;
    let text = vm.tostring_value(value)?;
    vm.push_value(text);
    Ok(1)
}

fn tonumber(vm: &mut VM) -> VmResult<usize> {
    let value = vm.check_any(1)?;
    if vm.arg(2).is_nil() {
        let result = vm.coerce_number(value).map_or(Value::Nil, Value::Number);
        vm.push_value(if value.is_number() { value } else { result });
        return Ok(1);
    }
    let base = vm.check_integer(2)?;
    if !(2..=36).contains(&base) {
        return Err(vm.arg_error(2, "base out of range"));
    }
    let text = vm.check_str(1)?;
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let parsed = u64::from_str_radix(digits, base as u32).ok().map(|n| {
        let n = n as f64;
        if negative {
            -n
        } else {
            n
        }
    });
    vm.push_value(parsed.map_or(Value::Nil, Value::Number));
    Ok(1)
}

fn select(vm: &mut VM) -> VmResult<usize> {
    let count = vm.arg_count().saturating_sub(1);
    if let Value::String(h) = vm.arg(1) {
        if vm.heap.string(h) == b"#" {
            vm.push_number(count as f64);
            return Ok(1);
        }
    }
    let n = vm.check_integer(1)?;
    if n < 0 {
        let back = n.unsigned_abs() as usize;
        if back > count {
            return Err(vm.arg_error(1, "index out of range"));
        }
        return Ok(back);
    }
    if n == 0 {
        return Err(vm.arg_error(1, "index out of range"));
    }
    Ok(count.saturating_sub(n as usize - 1))
}

fn rawget(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    let key = vm.check_any(2)?;
    let value = vm.heap.table(table).get(&key);
    vm.push_value(value);
    Ok(1)
}

fn rawset(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    let key = vm.check_any(2)?;
    let value = vm.check_any(3)?;
    vm.raw_store(table, key, value)?;
    vm.push_value(Value::Table(table));
    Ok(1)
}

fn rawequal(vm: &mut VM) -> VmResult<usize> {
    let a = vm.check_any(1)?;
    let b = vm.check_any(2)?;
    vm.push_boolean(a.raw_equal(&b));
    Ok(1)
}

fn rawlen(vm: &mut VM) -> VmResult<usize> {
    let len = match vm.arg(1) {
        Value::Table(h) => vm.heap.table(h).len(),
        Value::String(h) => vm.heap.string(h).len(),
        _ => return Err(vm.arg_error(1, "table or string expected")),
    };
    vm.push_number(len as f64);
    Ok(1)
}

fn setmetatable(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    let metatable = match vm.arg(2) {
        Value::Table(h) => Some(h),
        Value::Nil => None,
        other => {
            let found = vm.type_name_of(other);
            return Err(vm.arg_error(2, &format!("nil or table expected, got {found}")));
        }
    };
    if !vm.metamethod(Value::Table(table), Event::Metatable).is_nil() {
        return Err(vm.raise_message("cannot change a protected metatable"));
    }
    vm.assign_metatable(Value::Table(table), metatable)?;
    vm.push_value(Value::Table(table));
    Ok(1)
}

fn getmetatable(vm: &mut VM) -> VmResult<usize> {
    let value = vm.check_any(1)?;
    let result = match vm.metatable_of(value) {
        Some(mt) => {
            let protected = vm.metamethod(value, Event::Metatable);
            if protected.is_nil() {
                Value::Table(mt)
            } else {
                protected
            }
        }
        None => Value::Nil,
    };
    vm.push_value(result);
    Ok(1)
}

/// `next(t [, key])`; also the iterator behind `pairs` and table loops
pub fn next(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    let key = vm.arg(2);
    match vm.heap.table(table).next(&key) {
        Ok(Some((k, v))) => {
            vm.push_value(k);
            vm.push_value(v);
            Ok(2)
        }
        Ok(None) => {
            vm.push_nil();
            Ok(1)
        }
        Err(_) => Err(vm.raise_message("invalid key to 'next'")),
    }
}

fn pairs(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    vm.push_value(vm.next_fn);
    vm.push_value(Value::Table(table));
    vm.push_nil();
    Ok(3)
}

fn ipairs(vm: &mut VM) -> VmResult<usize> {
    let value = vm.check_any(1)?;
    vm.push_value(vm.upvalue(1));
    vm.push_value(value);
    vm.push_number(0.0);
    Ok(3)
}

fn ipairs_iterator(vm: &mut VM) -> VmResult<usize> {
    let object = vm.arg(1);
    let index = vm.check_integer(2)? + 1;
    let value = match object {
        Value::Table(h) => vm.heap.table(h).get_int(index),
        other => vm.index_value(other, Value::Number(index as f64))?,
    };
    if value.is_nil() {
        vm.push_nil();
        return Ok(1);
    }
    vm.push_number(index as f64);
    vm.push_value(value);
    Ok(2)
}

#[cfg(test)]
mod tests {
    use crate::testutil::{run, run_err};
    use crate::vm::{OutputCapture, VM};

    #[test]
    fn test_print_writes_to_sink() {
        let mut vm = VM::new();
        let capture = OutputCapture::new();
        vm.set_output(capture.clone());
        vm.do_string("print('a', 1, nil, true) print()").unwrap();
        assert_eq!(capture.lines(), vec!["a\t1\tnil\ttrue", ""]);
    }

    #[test]
    fn test_error_levels() {
        assert_eq!(run_err("error('plain')"), "plain");
        assert_eq!(run_err("error('where', 1)"), "string:1: where");
        let source = "local function check(x)\n  error('bad x', 2)\nend\ncheck(1)";
        assert_eq!(run_err(source), "string:4: bad x");
    }

    #[test]
    fn test_assert() {
        assert_eq!(run("return assert(1, 'unused')").unwrap(), vec!["1", "unused"]);
        assert_eq!(run_err("assert(false)"), "string:1: assertion failed!");
        assert_eq!(run_err("assert(nil, 'custom')"), "custom");
    }

    #[test]
    fn test_type_and_typeof() {
        assert_eq!(
            run("return type(1), type('s'), type({}), type(print), type(nil), typeof(vector(1, 2, 3))").unwrap(),
            vec!["number", "string", "table", "function", "nil", "vector"]
        );
        assert_eq!(run_err("return type()"), "string:1: bad argument #1 to 'type' (value expected)");
    }

    #[test]
    fn test_tonumber() {
        assert_eq!(
            run("return tonumber('0x10'), tonumber('  12  '), tonumber('z'), tonumber('ff', 16), tonumber('-101', 2)")
                .unwrap(),
            vec!["16", "12", "nil", "255", "-5"]
        );
    }

    #[test]
    fn test_select() {
        assert_eq!(run("return select('#', 1, nil, 3)").unwrap(), vec!["3"]);
        assert_eq!(run("return select(2, 'a', 'b', 'c')").unwrap(), vec!["b", "c"]);
        assert_eq!(run("return select(-1, 'a', 'b', 'c')").unwrap(), vec!["c"]);
        assert!(run_err("return select(0, 1)").contains("index out of range"));
    }

    #[test]
    fn test_raw_access_skips_metamethods() {
        let source = r"
            local t = setmetatable({}, {__index = function() return 'meta' end, __newindex = function() end})
            rawset(t, 'k', 'raw')
            t.other = 1
            return t.missing, rawget(t, 'missing'), t.k, rawget(t, 'other'), rawlen({1, 2}), rawequal(t, t)
        ";
        assert_eq!(run(source).unwrap(), vec!["meta", "nil", "raw", "nil", "2", "true"]);
    }

    #[test]
    fn test_protected_metatable() {
        let source = r"
            local t = setmetatable({}, {__metatable = 'locked'})
            local ok, e = pcall(setmetatable, t, {})
            return getmetatable(t), ok, e
        ";
        assert_eq!(
            run(source).unwrap(),
            vec!["locked", "false", "string:3: cannot change a protected metatable"]
        );
    }

    #[test]
    fn test_pairs_and_ipairs() {
        let source = r"
            local sum, keys = 0, 0
            for _, v in ipairs({10, 20, 30, nil, 50}) do sum = sum + v end
            for k in pairs({a = 1, b = 2, 3}) do keys = keys + 1 end
            local n = 0
            for k, v in next, {x = 1} do n = n + v end
            return sum, keys, n
        ";
        assert_eq!(run(source).unwrap(), vec!["60", "3", "1"]);
    }

    #[test]
    fn test_unpack_global() {
        assert_eq!(run("return unpack({1, 2, 3})").unwrap(), vec!["1", "2", "3"]);
    }
}
