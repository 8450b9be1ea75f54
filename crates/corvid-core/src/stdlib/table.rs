//! `table` library

use super::{new_lib, LibFn};
use crate::gc::Handle;
use crate::value::Value;
use crate::vm::{Event, VmResult, VM};

/// Most values `unpack` will push in one call
const MAX_UNPACK: usize = 1 << 20;

const FUNCTIONS: &[(&str, LibFn)] = &[
    ("insert", insert),
    ("remove", remove),
    ("concat", concat),
    ("unpack", unpack),
    ("pack", pack),
    ("clear", clear),
    ("freeze", freeze),
    ("isfrozen", isfrozen),
    ("clone", clone),
    ("find", find),
];

pub(crate) fn open(vm: &mut VM) {
    new_lib(vm, "table", FUNCTIONS);
}

fn get(vm: &VM, table: Handle, i: usize) -> Value {
    vm.heap.table(table).get_int(i as i64)
}

fn set(vm: &mut VM, table: Handle, i: usize, value: Value) -> VmResult<()> {
    vm.raw_store(table, Value::Number(i as f64), value)
}

fn length(vm: &VM, table: Handle) -> usize {
    vm.heap.table(table).len()
}

fn insert(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    let n = length(vm, table);
    match vm.arg_count() {
        2 => {
            let value = vm.arg(2);
            set(vm, table, n + 1, value)?;
        }
        3 => {
            let pos = vm.check_integer(2)?;
            if pos < 1 || pos as usize > n + 1 {
                return Err(vm.arg_error(2, "position out of bounds"));
            }
            let pos = pos as usize;
            for i in (pos..=n).rev() {
                let moved = get(vm, table, i);
                set(vm, table, i + 1, moved)?;
            }
            let value = vm.arg(3);
            set(vm, table, pos, value)?;
        }
        _ => return Err(vm.raise_message("wrong number of arguments to 'insert'")),
    }
    Ok(0)
}

fn remove(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    let n = length(vm, table);
    let pos = vm.opt_integer(2, n as i64)?;
    if pos != n as i64 && (pos < 1 || pos as usize > n + 1) {
        return Err(vm.arg_error(2, "position out of bounds"));
    }
    let mut pos = pos.max(0) as usize;
    let removed = get(vm, table, pos);
    vm.push_value(removed);
    while pos < n {
        let moved = get(vm, table, pos + 1);
        set(vm, table, pos, moved)?;
        pos += 1;
    }
    if pos > 0 {
        set(vm, table, pos, Value::Nil)?;
    }
    Ok(1)
}

fn concat(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    let separator = if vm.arg(2).is_nil() {
        Vec::new()
    } else {
        vm.check_string(2)?
    };
    let first = vm.opt_integer(3, 1)?;
    let last = vm.opt_integer(4, length(vm, table) as i64)?;
    let mut out = Vec::new();
    let mut i = first;
    while i <= last {
        match vm.heap.table(table).get_int(i) {
            Value::String(h) => out.extend_from_slice(vm.heap.string(h)),
            value if value.is_number() => out.extend_from_slice(vm.display_value(value).as_bytes()),
            value => {
                let name = vm.type_name_of(value);
                return Err(vm.raise_message(format!(
                    "invalid value (at index {i}) in table for 'concat': {name}"
                )));
            }
        }
        if i < last {
            out.extend_from_slice(&separator);
        }
        i += 1;
    }
    vm.push_bytes(&out);
    Ok(1)
}

/// `unpack(t [, i [, j]])`; also installed as the global `unpack`
pub(crate) fn unpack(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    let first = vm.opt_integer(2, 1)?;
    let last = vm.opt_integer(3, length(vm, table) as i64)?;
    if first > last {
        return Ok(0);
    }
    let count = usize::try_from(last - first + 1).unwrap_or(usize::MAX);
    if count > MAX_UNPACK || vm.state.stack.len() + count > vm.config.max_stack_slots {
        return Err(vm.raise_message("too many results to unpack"));
    }
    for i in first..=last {
        let value = vm.heap.table(table).get_int(i);
        vm.push_value(value);
    }
    Ok(count)
}

fn pack(vm: &mut VM) -> VmResult<usize> {
    let count = vm.arg_count();
    let values: Vec<Value> = (1..=count).map(|i| vm.arg(i)).collect();
    let table = vm.heap.new_table(count, 1);
    vm.push_value(Value::Table(table));
    vm.heap.table_set_list(table, 1, &values);
    let n = Value::String(vm.heap.intern(b"n"));
    vm.raw_set_table(table, n, Value::Number(count as f64));
    vm.after_alloc();
    Ok(1)
}

fn clear(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    if vm.heap.table(table).readonly {
        return Err(vm.raise_message("attempt to modify a readonly table"));
    }
    vm.heap.table_mut(table).clear();
    vm.heap.resize(table);
    Ok(0)
}

fn has_protected_metatable(vm: &VM, table: Handle) -> bool {
    !vm.metamethod(Value::Table(table), Event::Metatable).is_nil()
}

fn freeze(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    if vm.heap.table(table).readonly {
        return Err(vm.arg_error(1, "table is already frozen"));
    }
    if has_protected_metatable(vm, table) {
        return Err(vm.arg_error(1, "table has a protected metatable"));
    }
    vm.heap.table_mut(table).readonly = true;
    vm.push_value(Value::Table(table));
    Ok(1)
}

fn isfrozen(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    let frozen = vm.heap.table(table).readonly;
    vm.push_boolean(frozen);
    Ok(1)
}

fn clone(vm: &mut VM) -> VmResult<usize> {
    let source = vm.check_table(1)?;
    if has_protected_metatable(vm, source) {
        return Err(vm.arg_error(1, "table has a protected metatable"));
    }
    let original = vm.heap.table(source);
    let entries: Vec<(Value, Value)> = original.iter().collect();
    let metatable = original.metatable;
    let array_len = original.len();
    let copy = vm.heap.new_table(array_len, entries.len());
    vm.push_value(Value::Table(copy));
    for (key, value) in entries {
        vm.raw_set_table(copy, key, value);
    }
    vm.heap.table_mut(copy).metatable = metatable;
    if let Some(mt) = metatable {
        vm.heap.barrier_handle(copy, mt);
    }
    vm.after_alloc();
    Ok(1)
}

fn find(vm: &mut VM) -> VmResult<usize> {
    let table = vm.check_table(1)?;
    let needle = vm.check_any(2)?;
    let init = vm.opt_integer(3, 1)?;
    if init < 1 {
        return Err(vm.arg_error(3, "index out of range"));
    }
    let mut i = init;
    loop {
        let value = vm.heap.table(table).get_int(i);
        if value.is_nil() {
            vm.push_nil();
            return Ok(1);
        }
        if value.raw_equal(&needle) {
            vm.push_number(i as f64);
            return Ok(1);
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{run, run_err};

    #[test]
    fn test_insert_and_remove() {
        let source = r"
            local t = {1, 2, 3}
            table.insert(t, 4)
            table.insert(t, 1, 0)
            local last = table.remove(t)
            local first = table.remove(t, 1)
            return #t, t[1], t[3], last, first, table.remove({})
        ";
        assert_eq!(run(source).unwrap(), vec!["3", "1", "3", "4", "0", "nil"]);
        assert!(run_err("table.insert({}, 5, 1)").contains("position out of bounds"));
    }

    #[test]
    fn test_concat() {
        assert_eq!(
            run("return table.concat({1, 'a', 2.5}, ', '), table.concat({'x', 'y', 'z'}, '', 2), table.concat({})")
                .unwrap(),
            vec!["1, a, 2.5", "yz", ""]
        );
        assert!(run_err("return table.concat({1, {}, 3})").contains("invalid value (at index 2)"));
    }

    #[test]
    fn test_pack_and_unpack() {
        assert_eq!(
            run("local p = table.pack(1, nil, 3) return p.n, p[3], table.unpack({1, 2, 3}, 2)").unwrap(),
            vec!["3", "3", "2", "3"]
        );
        assert_eq!(run("return table.unpack({1, 2}, 3)").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_freeze_and_clone() {
        let source = r"
            local t = table.freeze({a = 1})
            local ok, e = pcall(function() t.b = 2 end)
            local c = table.clone(t)
            c.b = 2
            return table.isfrozen(t), ok, e, table.isfrozen(c), c.a, c.b
        ";
        assert_eq!(
            run(source).unwrap(),
            vec!["true", "false", "string:3: attempt to modify a readonly table", "false", "1", "2"]
        );
        assert!(run_err("local t = table.freeze({}) table.freeze(t)").contains("table is already frozen"));
    }

    #[test]
    fn test_clear_and_find() {
        let source = r"
            local t = {'a', 'b', 'c', k = 1}
            local at = table.find(t, 'b')
            local missing = table.find(t, 'z')
            table.clear(t)
            return at, missing, #t, t.k
        ";
        assert_eq!(run(source).unwrap(), vec!["2", "nil", "0", "nil"]);
    }
}
