//! Integration tests for the host stack API

use std::cell::Cell;
use std::rc::Rc;

use corvid_core::{Error, Tag, Value, Vector, VmConfig, MULTRET, VM};

#[test]
fn test_scalar_values_round_trip() {
    let mut vm = VM::new();
    vm.push_nil();
    vm.push_boolean(true);
    vm.push_number(2.5);
    vm.push_integer(-12);
    vm.push_unsigned(4_000_000_000);
    vm.push_vector(Vector::new(1.0, 2.0, 3.0));
    vm.push_light_userdata(0xdead);
    vm.push_string("hello");

    assert_eq!(vm.top(), 8);
    assert_eq!(vm.type_of(1), Tag::Nil);
    assert!(vm.to_boolean(2).unwrap());
    assert_eq!(vm.to_number(3).unwrap(), 2.5);
    assert_eq!(vm.to_integer(4).unwrap(), -12);
    assert!(matches!(vm.read(4), Value::Integer(-12)));
    assert_eq!(vm.to_unsigned(5).unwrap(), 4_000_000_000);
    assert!(matches!(vm.read(5), Value::UnsignedInteger(_)));
    assert_eq!(vm.to_vector(6).unwrap(), Vector::new(1.0, 2.0, 3.0));
    assert_eq!(vm.to_light_userdata(7).unwrap(), 0xdead);
    assert_eq!(vm.to_str(-1).unwrap(), "hello");
    assert_eq!(vm.type_name(-2), "userdata");
}

#[test]
fn test_reference_values_round_trip_by_identity() {
    let mut vm = VM::new();
    vm.new_table();
    let table = vm.read(-1);
    vm.duplicate(-1);
    assert!(vm.raw_equal(-1, -2));
    assert!(vm.read(-1).raw_equal(&table));

    vm.new_table();
    assert!(!vm.raw_equal(-1, -2));
}

#[test]
fn test_scenario_add_two_locals() {
    let mut vm = VM::new();
    let bytes = corvid_core::compile(
        "local x=10 local y=20 return x+y",
        "=scenario",
        &corvid_core::CompileOptions::default(),
    )
    .unwrap();
    vm.load("=scenario", &bytes).unwrap();
    vm.protected_call(0, 1).unwrap();
    assert_eq!(vm.top(), 1);
    assert_eq!(vm.to_number(-1).unwrap(), 30.0);
}

#[test]
fn test_host_function_reads_arguments_and_returns_results() {
    let mut vm = VM::new();
    vm.register("divmod", |vm: &mut VM| {
        vm.check_arg_count(2)?;
        let a = vm.check_integer(1)?;
        let b = vm.check_integer(2)?;
        if b == 0 {
            return Err(vm.raise_message("division by zero"));
        }
        vm.push_number((a / b) as f64);
        vm.push_number((a % b) as f64);
        Ok(2)
    })
    .unwrap();

    let n = vm.do_string("local q, r = divmod(17, 5) return q, r").unwrap();
    assert_eq!(n, 2);
    assert_eq!(vm.to_number(-2).unwrap(), 3.0);
    assert_eq!(vm.to_number(-1).unwrap(), 2.0);
    vm.pop(2);

    let err = vm.do_string("divmod(1, 0)").unwrap_err();
    assert_eq!(err.to_string(), "string:1: division by zero");
    let err = vm.do_string("divmod(1)").unwrap_err();
    assert_eq!(err.to_string(), "string:1: expected at least 2 arguments, got 1");
}

#[test]
fn test_host_calls_script_function() {
    let mut vm = VM::new();
    vm.do_string("function greet(name) return 'hi ' .. name end").unwrap();
    vm.get_global("greet").unwrap();
    vm.push_string("ada");
    vm.protected_call(1, MULTRET).unwrap();
    assert_eq!(vm.top(), 1);
    assert_eq!(vm.to_str(-1).unwrap(), "hi ada");
}

#[test]
fn test_table_fields_and_iteration() {
    let mut vm = VM::new();
    vm.new_table();
    vm.push_number(1.0);
    vm.set_field(-2, "a").unwrap();
    vm.push_string("two");
    vm.raw_set_index(-2, 1).unwrap();
    vm.set_global("config").unwrap();

    vm.do_string("config.b = config.a + 1").unwrap();
    vm.get_global("config").unwrap();
    assert_eq!(vm.get_field(-1, "b").unwrap(), Tag::Number);
    assert_eq!(vm.to_number(-1).unwrap(), 2.0);
    vm.pop(1);

    let mut keys = Vec::new();
    vm.push_nil();
    while vm.next(-2).unwrap() {
        keys.push(vm.to_string_converting(-2).unwrap());
        vm.pop(1);
    }
    keys.sort();
    assert_eq!(keys, vec!["1", "a", "b"]);
}

#[test]
fn test_metatable_from_host_drives_script_operators() {
    let mut vm = VM::new();
    vm.new_table();
    vm.new_table();
    vm.push_function("__add", |vm: &mut VM| {
        vm.push_string("added");
        Ok(1)
    });
    vm.set_field(-2, "__add").unwrap();
    vm.set_metatable(-2).unwrap();
    vm.set_global("obj").unwrap();

    vm.do_string("return obj + 1").unwrap();
    assert_eq!(vm.to_str(-1).unwrap(), "added");
}

#[test]
fn test_type_mismatch_is_recoverable() {
    let mut vm = VM::new();
    vm.push_string("not a number");
    match vm.to_number(-1) {
        Err(Error::TypeMismatch { index, expected, found }) => {
            assert_eq!(index, -1);
            assert_eq!(expected, "number");
            assert_eq!(found, "string");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(vm.top(), 1);
}

#[test]
fn test_userdata_destructor_runs_once() {
    let runs = Rc::new(Cell::new(0));
    {
        let mut vm = VM::new();
        let counter = Rc::clone(&runs);
        vm.new_userdata(
            7,
            vec![1, 2, 3],
            Some(Box::new(move |data: &mut [u8]| {
                assert_eq!(data, &[1, 2, 3]);
                counter.set(counter.get() + 1);
            })),
        );
        assert_eq!(vm.userdata_tag(-1).unwrap(), 7);
        assert_eq!(vm.to_userdata(-1).unwrap(), &[1, 2, 3]);
        vm.pop(1);
        vm.collect_garbage();
        assert_eq!(runs.get(), 1);
    }
    assert_eq!(runs.get(), 1);
}

#[test]
fn test_userdata_destructor_runs_when_vm_drops() {
    let runs = Rc::new(Cell::new(0));
    {
        let mut vm = VM::new();
        let counter = Rc::clone(&runs);
        vm.new_userdata(0, Vec::new(), Some(Box::new(move |_: &mut [u8]| counter.set(counter.get() + 1))));
        vm.set_global("handle").unwrap();
        assert_eq!(runs.get(), 0);
    }
    assert_eq!(runs.get(), 1);
}

#[test]
fn test_buffers_are_shared_with_scripts() {
    let mut vm = VM::new();
    vm.new_buffer(4);
    vm.to_buffer_mut(-1).unwrap().copy_from_slice(&[1, 0, 0, 0]);
    vm.set_global("buf").unwrap();
    vm.do_string("buffer.writeu8(buf, 3, 9) return buffer.readi32(buf, 0)").unwrap();
    assert_eq!(vm.to_number(-1).unwrap(), f64::from(0x0900_0001));
    vm.get_global("buf").unwrap();
    assert_eq!(vm.to_buffer(-1).unwrap(), &[1, 0, 0, 9]);
}

#[test]
fn test_bare_vm_has_no_libraries() {
    let mut vm = VM::with_config(VmConfig {
        open_libs: false,
        ..VmConfig::default()
    });
    assert_eq!(vm.get_global("string").unwrap(), Tag::Nil);
    vm.pop(1);
    vm.do_string("x = 1 + 2").unwrap();
    vm.get_global("x").unwrap();
    assert_eq!(vm.to_number(-1).unwrap(), 3.0);
}
