//! Integration tests for registry references and the garbage collector

use corvid_core::{GcConfig, Value, VmConfig, VM};

#[test]
fn test_store_then_push_reproduces_value() {
    let mut vm = VM::new();
    vm.push_string("pinned");
    let handle = vm.store_ref(-1, true);
    assert!(handle.key() > 0);
    assert_eq!(vm.top(), 0);

    vm.do_string("local junk = {} for i = 1, 1000 do junk[i] = {i} end").unwrap();
    vm.collect_garbage();

    vm.push_ref(&handle).unwrap();
    assert_eq!(vm.to_str(-1).unwrap(), "pinned");
}

#[test]
fn test_released_reference_becomes_unreachable() {
    let mut vm = VM::new();
    vm.do_string("return {payload = 'x'}").unwrap();
    let table = vm.read(-1);
    let handle = vm.store_ref(-1, true);

    vm.collect_garbage();
    assert!(vm.is_handle_live(table));

    handle.release();
    vm.collect_garbage();
    assert!(!vm.is_handle_live(table));
}

#[test]
fn test_dropped_handle_releases_its_slot() {
    let mut vm = VM::new();
    vm.new_table();
    let table = vm.read(-1);
    {
        let _handle = vm.store_ref(-1, true);
    }
    vm.collect_garbage();
    assert!(!vm.is_handle_live(table));
}

#[test]
fn test_scalars_are_always_live() {
    let vm = VM::new();
    assert!(vm.is_handle_live(Value::Number(1.0)));
    assert!(vm.is_handle_live(Value::Nil));
}

#[test]
fn test_incremental_collection_reclaims_garbage() {
    let mut vm = VM::with_config(VmConfig {
        gc: GcConfig {
            min_threshold_bytes: 16 * 1024,
            step_size_bytes: 1024,
            ..GcConfig::default()
        },
        ..VmConfig::default()
    });
    let source = r"
        local keep = {}
        for i = 1, 20000 do
            local t = {i, tostring(i)}
            if i % 1000 == 0 then keep[#keep + 1] = t end
        end
        local sum = 0
        for _, t in ipairs(keep) do sum = sum + t[1] end
        return sum, #keep
    ";
    vm.do_string(source).unwrap();
    assert_eq!(vm.to_number(-2).unwrap(), 210_000.0);
    assert_eq!(vm.to_number(-1).unwrap(), 20.0);

    let stats = vm.gc_stats();
    assert!(stats.cycles > 0, "{stats:?}");
    assert!(stats.objects_freed > 0, "{stats:?}");
    assert!(stats.live_bytes < stats.bytes_allocated);
}

#[test]
fn test_step_by_step_cycle_completes() {
    // A threshold equal to the live size keeps the collector permanently due
    let mut vm = VM::with_config(VmConfig {
        gc: GcConfig {
            pause_percent: 100,
            min_threshold_bytes: 1,
            ..GcConfig::default()
        },
        ..VmConfig::default()
    });
    vm.do_string("for i = 1, 100 do local _ = {i} end").unwrap();
    let before = vm.gc_stats().cycles;
    let mut steps = 0;
    while !vm.gc_step() {
        steps += 1;
        assert!(steps < 100_000, "collector never finished a cycle");
    }
    assert_eq!(vm.gc_stats().cycles, before + 1);
}

#[test]
fn test_closures_keep_captured_tables_alive() {
    let mut vm = VM::new();
    vm.do_string("local data = {n = 5} getter = function() return data.n end").unwrap();
    for _ in 0..3 {
        vm.collect_garbage();
    }
    vm.do_string("return getter()").unwrap();
    assert_eq!(vm.to_number(-1).unwrap(), 5.0);
}

#[test]
fn test_gc_config_can_be_changed_at_runtime() {
    let mut vm = VM::new();
    let config = GcConfig {
        pause_percent: 150,
        ..vm.gc_config()
    };
    vm.set_gc_config(config);
    assert_eq!(vm.gc_config().pause_percent, 150);
}
