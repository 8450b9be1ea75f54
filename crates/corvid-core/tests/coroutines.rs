//! Integration tests for coroutines driven from scripts and from the host

use corvid_core::{ResumeOutcome, ThreadStatus, VM};

#[test]
fn test_host_drives_a_generator() {
    let mut vm = VM::new();
    vm.load_source(
        "=gen",
        "for i = 1, 3 do coroutine.yield(i * i) end return 'done'",
    )
    .unwrap();
    vm.new_thread().unwrap();
    assert_eq!(vm.thread_status(1).unwrap(), ThreadStatus::Suspended);

    let mut yielded = Vec::new();
    loop {
        match vm.resume(1, 0).unwrap() {
            ResumeOutcome::Yielded(n) => {
                assert_eq!(n, 1);
                yielded.push(vm.to_number(-1).unwrap());
                vm.pop(1);
            }
            ResumeOutcome::Finished(n) => {
                assert_eq!(n, 1);
                assert_eq!(vm.to_str(-1).unwrap(), "done");
                break;
            }
        }
    }
    assert_eq!(yielded, vec![1.0, 4.0, 9.0]);
    assert_eq!(vm.thread_status(1).unwrap(), ThreadStatus::Dead);
}

#[test]
fn test_resuming_dead_thread_from_host_fails() {
    let mut vm = VM::new();
    vm.load_source("=once", "return 1").unwrap();
    vm.new_thread().unwrap();
    assert_eq!(vm.resume(1, 0).unwrap(), ResumeOutcome::Finished(1));
    vm.pop(1);
    let err = vm.resume(1, 0).unwrap_err();
    assert!(err.to_string().contains("cannot resume dead coroutine"), "{err}");
}

#[test]
fn test_error_in_thread_reaches_host() {
    let mut vm = VM::new();
    vm.load_source("=failing", "coroutine.yield() error('late failure', 0)").unwrap();
    vm.new_thread().unwrap();
    assert_eq!(vm.resume(1, 0).unwrap(), ResumeOutcome::Yielded(0));
    let err = vm.resume(1, 0).unwrap_err();
    assert_eq!(err.to_string(), "late failure");
    assert_eq!(vm.thread_status(1).unwrap(), ThreadStatus::Dead);
}

#[test]
fn test_producer_consumer_pipeline() {
    let mut vm = VM::new();
    let source = r"
        local function producer()
            return coroutine.create(function()
                for _, word in ipairs({'alpha', 'beta', 'gamma'}) do
                    coroutine.yield(word)
                end
            end)
        end
        local function filter(source)
            return coroutine.wrap(function()
                while true do
                    local ok, word = coroutine.resume(source)
                    if not word then return end
                    coroutine.yield(string.upper(word))
                end
            end)
        end
        local out = {}
        for word in filter(producer()) do out[#out + 1] = word end
        return table.concat(out, ' ')
    ";
    vm.do_string(source).unwrap();
    assert_eq!(vm.to_str(-1).unwrap(), "ALPHA BETA GAMMA");
}

#[test]
fn test_threads_survive_collection_while_suspended() {
    let mut vm = VM::new();
    vm.do_string(
        "co = coroutine.create(function() local t = {n = 41} coroutine.yield() return t.n + 1 end) coroutine.resume(co)",
    )
    .unwrap();
    vm.collect_garbage();
    vm.do_string("local ok, v = coroutine.resume(co) return v").unwrap();
    assert_eq!(vm.to_number(-1).unwrap(), 42.0);
}
