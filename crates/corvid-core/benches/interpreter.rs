//! Benchmark suite for the compiler and interpreter
//!
//! - compile: source to serialized chunk
//! - fib: recursive calls and arithmetic
//! - table churn: allocation pressure under the incremental collector

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use corvid_core::{compile, CompileOptions, VM};

const FIB: &str = r"
local function fib(n)
    if n < 2 then return n end
    return fib(n - 1) + fib(n - 2)
end
return fib(...)
";

const CHURN: &str = r"
local n = ...
local live = {}
for i = 1, n do
    local t = {i, i * 2, name = tostring(i)}
    live[i % 64 + 1] = t
end
return #live
";

/// A synthetic program with `functions` small functions
fn generate_source(functions: usize) -> String {
    let mut source = String::new();
    for i in 0..functions {
        source.push_str(&format!(
            "local function f{i}(a, b)\n  local t = {{a, b, key = 'v{i}'}}\n  if a > b then return t[1] * {i} else return #t + b end\nend\n"
        ));
    }
    source.push_str("return f0(1, 2)\n");
    source
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    for functions in [10, 100, 1000] {
        let source = generate_source(functions);
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(functions), &source, |b, source| {
            b.iter(|| compile(black_box(source), "=bench", &CompileOptions::default()).expect("compiles"));
        });
    }
    group.finish();
}

/// Run `source` once with a single numeric argument
fn run_with(vm: &mut VM, bytes: &[u8], arg: f64) -> f64 {
    vm.load("=bench", bytes).expect("loads");
    vm.push_number(arg);
    vm.protected_call(1, 1).expect("runs");
    let result = vm.to_number(-1).expect("number result");
    vm.pop(1);
    result
}

fn bench_fib(c: &mut Criterion) {
    let bytes = compile(FIB, "=fib", &CompileOptions::default()).expect("compiles");
    let mut group = c.benchmark_group("fib");
    for n in [15.0, 20.0, 25.0] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let mut vm = VM::new();
            b.iter(|| black_box(run_with(&mut vm, &bytes, n)));
        });
    }
    group.finish();
}

fn bench_table_churn(c: &mut Criterion) {
    let bytes = compile(CHURN, "=churn", &CompileOptions::default()).expect("compiles");
    let mut group = c.benchmark_group("table_churn");
    for n in [1_000, 10_000, 100_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let mut vm = VM::new();
            b.iter(|| black_box(run_with(&mut vm, &bytes, f64::from(n))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_fib, bench_table_churn);
criterion_main!(benches);
