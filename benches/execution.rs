//! Execution benchmarks for the interpreter.
//!
//! These benchmarks measure instruction dispatch, call overhead and memory
//! stores through the public embedding API.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use wasmbed::parser::builder::{Code, ModuleBuilder};
use wasmbed::parser::instruction::{BlockType, NumericOp, StoreOp};
use wasmbed::parser::module::ValueType::I32;
use wasmbed::{Environment, FunctionHandle, Module, Runtime, Value};

/// `run(n)` counts down from `n` and returns the number of iterations
fn noop_loop() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let run = b.add_function(
        &[I32],
        &[I32],
        &[I32],
        Code::new()
            .block(BlockType::Empty)
            .loop_(BlockType::Empty)
            .local_get(0)
            .numeric(NumericOp::I32Eqz)
            .br_if(1)
            .local_get(0)
            .i32_const(1)
            .numeric(NumericOp::I32Sub)
            .local_set(0)
            .local_get(1)
            .i32_const(1)
            .numeric(NumericOp::I32Add)
            .local_set(1)
            .br(0)
            .end()
            .end()
            .local_get(1)
            .end(),
    );
    b.export_function("run", run);
    b.build()
}

fn fib_iterative() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let fib = b.add_function(
        &[I32],
        &[I32],
        &[I32, I32, I32],
        Code::new()
            .i32_const(1)
            .local_set(2)
            .block(BlockType::Empty)
            .loop_(BlockType::Empty)
            .local_get(0)
            .numeric(NumericOp::I32Eqz)
            .br_if(1)
            .local_get(1)
            .local_get(2)
            .numeric(NumericOp::I32Add)
            .local_set(3)
            .local_get(2)
            .local_set(1)
            .local_get(3)
            .local_set(2)
            .local_get(0)
            .i32_const(1)
            .numeric(NumericOp::I32Sub)
            .local_set(0)
            .br(0)
            .end()
            .end()
            .local_get(1)
            .end(),
    );
    b.export_function("fib", fib);
    b.build()
}

fn fib_recursive() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let fib = b.add_function(
        &[I32],
        &[I32],
        &[],
        Code::new()
            .local_get(0)
            .i32_const(2)
            .numeric(NumericOp::I32LtS)
            .if_(BlockType::Value(I32))
            .local_get(0)
            .else_()
            .local_get(0)
            .i32_const(1)
            .numeric(NumericOp::I32Sub)
            .call(0)
            .local_get(0)
            .i32_const(2)
            .numeric(NumericOp::I32Sub)
            .call(0)
            .numeric(NumericOp::I32Add)
            .end()
            .end(),
    );
    b.export_function("fib", fib);
    b.build()
}

/// `fill(len)` stores the low byte of each address into memory
fn fill() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    b.memory(1, Some(1));
    let fill = b.add_function(
        &[I32],
        &[I32],
        &[I32],
        Code::new()
            .block(BlockType::Empty)
            .loop_(BlockType::Empty)
            .local_get(1)
            .local_get(0)
            .numeric(NumericOp::I32GeU)
            .br_if(1)
            .local_get(1)
            .local_get(1)
            .store(StoreOp::I32Store8, 0)
            .local_get(1)
            .i32_const(1)
            .numeric(NumericOp::I32Add)
            .local_set(1)
            .br(0)
            .end()
            .end()
            .local_get(0)
            .end(),
    );
    b.export_function("fill", fill);
    b.build()
}

/// Keeps the environment and runtime alive alongside the export
struct Loaded {
    _env: Environment,
    runtime: Runtime,
    func: FunctionHandle,
}

fn instantiate(bytes: &[u8], export: &str) -> Loaded {
    let env = Environment::new();
    let runtime = Runtime::new(&env, 1024 * 1024).unwrap();
    let module = Module::parse(&env, bytes).unwrap();
    let loaded = runtime.load(module).unwrap();
    runtime.run_start(&loaded).unwrap();
    let func = runtime.find_function(export).unwrap();
    Loaded { _env: env, runtime, func }
}

fn execute(loaded: &Loaded, arg: i32) -> Vec<Value> {
    loaded.func.call(&[Value::I32(arg)]).unwrap()
}

/// Verify module correctness before benchmarking
fn verify_modules() {
    let run = instantiate(&noop_loop(), "run");
    assert_eq!(execute(&run, 1000), vec![Value::I32(1000)], "noop_loop(1000) should be 1000");

    for bytes in [fib_iterative(), fib_recursive()] {
        let fib = instantiate(&bytes, "fib");
        for (n, expected) in [(0, 0), (1, 1), (10, 55), (20, 6765)] {
            assert_eq!(execute(&fib, n), vec![Value::I32(expected)], "fib({n}) should be {expected}");
        }
    }

    let fill = instantiate(&fill(), "fill");
    assert_eq!(execute(&fill, 300), vec![Value::I32(300)]);
    let memory = fill.runtime.memory().unwrap();
    assert_eq!((memory[0], memory[255], memory[256], memory[299]), (0, 255, 0, 43));

    println!("All module correctness checks passed.");
}

fn bench_noop_loop(c: &mut Criterion) {
    let loaded = instantiate(&noop_loop(), "run");
    let mut group = c.benchmark_group("dispatch");
    for iterations in [1_000, 10_000, 100_000, 1_000_000] {
        group.bench_with_input(BenchmarkId::new("noop_loop", iterations), &iterations, |b, &n| {
            b.iter(|| black_box(execute(&loaded, n)));
        });
    }
    group.finish();
}

fn bench_fib_iterative(c: &mut Criterion) {
    let loaded = instantiate(&fib_iterative(), "fib");
    let mut group = c.benchmark_group("compute");
    for n in [10, 20, 30, 40, 46] {
        group.bench_with_input(BenchmarkId::new("fib_iterative", n), &n, |b, &n| {
            b.iter(|| black_box(execute(&loaded, n)));
        });
    }
    group.finish();
}

fn bench_fib_recursive(c: &mut Criterion) {
    let loaded = instantiate(&fib_recursive(), "fib");
    let mut group = c.benchmark_group("call_overhead");
    for n in [10, 15, 20, 25] {
        group.bench_with_input(BenchmarkId::new("fib_recursive", n), &n, |b, &n| {
            b.iter(|| black_box(execute(&loaded, n)));
        });
    }
    group.finish();
}

fn bench_fill(c: &mut Criterion) {
    let loaded = instantiate(&fill(), "fill");
    let mut group = c.benchmark_group("memory");
    for size in [100, 1000, 65536] {
        group.bench_with_input(BenchmarkId::new("fill", size), &size, |b, &size| {
            b.iter(|| black_box(execute(&loaded, size)));
        });
    }
    group.finish();
}

fn verify_and_bench(c: &mut Criterion) {
    verify_modules();
    bench_noop_loop(c);
    bench_fib_iterative(c);
    bench_fib_recursive(c);
    bench_fill(c);
}

criterion_group!(benches, verify_and_bench);
criterion_main!(benches);
