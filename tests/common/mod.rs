//! Module fixtures shared between integration tests
#![allow(dead_code)]

use wasmbed::parser::builder::{Code, ModuleBuilder};
use wasmbed::parser::instruction::{BlockType, NumericOp};
use wasmbed::parser::module::ValueType::*;
use wasmbed::{Environment, Module, Runtime};

/// `add(i32, i32) -> i32`
pub fn add_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let add = b.add_function(
        &[I32, I32],
        &[I32],
        &[],
        Code::new().local_get(0).local_get(1).numeric(NumericOp::I32Add).end(),
    );
    b.export_function("add", add);
    b.build()
}

/// One page of memory, with `size()` and `grow(delta)` exported
pub fn memory_module(max: Option<u32>) -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    b.memory(1, max);
    let size = b.add_function(&[], &[I32], &[], Code::new().memory_size().end());
    let grow = b.add_function(&[I32], &[I32], &[], Code::new().local_get(0).memory_grow().end());
    b.export_function("size", size).export_function("grow", grow);
    b.build()
}

/// `spin()` never returns
pub fn spin_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let spin = b.add_function(&[], &[], &[], Code::new().loop_(BlockType::Empty).br(0).end().end());
    b.export_function("spin", spin);
    b.build()
}

/// `recurse(n)` calls itself `n` times
pub fn recursion_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let recurse = b.add_function(
        &[I32],
        &[I32],
        &[],
        Code::new()
            .local_get(0)
            .numeric(NumericOp::I32Eqz)
            .if_(BlockType::Value(I32))
            .i32_const(0)
            .else_()
            .local_get(0)
            .i32_const(1)
            .numeric(NumericOp::I32Sub)
            .call(0)
            .i32_const(1)
            .numeric(NumericOp::I32Add)
            .end()
            .end(),
    );
    b.export_function("recurse", recurse);
    b.build()
}

pub fn load(env: &Environment, runtime: &Runtime, bytes: &[u8]) {
    let module = Module::parse(env, bytes).unwrap();
    let loaded = runtime.load(module).unwrap();
    runtime.run_start(&loaded).unwrap();
}
