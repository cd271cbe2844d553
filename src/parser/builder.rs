//! Programmatic construction of module binaries.
//!
//! Hosts embedding the interpreter and the test suite use this to produce
//! `.wasm` bytes without a text-format toolchain:
//!
//! ```
//! use wasmbed::parser::builder::{Code, ModuleBuilder};
//! use wasmbed::parser::instruction::NumericOp;
//! use wasmbed::parser::module::ValueType::I32;
//!
//! let mut builder = ModuleBuilder::new();
//! let add = builder.add_function(
//!     &[I32, I32],
//!     &[I32],
//!     &[],
//!     Code::new().local_get(0).local_get(1).numeric(NumericOp::I32Add).end(),
//! );
//! builder.export_function("add", add);
//! let bytes = builder.build();
//! assert!(wasmbed::parser::parse(&bytes).is_ok());
//! ```
//!
//! Function imports must be declared before defined functions, and global
//! imports before defined globals, so returned indices stay stable.

use super::encoding::*;
use super::instruction::{BlockType, LoadOp, NumericOp, StoreOp};
use super::module::{ConstExpr, FunctionType, GlobalType, Limits, ValueType};

/// Instruction byte stream for one function body
#[derive(Debug, Clone, Default)]
pub struct Code {
    bytes: Vec<u8>,
}

impl Code {
    pub fn new() -> Self {
        Code { bytes: Vec::new() }
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    fn op(mut self, opcode: u8) -> Self {
        self.bytes.push(opcode);
        self
    }

    fn op_u32(mut self, opcode: u8, imm: u32) -> Self {
        self.bytes.push(opcode);
        write_vu32(&mut self.bytes, imm);
        self
    }

    fn block_op(mut self, opcode: u8, block_type: BlockType) -> Self {
        self.bytes.push(opcode);
        match block_type {
            BlockType::Empty => self.bytes.push(BLOCK_TYPE_EMPTY),
            BlockType::Value(t) => self.bytes.push(t.encode()),
            BlockType::FuncType(idx) => write_vs64(&mut self.bytes, idx as i64),
        }
        self
    }

    pub fn unreachable(self) -> Self {
        self.op(OP_UNREACHABLE)
    }

    pub fn nop(self) -> Self {
        self.op(OP_NOP)
    }

    pub fn block(self, block_type: BlockType) -> Self {
        self.block_op(OP_BLOCK, block_type)
    }

    pub fn loop_(self, block_type: BlockType) -> Self {
        self.block_op(OP_LOOP, block_type)
    }

    pub fn if_(self, block_type: BlockType) -> Self {
        self.block_op(OP_IF, block_type)
    }

    pub fn else_(self) -> Self {
        self.op(OP_ELSE)
    }

    pub fn end(self) -> Self {
        self.op(OP_END)
    }

    pub fn br(self, depth: u32) -> Self {
        self.op_u32(OP_BR, depth)
    }

    pub fn br_if(self, depth: u32) -> Self {
        self.op_u32(OP_BR_IF, depth)
    }

    pub fn br_table(mut self, labels: &[u32], default: u32) -> Self {
        self.bytes.push(OP_BR_TABLE);
        write_vu32(&mut self.bytes, labels.len() as u32);
        for label in labels {
            write_vu32(&mut self.bytes, *label);
        }
        write_vu32(&mut self.bytes, default);
        self
    }

    pub fn return_(self) -> Self {
        self.op(OP_RETURN)
    }

    pub fn call(self, func_idx: u32) -> Self {
        self.op_u32(OP_CALL, func_idx)
    }

    pub fn call_indirect(mut self, type_idx: u32) -> Self {
        self.bytes.push(OP_CALL_INDIRECT);
        write_vu32(&mut self.bytes, type_idx);
        self.bytes.push(0);
        self
    }

    pub fn drop(self) -> Self {
        self.op(OP_DROP)
    }

    pub fn select(self) -> Self {
        self.op(OP_SELECT)
    }

    pub fn local_get(self, idx: u32) -> Self {
        self.op_u32(OP_LOCAL_GET, idx)
    }

    pub fn local_set(self, idx: u32) -> Self {
        self.op_u32(OP_LOCAL_SET, idx)
    }

    pub fn local_tee(self, idx: u32) -> Self {
        self.op_u32(OP_LOCAL_TEE, idx)
    }

    pub fn global_get(self, idx: u32) -> Self {
        self.op_u32(OP_GLOBAL_GET, idx)
    }

    pub fn global_set(self, idx: u32) -> Self {
        self.op_u32(OP_GLOBAL_SET, idx)
    }

    /// Load with natural alignment
    pub fn load(mut self, op: LoadOp, offset: u32) -> Self {
        self.bytes.push(op.opcode());
        write_vu32(&mut self.bytes, op.width().trailing_zeros());
        write_vu32(&mut self.bytes, offset);
        self
    }

    /// Store with natural alignment
    pub fn store(mut self, op: StoreOp, offset: u32) -> Self {
        self.bytes.push(op.opcode());
        write_vu32(&mut self.bytes, op.width().trailing_zeros());
        write_vu32(&mut self.bytes, offset);
        self
    }

    pub fn memory_size(self) -> Self {
        self.op(OP_MEMORY_SIZE).op(0)
    }

    pub fn memory_grow(self) -> Self {
        self.op(OP_MEMORY_GROW).op(0)
    }

    pub fn i32_const(mut self, v: i32) -> Self {
        self.bytes.push(OP_I32_CONST);
        write_vs32(&mut self.bytes, v);
        self
    }

    pub fn i64_const(mut self, v: i64) -> Self {
        self.bytes.push(OP_I64_CONST);
        write_vs64(&mut self.bytes, v);
        self
    }

    pub fn f32_const(mut self, v: f32) -> Self {
        self.bytes.push(OP_F32_CONST);
        write_f32(&mut self.bytes, v);
        self
    }

    pub fn f64_const(mut self, v: f64) -> Self {
        self.bytes.push(OP_F64_CONST);
        write_f64(&mut self.bytes, v);
        self
    }

    pub fn numeric(mut self, op: NumericOp) -> Self {
        let code = op.code();
        if code > 0xff {
            self.bytes.push((code >> 8) as u8);
            write_vu32(&mut self.bytes, (code & 0xff) as u32);
        } else {
            self.bytes.push(code as u8);
        }
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

struct FunctionDef {
    type_idx: u32,
    locals: Vec<ValueType>,
    code: Code,
}

enum ImportDef {
    Function(u32),
    Table(Limits),
    Memory(Limits),
    Global(GlobalType),
}

#[derive(Default)]
pub struct ModuleBuilder {
    types: Vec<FunctionType>,
    imports: Vec<(String, String, ImportDef)>,
    functions: Vec<FunctionDef>,
    table: Option<Limits>,
    memory: Option<Limits>,
    globals: Vec<(GlobalType, ConstExpr)>,
    exports: Vec<(String, u8, u32)>,
    start: Option<u32>,
    elements: Vec<(i32, Vec<u32>)>,
    data: Vec<(i32, Vec<u8>)>,
    custom: Vec<(String, Vec<u8>)>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a function type, returning its index
    pub fn add_type(&mut self, params: &[ValueType], results: &[ValueType]) -> u32 {
        let ft = FunctionType::new(params, results);
        match self.types.iter().position(|t| *t == ft) {
            Some(idx) => idx as u32,
            None => {
                self.types.push(ft);
                (self.types.len() - 1) as u32
            }
        }
    }

    fn imported_functions(&self) -> u32 {
        self.imports
            .iter()
            .filter(|(_, _, d)| matches!(d, ImportDef::Function(_)))
            .count() as u32
    }

    fn imported_globals(&self) -> u32 {
        self.imports
            .iter()
            .filter(|(_, _, d)| matches!(d, ImportDef::Global(_)))
            .count() as u32
    }

    /// Returns the function index of the import
    pub fn import_function(&mut self, module: &str, name: &str, params: &[ValueType], results: &[ValueType]) -> u32 {
        debug_assert!(self.functions.is_empty(), "function imports must precede definitions");
        let type_idx = self.add_type(params, results);
        let idx = self.imported_functions();
        self.imports
            .push((module.to_string(), name.to_string(), ImportDef::Function(type_idx)));
        idx
    }

    pub fn import_memory(&mut self, module: &str, name: &str, min: u32, max: Option<u32>) {
        self.imports
            .push((module.to_string(), name.to_string(), ImportDef::Memory(Limits { min, max })));
    }

    pub fn import_table(&mut self, module: &str, name: &str, min: u32, max: Option<u32>) {
        self.imports
            .push((module.to_string(), name.to_string(), ImportDef::Table(Limits { min, max })));
    }

    /// Returns the global index of the import
    pub fn import_global(&mut self, module: &str, name: &str, value_type: ValueType, mutable: bool) -> u32 {
        debug_assert!(self.globals.is_empty(), "global imports must precede definitions");
        let idx = self.imported_globals();
        self.imports.push((
            module.to_string(),
            name.to_string(),
            ImportDef::Global(GlobalType { value_type, mutable }),
        ));
        idx
    }

    /// Returns the function index of the definition
    pub fn add_function(&mut self, params: &[ValueType], results: &[ValueType], locals: &[ValueType], code: Code) -> u32 {
        let type_idx = self.add_type(params, results);
        self.functions.push(FunctionDef {
            type_idx,
            locals: locals.to_vec(),
            code,
        });
        self.imported_functions() + self.functions.len() as u32 - 1
    }

    pub fn memory(&mut self, min: u32, max: Option<u32>) -> &mut Self {
        self.memory = Some(Limits { min, max });
        self
    }

    pub fn table(&mut self, min: u32, max: Option<u32>) -> &mut Self {
        self.table = Some(Limits { min, max });
        self
    }

    /// Returns the global index of the definition
    pub fn add_global(&mut self, value_type: ValueType, mutable: bool, init: ConstExpr) -> u32 {
        self.globals.push((GlobalType { value_type, mutable }, init));
        self.imported_globals() + self.globals.len() as u32 - 1
    }

    pub fn export_function(&mut self, name: &str, func_idx: u32) -> &mut Self {
        self.exports.push((name.to_string(), DESC_FUNC, func_idx));
        self
    }

    pub fn export_memory(&mut self, name: &str) -> &mut Self {
        self.exports.push((name.to_string(), DESC_MEMORY, 0));
        self
    }

    pub fn export_table(&mut self, name: &str) -> &mut Self {
        self.exports.push((name.to_string(), DESC_TABLE, 0));
        self
    }

    pub fn export_global(&mut self, name: &str, global_idx: u32) -> &mut Self {
        self.exports.push((name.to_string(), DESC_GLOBAL, global_idx));
        self
    }

    pub fn start(&mut self, func_idx: u32) -> &mut Self {
        self.start = Some(func_idx);
        self
    }

    pub fn element(&mut self, offset: i32, functions: &[u32]) -> &mut Self {
        self.elements.push((offset, functions.to_vec()));
        self
    }

    pub fn data(&mut self, offset: i32, bytes: &[u8]) -> &mut Self {
        self.data.push((offset, bytes.to_vec()));
        self
    }

    pub fn custom_section(&mut self, name: &str, payload: &[u8]) -> &mut Self {
        self.custom.push((name.to_string(), payload.to_vec()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, MAGIC);
        write_u32(&mut out, VERSION);

        if !self.types.is_empty() {
            let mut sec = Vec::new();
            write_vu32(&mut sec, self.types.len() as u32);
            for ft in &self.types {
                sec.push(TYPE_FUNC);
                write_value_types(&mut sec, &ft.parameters);
                write_value_types(&mut sec, &ft.return_types);
            }
            write_section(&mut out, SECTION_TYPE, &sec);
        }

        if !self.imports.is_empty() {
            let mut sec = Vec::new();
            write_vu32(&mut sec, self.imports.len() as u32);
            for (module, name, desc) in &self.imports {
                write_name(&mut sec, module);
                write_name(&mut sec, name);
                match desc {
                    ImportDef::Function(type_idx) => {
                        sec.push(DESC_FUNC);
                        write_vu32(&mut sec, *type_idx);
                    }
                    ImportDef::Table(limits) => {
                        sec.push(DESC_TABLE);
                        sec.push(TYPE_FUNCREF);
                        write_limits(&mut sec, limits);
                    }
                    ImportDef::Memory(limits) => {
                        sec.push(DESC_MEMORY);
                        write_limits(&mut sec, limits);
                    }
                    ImportDef::Global(gt) => {
                        sec.push(DESC_GLOBAL);
                        sec.push(gt.value_type.encode());
                        sec.push(gt.mutable as u8);
                    }
                }
            }
            write_section(&mut out, SECTION_IMPORT, &sec);
        }

        if !self.functions.is_empty() {
            let mut sec = Vec::new();
            write_vu32(&mut sec, self.functions.len() as u32);
            for f in &self.functions {
                write_vu32(&mut sec, f.type_idx);
            }
            write_section(&mut out, SECTION_FUNCTION, &sec);
        }

        if let Some(limits) = &self.table {
            let mut sec = vec![1, TYPE_FUNCREF];
            write_limits(&mut sec, limits);
            write_section(&mut out, SECTION_TABLE, &sec);
        }

        if let Some(limits) = &self.memory {
            let mut sec = vec![1];
            write_limits(&mut sec, limits);
            write_section(&mut out, SECTION_MEMORY, &sec);
        }

        if !self.globals.is_empty() {
            let mut sec = Vec::new();
            write_vu32(&mut sec, self.globals.len() as u32);
            for (gt, init) in &self.globals {
                sec.push(gt.value_type.encode());
                sec.push(gt.mutable as u8);
                write_const_expr(&mut sec, init);
            }
            write_section(&mut out, SECTION_GLOBAL, &sec);
        }

        if !self.exports.is_empty() {
            let mut sec = Vec::new();
            write_vu32(&mut sec, self.exports.len() as u32);
            for (name, kind, idx) in &self.exports {
                write_name(&mut sec, name);
                sec.push(*kind);
                write_vu32(&mut sec, *idx);
            }
            write_section(&mut out, SECTION_EXPORT, &sec);
        }

        if let Some(start) = self.start {
            let mut sec = Vec::new();
            write_vu32(&mut sec, start);
            write_section(&mut out, SECTION_START, &sec);
        }

        if !self.elements.is_empty() {
            let mut sec = Vec::new();
            write_vu32(&mut sec, self.elements.len() as u32);
            for (offset, functions) in &self.elements {
                write_vu32(&mut sec, ELEM_ACTIVE_FUNCS);
                write_const_expr(&mut sec, &ConstExpr::I32(*offset));
                write_vu32(&mut sec, functions.len() as u32);
                for f in functions {
                    write_vu32(&mut sec, *f);
                }
            }
            write_section(&mut out, SECTION_ELEMENT, &sec);
        }

        if !self.functions.is_empty() {
            let mut sec = Vec::new();
            write_vu32(&mut sec, self.functions.len() as u32);
            for f in &self.functions {
                let mut body = Vec::new();
                write_vu32(&mut body, f.locals.len() as u32);
                for local in &f.locals {
                    write_vu32(&mut body, 1);
                    body.push(local.encode());
                }
                body.extend_from_slice(f.code.bytes());
                write_u8vec(&mut sec, &body);
            }
            write_section(&mut out, SECTION_CODE, &sec);
        }

        if !self.data.is_empty() {
            let mut sec = Vec::new();
            write_vu32(&mut sec, self.data.len() as u32);
            for (offset, bytes) in &self.data {
                write_vu32(&mut sec, DATA_ACTIVE);
                write_const_expr(&mut sec, &ConstExpr::I32(*offset));
                write_u8vec(&mut sec, bytes);
            }
            write_section(&mut out, SECTION_DATA, &sec);
        }

        for (name, payload) in &self.custom {
            let mut sec = Vec::new();
            write_name(&mut sec, name);
            sec.extend_from_slice(payload);
            write_section(&mut out, SECTION_CUSTOM, &sec);
        }

        out
    }
}

fn write_section(out: &mut Vec<u8>, id: u8, contents: &[u8]) {
    out.push(id);
    write_u8vec(out, contents);
}

fn write_value_types(buf: &mut Vec<u8>, types: &[ValueType]) {
    write_vu32(buf, types.len() as u32);
    for t in types {
        buf.push(t.encode());
    }
}

fn write_limits(buf: &mut Vec<u8>, limits: &Limits) {
    match limits.max {
        Some(max) => {
            buf.push(LIMITS_MIN_MAX);
            write_vu32(buf, limits.min);
            write_vu32(buf, max);
        }
        None => {
            buf.push(LIMITS_MIN);
            write_vu32(buf, limits.min);
        }
    }
}

fn write_const_expr(buf: &mut Vec<u8>, expr: &ConstExpr) {
    match expr {
        ConstExpr::I32(v) => {
            buf.push(OP_I32_CONST);
            write_vs32(buf, *v);
        }
        ConstExpr::I64(v) => {
            buf.push(OP_I64_CONST);
            write_vs64(buf, *v);
        }
        ConstExpr::F32(v) => {
            buf.push(OP_F32_CONST);
            write_f32(buf, *v);
        }
        ConstExpr::F64(v) => {
            buf.push(OP_F64_CONST);
            write_f64(buf, *v);
        }
        ConstExpr::GlobalGet(idx) => {
            buf.push(OP_GLOBAL_GET);
            write_vu32(buf, *idx);
        }
    }
    buf.push(OP_END);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::instruction::Instruction;
    use crate::parser::module::{ExportIndex, ImportDesc};
    use crate::parser::parse;
    use ValueType::*;

    #[test]
    fn test_builds_parseable_module() {
        let mut b = ModuleBuilder::new();
        let log = b.import_function("env", "log", &[I32], &[]);
        let run = b.add_function(
            &[],
            &[],
            &[I64],
            Code::new().i32_const(42).call(log).end(),
        );
        b.memory(1, Some(2)).export_memory("memory");
        b.export_function("run", run).start(run);
        b.data(8, b"hello");

        let module = parse(&b.build()).unwrap();
        assert_eq!(log, 0);
        assert_eq!(run, 1);
        assert_eq!(module.imports[0].desc, ImportDesc::Function(0));
        assert_eq!(module.start, Some(1));
        assert_eq!(module.export("run").map(|e| e.index), Some(ExportIndex::Function(1)));
        assert_eq!(module.data[0].bytes, b"hello");
        assert_eq!(module.code[0].locals.len(), 1);
        assert_eq!(module.code[0].code.last(), Some(&Instruction::End));
    }

    #[test]
    fn test_types_are_interned() {
        let mut b = ModuleBuilder::new();
        assert_eq!(b.add_type(&[I32], &[I32]), 0);
        assert_eq!(b.add_type(&[], &[]), 1);
        assert_eq!(b.add_type(&[I32], &[I32]), 0);
    }

    #[test]
    fn test_prefixed_numeric_encoding() {
        let code = Code::new().numeric(NumericOp::I32TruncSatF32U).numeric(NumericOp::I32Add);
        assert_eq!(code.bytes(), &[0xfc, 0x01, 0x6a]);
    }
}
