//! WebAssembly instruction executor
//!
//! Execution is iterative: wasm-to-wasm calls push a [`Frame`] instead of
//! recursing on the native stack, so guest recursion depth is bounded only
//! by the configured value stack budget. Structured control uses a label
//! stack whose entries record the operand height to unwind to, the number of
//! values a branch carries and where execution continues.
//!
//! Host functions run synchronously inside [`Executor::enter`]; they see the
//! runtime memory and user data through a [`HostContext`].

use std::any::Any;
use std::sync::Arc;

use tracing::{debug, trace};

use super::config::{RuntimeConfig, FRAME_OVERHEAD};
use super::host::{HostContext, HostFunction};
use super::ops;
use super::store::{FuncAddr, FunctionInstance, Store};
use super::{Trap, Value};
use crate::parser::instruction::{BlockType, Instruction};
use crate::parser::module::{FunctionType, ParsedModule};

/// An active wasm function call
#[derive(Debug)]
struct Frame {
    module: Arc<ParsedModule>,
    instance: usize,
    body: usize,
    /// Resume point after a nested call returns
    pc: usize,
    /// Stack slot of local 0; the frame's operands sit above its locals
    locals_base: usize,
    /// Label stack height when the frame was entered
    label_base: usize,
    arity: usize,
}

#[derive(Debug, Clone, Copy)]
struct Label {
    stack_height: usize,
    /// Values carried by a branch to this label
    arity: usize,
    continuation: usize,
    is_loop: bool,
}

/// Per-frame values the instruction loop needs without borrowing the frame
#[derive(Debug, Clone, Copy)]
struct Cursor {
    instance: usize,
    locals_base: usize,
    label_base: usize,
}

enum Flow {
    Next(usize),
    Call(FuncAddr),
    Return,
}

enum Callee {
    Wasm {
        module: Arc<ParsedModule>,
        instance: usize,
        body: usize,
        params: usize,
        arity: usize,
    },
    Host {
        func: Arc<dyn HostFunction>,
        ty: FunctionType,
        name: String,
    },
}

pub(crate) struct Executor<'a> {
    store: &'a mut Store,
    config: &'a RuntimeConfig,
    user_data: Option<&'a (dyn Any + Send + Sync)>,
    frames: Vec<Frame>,
    labels: Vec<Label>,
    steps: u64,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(
        store: &'a mut Store,
        config: &'a RuntimeConfig,
        user_data: Option<&'a (dyn Any + Send + Sync)>,
    ) -> Self {
        Executor {
            store,
            config,
            user_data,
            frames: Vec::new(),
            labels: Vec::new(),
            steps: 0,
        }
    }

    /// Call the function at `addr` with already type-checked arguments.
    ///
    /// The value stack is empty again afterwards whether the call completed
    /// or trapped.
    pub(crate) fn invoke(&mut self, addr: FuncAddr, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let arity = self.store.function(addr)?.ty().return_types.len();
        self.reset();
        self.store.stack.push_all(args.iter().copied());

        let result = self
            .enter(addr)
            .and_then(|()| self.run())
            .and_then(|()| self.store.stack.pop_n(arity));

        match &result {
            Ok(values) => trace!(addr, steps = self.steps, results = values.len(), "call completed"),
            Err(trap) => debug!(addr, steps = self.steps, depth = self.frames.len(), %trap, "call trapped"),
        }
        self.reset();
        result
    }

    fn reset(&mut self) {
        self.store.stack.clear();
        self.frames.clear();
        self.labels.clear();
        self.steps = 0;
    }

    fn run(&mut self) -> Result<(), Trap> {
        'frames: loop {
            let Some(frame) = self.frames.last() else {
                return Ok(());
            };
            let module = Arc::clone(&frame.module);
            let cursor = Cursor {
                instance: frame.instance,
                locals_base: frame.locals_base,
                label_base: frame.label_base,
            };
            let mut pc = frame.pc;
            let code = match module.code.get(frame.body) {
                Some(body) => &body.code,
                None => return Err(Trap::UndefinedElement),
            };

            loop {
                let Some(inst) = code.get(pc) else {
                    self.leave()?;
                    continue 'frames;
                };
                self.tick()?;
                match self.step(&module, cursor, inst, pc)? {
                    Flow::Next(next) => pc = next,
                    Flow::Call(addr) => {
                        if let Some(frame) = self.frames.last_mut() {
                            frame.pc = pc + 1;
                        }
                        self.enter(addr)?;
                        continue 'frames;
                    }
                    Flow::Return => {
                        self.leave()?;
                        continue 'frames;
                    }
                }
            }
        }
    }

    fn tick(&mut self) -> Result<(), Trap> {
        self.steps += 1;
        match self.config.step_limit {
            Some(limit) if self.steps > limit => Err(Trap::StepLimitExceeded),
            _ => Ok(()),
        }
    }

    /// Start a call whose arguments are on top of the stack. Wasm callees get
    /// a new frame; host callees run to completion here.
    fn enter(&mut self, addr: FuncAddr) -> Result<(), Trap> {
        let callee = match self.store.function(addr)? {
            FunctionInstance::Wasm {
                module,
                instance,
                body,
                ty,
            } => Callee::Wasm {
                module: Arc::clone(module),
                instance: *instance,
                body: *body,
                params: ty.parameters.len(),
                arity: ty.return_types.len(),
            },
            FunctionInstance::Host { func, ty, name } => Callee::Host {
                func: Arc::clone(func),
                ty: ty.clone(),
                name: name.clone(),
            },
        };

        match callee {
            Callee::Wasm {
                module,
                instance,
                body,
                params,
                arity,
            } => {
                // a linked export is gated on its own module's start like a direct call
                let caller = self.frames.last().map(|frame| frame.instance);
                if caller.is_some_and(|caller| caller != instance) && !self.store.instance(instance)?.started {
                    return Err(Trap::ModuleNotStarted(instance));
                }
                let code = module.code.get(body).ok_or(Trap::UndefinedElement)?;
                let nlocals = code.locals.len() as usize;
                let needed = self.store.stack.len()
                    + nlocals
                    + code.max_stack_height as usize
                    + FRAME_OVERHEAD * (self.frames.len() + 1);
                if needed > self.config.stack_slots() {
                    return Err(Trap::StackExhausted);
                }

                let locals_base = self.store.stack.len().checked_sub(params).ok_or(Trap::StackUnderflow)?;
                self.store.stack.push_all(code.locals.iter().map(Value::default_for));
                self.frames.push(Frame {
                    module: Arc::clone(&module),
                    instance,
                    body,
                    pc: 0,
                    locals_base,
                    label_base: self.labels.len(),
                    arity,
                });
                Ok(())
            }
            Callee::Host { func, ty, name } => {
                let args = self.store.stack.pop_n(ty.parameters.len())?;
                trace!(import = %name, args = args.len(), "host call");
                let results = {
                    let mut ctx = HostContext::new(self.store.memory.as_mut(), self.user_data);
                    func.call(&mut ctx, &args)?
                };
                let types: Vec<_> = results.iter().map(Value::typ).collect();
                if types != ty.return_types {
                    return Err(Trap::Host(format!(
                        "{name} returned {types:?}, expected {:?}",
                        ty.return_types
                    )));
                }
                self.store.stack.push_all(results);
                Ok(())
            }
        }
    }

    /// Finish the innermost frame, leaving its results on the stack
    fn leave(&mut self) -> Result<(), Trap> {
        let frame = self.frames.pop().ok_or(Trap::StackUnderflow)?;
        self.store.stack.unwind(frame.locals_base, frame.arity)?;
        self.labels.truncate(frame.label_base);
        Ok(())
    }

    fn push_label(&mut self, params: usize, arity: usize, continuation: usize, is_loop: bool) -> Result<(), Trap> {
        let stack_height = self.store.stack.len().checked_sub(params).ok_or(Trap::StackUnderflow)?;
        self.labels.push(Label {
            stack_height,
            arity,
            continuation,
            is_loop,
        });
        Ok(())
    }

    /// Branch to the label `depth` levels out. Targets beyond the frame's own
    /// labels mean the function body itself, i.e. a return.
    fn branch(&mut self, depth: u32, cursor: Cursor) -> Result<Flow, Trap> {
        let available = self.labels.len() - cursor.label_base;
        if depth as usize >= available {
            return Ok(Flow::Return);
        }
        let idx = self.labels.len() - 1 - depth as usize;
        let label = self.labels[idx];
        self.store.stack.unwind(label.stack_height, label.arity)?;
        // a loop label stays active for the next iteration
        self.labels.truncate(if label.is_loop { idx + 1 } else { idx });
        Ok(Flow::Next(label.continuation))
    }

    fn step(&mut self, module: &ParsedModule, cursor: Cursor, inst: &Instruction, pc: usize) -> Result<Flow, Trap> {
        use Instruction::*;
        let next = Flow::Next(pc + 1);

        match inst {
            Unreachable => return Err(Trap::Unreachable),
            Nop => {}

            Block { block_type, end } => {
                let (params, results) = block_arity(module, *block_type);
                self.push_label(params, results, *end as usize + 1, false)?;
            }
            Loop { block_type } => {
                let (params, _) = block_arity(module, *block_type);
                self.push_label(params, params, pc + 1, true)?;
            }
            If {
                block_type,
                else_pc,
                end,
            } => {
                let cond = self.store.stack.pop_i32()?;
                let (params, results) = block_arity(module, *block_type);
                let continuation = *end as usize + 1;
                if cond != 0 {
                    self.push_label(params, results, continuation, false)?;
                } else if else_pc != end {
                    self.push_label(params, results, continuation, false)?;
                    return Ok(Flow::Next(*else_pc as usize + 1));
                } else {
                    return Ok(Flow::Next(continuation));
                }
            }
            Else { end } => {
                // then-arm finished; skip the else arm
                self.labels.pop();
                return Ok(Flow::Next(*end as usize + 1));
            }
            End => {
                if self.labels.len() > cursor.label_base {
                    self.labels.pop();
                } else {
                    return Ok(Flow::Return);
                }
            }

            Br(depth) => return self.branch(*depth, cursor),
            BrIf(depth) => {
                if self.store.stack.pop_i32()? != 0 {
                    return self.branch(*depth, cursor);
                }
            }
            BrTable { labels, default } => {
                let idx = self.store.stack.pop_i32()? as u32 as usize;
                let depth = labels.get(idx).copied().unwrap_or(*default);
                return self.branch(depth, cursor);
            }
            Return => return Ok(Flow::Return),

            Call(func_idx) => {
                let addr = *self
                    .store
                    .instance(cursor.instance)?
                    .func_addrs
                    .get(*func_idx as usize)
                    .ok_or(Trap::UndefinedElement)?;
                return Ok(Flow::Call(addr));
            }
            CallIndirect { type_index, .. } => {
                let table_addr = self
                    .store
                    .instance(cursor.instance)?
                    .table_addr
                    .ok_or(Trap::UndefinedElement)?;
                let elem = self.store.stack.pop_i32()? as u32;
                let table = self.store.tables.get(table_addr).ok_or(Trap::UndefinedElement)?;
                let addr = table.get(elem)?;
                let expected = module.types.get(*type_index as usize).ok_or(Trap::IndirectCallTypeMismatch)?;
                if self.store.function(addr)?.ty() != expected {
                    return Err(Trap::IndirectCallTypeMismatch);
                }
                return Ok(Flow::Call(addr));
            }

            Instruction::Drop => {
                self.store.stack.pop()?;
            }
            Select => {
                let cond = self.store.stack.pop_i32()?;
                let b = self.store.stack.pop()?;
                let a = self.store.stack.pop()?;
                self.store.stack.push(if cond != 0 { a } else { b });
            }

            LocalGet(idx) => {
                let value = self.store.stack.get(cursor.locals_base + *idx as usize)?;
                self.store.stack.push(value);
            }
            LocalSet(idx) => {
                let value = self.store.stack.pop()?;
                self.store.stack.set(cursor.locals_base + *idx as usize, value)?;
            }
            LocalTee(idx) => {
                let value = *self.store.stack.peek().ok_or(Trap::StackUnderflow)?;
                self.store.stack.set(cursor.locals_base + *idx as usize, value)?;
            }
            GlobalGet(idx) => {
                let addr = self.global_addr(cursor, *idx)?;
                let value = self.store.global(addr)?.value;
                self.store.stack.push(value);
            }
            GlobalSet(idx) => {
                let addr = self.global_addr(cursor, *idx)?;
                let value = self.store.stack.pop()?;
                self.store.global_mut(addr)?.value = value;
            }

            Load(op, memarg) => ops::memory::load(&mut self.store.stack, self.store.memory.as_ref(), *op, memarg)?,
            Instruction::Store(op, memarg) => ops::memory::store(&mut self.store.stack, self.store.memory.as_mut(), *op, memarg)?,
            MemorySize => ops::memory::size(&mut self.store.stack, self.store.memory.as_ref())?,
            MemoryGrow => ops::memory::grow(&mut self.store.stack, self.store.memory.as_mut())?,

            I32Const(v) => self.store.stack.push(Value::I32(*v)),
            I64Const(v) => self.store.stack.push(Value::I64(*v)),
            F32Const(v) => self.store.stack.push(Value::F32(*v)),
            F64Const(v) => self.store.stack.push(Value::F64(*v)),
            Numeric(op) => ops::numeric::execute(&mut self.store.stack, *op)?,
        }
        Ok(next)
    }

    fn global_addr(&self, cursor: Cursor, idx: u32) -> Result<usize, Trap> {
        self.store
            .instance(cursor.instance)?
            .global_addrs
            .get(idx as usize)
            .copied()
            .ok_or(Trap::UndefinedElement)
    }
}

/// Parameter and result counts of a block type
fn block_arity(module: &ParsedModule, block_type: BlockType) -> (usize, usize) {
    match block_type {
        BlockType::Empty => (0, 0),
        BlockType::Value(_) => (0, 1),
        BlockType::FuncType(idx) => module
            .types
            .get(idx as usize)
            .map_or((0, 0), |ft| (ft.parameters.len(), ft.return_types.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::builder::{Code, ModuleBuilder};
    use crate::parser::instruction::NumericOp::*;
    use crate::parser::module::ValueType::{self, *};
    use crate::runtime::memory::Memory;
    use crate::runtime::store::ModuleInstance;
    use rstest::rstest;

    /// Store with every defined function of one import-free module
    fn store_for(builder: &ModuleBuilder) -> Store {
        let module = Arc::new(crate::parser::parse(&builder.build()).unwrap());
        let mut store = Store::new();
        for (body, type_idx) in module.functions.iter().enumerate() {
            store.functions.push(FunctionInstance::Wasm {
                module: Arc::clone(&module),
                instance: 0,
                body,
                ty: module.types[*type_idx as usize].clone(),
            });
        }
        if let Some(limits) = module.memory_limits() {
            store.memory = Some(Memory::new(limits.min, limits.max.unwrap_or(limits.min)));
        }
        store.instances.push(ModuleInstance {
            func_addrs: (0..module.functions.len()).collect(),
            module,
            global_addrs: vec![],
            table_addr: None,
            start: None,
            started: true,
        });
        store
    }

    fn call(store: &mut Store, addr: FuncAddr, args: &[Value]) -> Result<Vec<Value>, Trap> {
        Executor::new(store, &RuntimeConfig::DEFAULT, None).invoke(addr, args)
    }

    fn factorial_module() -> ModuleBuilder {
        let mut b = ModuleBuilder::new();
        // fac(n) = n < 2 ? 1 : n * fac(n - 1)
        b.add_function(
            &[I64],
            &[I64],
            &[],
            Code::new()
                .local_get(0)
                .i64_const(2)
                .numeric(I64LtS)
                .if_(BlockType::Value(I64))
                .i64_const(1)
                .else_()
                .local_get(0)
                .local_get(0)
                .i64_const(1)
                .numeric(I64Sub)
                .call(0)
                .numeric(I64Mul)
                .end()
                .end(),
        );
        b
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(5, 120)]
    #[case(20, 2_432_902_008_176_640_000)]
    fn test_recursive_factorial(#[case] n: i64, #[case] expected: i64) {
        let mut store = store_for(&factorial_module());
        assert_eq!(call(&mut store, 0, &[Value::I64(n)]), Ok(vec![Value::I64(expected)]));
        assert!(store.stack.is_empty());
    }

    #[test]
    fn test_loop_sums_with_br_if() {
        let mut b = ModuleBuilder::new();
        // sum 1..=n using a counting loop
        b.add_function(
            &[I32],
            &[I32],
            &[I32],
            Code::new()
                .block(BlockType::Empty)
                .loop_(BlockType::Empty)
                .local_get(0)
                .numeric(I32Eqz)
                .br_if(1)
                .local_get(1)
                .local_get(0)
                .numeric(I32Add)
                .local_set(1)
                .local_get(0)
                .i32_const(1)
                .numeric(I32Sub)
                .local_set(0)
                .br(0)
                .end()
                .end()
                .local_get(1)
                .end(),
        );
        let mut store = store_for(&b);
        assert_eq!(call(&mut store, 0, &[Value::I32(100)]), Ok(vec![Value::I32(5050)]));
        assert_eq!(call(&mut store, 0, &[Value::I32(0)]), Ok(vec![Value::I32(0)]));
    }

    #[rstest]
    #[case(0, 10)]
    #[case(1, 11)]
    #[case(2, 12)]
    #[case(7, 12)]
    #[case(-1, 12)]
    fn test_br_table_selects_target(#[case] selector: i32, #[case] expected: i32) {
        let mut b = ModuleBuilder::new();
        b.add_function(
            &[I32],
            &[I32],
            &[],
            Code::new()
                .block(BlockType::Empty)
                .block(BlockType::Empty)
                .block(BlockType::Empty)
                .local_get(0)
                .br_table(&[0, 1], 2)
                .end()
                .i32_const(10)
                .return_()
                .end()
                .i32_const(11)
                .return_()
                .end()
                .i32_const(12)
                .end(),
        );
        let mut store = store_for(&b);
        assert_eq!(call(&mut store, 0, &[Value::I32(selector)]), Ok(vec![Value::I32(expected)]));
    }

    #[test]
    fn test_branch_carries_block_result() {
        let mut b = ModuleBuilder::new();
        b.add_function(
            &[],
            &[I32],
            &[],
            Code::new()
                .block(BlockType::Value(I32))
                .i32_const(1)
                .i32_const(2)
                .i32_const(3)
                .br(0)
                .end()
                .end(),
        );
        let mut store = store_for(&b);
        assert_eq!(call(&mut store, 0, &[]), Ok(vec![Value::I32(3)]));
    }

    #[test]
    fn test_if_without_else_skips_body() {
        let mut b = ModuleBuilder::new();
        b.add_function(
            &[I32],
            &[I32],
            &[],
            Code::new()
                .local_get(0)
                .if_(BlockType::Empty)
                .i32_const(99)
                .local_set(0)
                .end()
                .local_get(0)
                .end(),
        );
        let mut store = store_for(&b);
        assert_eq!(call(&mut store, 0, &[Value::I32(0)]), Ok(vec![Value::I32(0)]));
        assert_eq!(call(&mut store, 0, &[Value::I32(5)]), Ok(vec![Value::I32(99)]));
    }

    #[test]
    fn test_deep_recursion_exhausts_stack() {
        let mut b = ModuleBuilder::new();
        b.add_function(&[], &[], &[], Code::new().call(0).end());
        let mut store = store_for(&b);
        assert_eq!(call(&mut store, 0, &[]), Err(Trap::StackExhausted));
        assert!(store.stack.is_empty());
        // the runtime stays usable after a trap
        let mut store = store_for(&factorial_module());
        assert_eq!(call(&mut store, 0, &[Value::I64(3)]), Ok(vec![Value::I64(6)]));
    }

    #[test]
    fn test_step_limit_stops_infinite_loop() {
        let mut b = ModuleBuilder::new();
        b.add_function(&[], &[], &[], Code::new().loop_(BlockType::Empty).br(0).end().end());
        let mut store = store_for(&b);
        let config = RuntimeConfig::DEFAULT.with_step_limit(Some(1000));
        let result = Executor::new(&mut store, &config, None).invoke(0, &[]);
        assert_eq!(result, Err(Trap::StepLimitExceeded));
    }

    #[rstest]
    #[case(I32DivS, Value::I32(1), Value::I32(0), Trap::IntegerDivideByZero)]
    #[case(I32DivS, Value::I32(i32::MIN), Value::I32(-1), Trap::IntegerOverflow)]
    #[case(I64RemU, Value::I64(1), Value::I64(0), Trap::IntegerDivideByZero)]
    fn test_arithmetic_traps(
        #[case] op: crate::parser::instruction::NumericOp,
        #[case] a: Value,
        #[case] b: Value,
        #[case] trap: Trap,
    ) {
        let t: ValueType = a.typ();
        let mut builder = ModuleBuilder::new();
        builder.add_function(&[t, t], &[t], &[], Code::new().local_get(0).local_get(1).numeric(op).end());
        let mut store = store_for(&builder);
        assert_eq!(call(&mut store, 0, &[a, b]), Err(trap));
    }

    #[test]
    fn test_memory_access_traps_out_of_bounds() {
        let mut b = ModuleBuilder::new();
        b.memory(1, Some(1));
        b.add_function(
            &[I32],
            &[I32],
            &[],
            Code::new()
                .local_get(0)
                .load(crate::parser::instruction::LoadOp::I32Load, 0)
                .end(),
        );
        let mut store = store_for(&b);
        assert_eq!(call(&mut store, 0, &[Value::I32(65532)]), Ok(vec![Value::I32(0)]));
        assert_eq!(call(&mut store, 0, &[Value::I32(65533)]), Err(Trap::OutOfBoundsMemory));
    }

    #[test]
    fn test_unreachable_traps() {
        let mut b = ModuleBuilder::new();
        b.add_function(&[], &[], &[], Code::new().unreachable().end());
        let mut store = store_for(&b);
        assert_eq!(call(&mut store, 0, &[]), Err(Trap::Unreachable));
    }
}
