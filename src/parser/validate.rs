use super::instruction::{BlockType, Instruction, MemArg};
use super::module::{FunctionType, ParsedModule, ValueType};
use thiserror::Error;
use MaybeValue::{Unknown, Val};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("type mismatch")]
    TypeMismatch,

    #[error("unknown type {0}")]
    UnknownType(u32),

    #[error("unknown function {0}")]
    UnknownFunction(u32),

    #[error("unknown local {0}")]
    UnknownLocal(u32),

    #[error("unknown global {0}")]
    UnknownGlobal(u32),

    #[error("unknown table {0}")]
    UnknownTable(u32),

    #[error("unknown memory 0")]
    UnknownMemory,

    #[error("unknown label {0}")]
    UnknownLabel(u32),

    #[error("global is immutable")]
    ImmutableGlobal,

    #[error("alignment must not be larger than natural")]
    BadAlignment,

    #[error("else without matching if")]
    ElseWithoutIf,

    #[error("operators remaining after end of function")]
    OperatorsAfterEnd,

    #[error("function body must end with end")]
    MissingEnd,
}

#[derive(PartialEq, Debug, Clone, Copy)]
enum MaybeValue {
    Val(ValueType),
    Unknown,
}

impl MaybeValue {
    fn matches(&self, other: &MaybeValue) -> bool {
        match (self, other) {
            (Val(a), Val(b)) => a == b,
            _ => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If,
    Else,
}

#[derive(Clone, Debug)]
struct CtrlFrame {
    kind: FrameKind,
    start_types: Vec<ValueType>,
    end_types: Vec<ValueType>,
    height: usize,
    unreachable: bool,
}

/// Type checks a function body one instruction at a time with an operand
/// stack of [`MaybeValue`]s and a control stack of [`CtrlFrame`]s.
///
/// Also tracks the deepest operand stack the body can reach, which the
/// interpreter reserves on function entry.
pub struct CodeValidator<'a> {
    module: &'a ParsedModule,
    locals: Vec<ValueType>,
    vals: Vec<MaybeValue>,
    ctrls: Vec<CtrlFrame>,
    max_height: usize,
}

impl<'a> CodeValidator<'a> {
    pub fn new(
        module: &'a ParsedModule,
        function_type: &FunctionType,
        locals: impl Iterator<Item = ValueType>,
    ) -> CodeValidator<'a> {
        let mut all_locals = function_type.parameters.clone();
        all_locals.extend(locals);

        let mut v = CodeValidator {
            module,
            locals: all_locals,
            vals: vec![],
            ctrls: vec![],
            max_height: 0,
        };

        // parameters live in locals, not on the operand stack
        v.push_ctrl(FrameKind::Function, vec![], function_type.return_types.clone());
        v
    }

    /// Completes validation and returns the maximum operand stack height
    pub fn finish(self) -> Result<u32, ValidationError> {
        if !self.ctrls.is_empty() {
            return Err(ValidationError::MissingEnd);
        }
        Ok(self.max_height as u32)
    }

    fn push_val(&mut self, val: MaybeValue) {
        self.vals.push(val);
        if self.vals.len() > self.max_height {
            self.max_height = self.vals.len();
        }
    }

    fn push_vals(&mut self, types: &[ValueType]) {
        for t in types {
            self.push_val(Val(*t));
        }
    }

    fn pop_val(&mut self) -> Result<MaybeValue, ValidationError> {
        let frame = self.ctrls.last().ok_or(ValidationError::TypeMismatch)?;
        if self.vals.len() == frame.height {
            return if frame.unreachable {
                Ok(Unknown)
            } else {
                Err(ValidationError::TypeMismatch)
            };
        }
        self.vals.pop().ok_or(ValidationError::TypeMismatch)
    }

    fn pop_expected(&mut self, expected: ValueType) -> Result<MaybeValue, ValidationError> {
        let actual = self.pop_val()?;
        if !actual.matches(&Val(expected)) {
            return Err(ValidationError::TypeMismatch);
        }
        Ok(actual)
    }

    fn pop_expecteds(&mut self, types: &[ValueType]) -> Result<(), ValidationError> {
        for t in types.iter().rev() {
            self.pop_expected(*t)?;
        }
        Ok(())
    }

    fn push_ctrl(&mut self, kind: FrameKind, start_types: Vec<ValueType>, end_types: Vec<ValueType>) {
        let height = self.vals.len();
        self.push_vals(&start_types);
        self.ctrls.push(CtrlFrame {
            kind,
            start_types,
            end_types,
            height,
            unreachable: false,
        });
    }

    fn pop_ctrl(&mut self) -> Result<CtrlFrame, ValidationError> {
        let end_types = match self.ctrls.last() {
            Some(frame) => frame.end_types.clone(),
            None => return Err(ValidationError::OperatorsAfterEnd),
        };
        self.pop_expecteds(&end_types)?;
        let frame = self.ctrls.pop().ok_or(ValidationError::OperatorsAfterEnd)?;
        if self.vals.len() != frame.height {
            return Err(ValidationError::TypeMismatch);
        }
        Ok(frame)
    }

    fn label_types(&self, depth: u32) -> Result<Vec<ValueType>, ValidationError> {
        let len = self.ctrls.len();
        if depth as usize >= len {
            return Err(ValidationError::UnknownLabel(depth));
        }
        let frame = &self.ctrls[len - 1 - depth as usize];
        Ok(if frame.kind == FrameKind::Loop {
            frame.start_types.clone()
        } else {
            frame.end_types.clone()
        })
    }

    fn unreachable(&mut self) {
        if let Some(frame) = self.ctrls.last_mut() {
            self.vals.truncate(frame.height);
            frame.unreachable = true;
        }
    }

    fn block_signature(&self, block_type: BlockType) -> Result<(Vec<ValueType>, Vec<ValueType>), ValidationError> {
        match block_type {
            BlockType::Empty => Ok((vec![], vec![])),
            BlockType::Value(t) => Ok((vec![], vec![t])),
            BlockType::FuncType(idx) => self
                .module
                .types
                .get(idx as usize)
                .map(|ft| (ft.parameters.clone(), ft.return_types.clone()))
                .ok_or(ValidationError::UnknownType(idx)),
        }
    }

    fn local_type(&self, idx: u32) -> Result<ValueType, ValidationError> {
        self.locals
            .get(idx as usize)
            .copied()
            .ok_or(ValidationError::UnknownLocal(idx))
    }

    fn check_memory(&self, memarg: Option<(&MemArg, u32)>) -> Result<(), ValidationError> {
        if self.module.memory_limits().is_none() {
            return Err(ValidationError::UnknownMemory);
        }
        if let Some((memarg, width)) = memarg {
            if memarg.align >= 32 || (1u32 << memarg.align) > width {
                return Err(ValidationError::BadAlignment);
            }
        }
        Ok(())
    }

    pub fn validate(&mut self, inst: &Instruction) -> Result<(), ValidationError> {
        if self.ctrls.is_empty() {
            return Err(ValidationError::OperatorsAfterEnd);
        }

        use Instruction::*;
        match inst {
            Unreachable => self.unreachable(),
            Nop => {}
            Block { block_type, .. } | Loop { block_type } => {
                let (params, results) = self.block_signature(*block_type)?;
                self.pop_expecteds(&params)?;
                let kind = if matches!(inst, Loop { .. }) {
                    FrameKind::Loop
                } else {
                    FrameKind::Block
                };
                self.push_ctrl(kind, params, results);
            }
            If { block_type, .. } => {
                let (params, results) = self.block_signature(*block_type)?;
                self.pop_expected(ValueType::I32)?;
                self.pop_expecteds(&params)?;
                self.push_ctrl(FrameKind::If, params, results);
            }
            Else { .. } => {
                if self.ctrls.last().map(|f| f.kind) != Some(FrameKind::If) {
                    return Err(ValidationError::ElseWithoutIf);
                }
                let frame = self.pop_ctrl()?;
                self.push_ctrl(FrameKind::Else, frame.start_types, frame.end_types);
            }
            End => {
                let frame = self.pop_ctrl()?;
                // an if without else passes its parameters through unchanged
                if frame.kind == FrameKind::If && frame.start_types != frame.end_types {
                    return Err(ValidationError::TypeMismatch);
                }
                self.push_vals(&frame.end_types);
            }
            Br(depth) => {
                let types = self.label_types(*depth)?;
                self.pop_expecteds(&types)?;
                self.unreachable();
            }
            BrIf(depth) => {
                self.pop_expected(ValueType::I32)?;
                let types = self.label_types(*depth)?;
                self.pop_expecteds(&types)?;
                self.push_vals(&types);
            }
            BrTable { labels, default } => {
                self.pop_expected(ValueType::I32)?;
                let default_types = self.label_types(*default)?;
                for label in labels.iter() {
                    let types = self.label_types(*label)?;
                    if types.len() != default_types.len() {
                        return Err(ValidationError::TypeMismatch);
                    }
                    // check without consuming: pop then restore what was there
                    let mut popped = Vec::with_capacity(types.len());
                    for t in types.iter().rev() {
                        popped.push(self.pop_expected(*t)?);
                    }
                    for v in popped.into_iter().rev() {
                        self.push_val(v);
                    }
                }
                self.pop_expecteds(&default_types)?;
                self.unreachable();
            }
            Return => {
                let types = self.ctrls[0].end_types.clone();
                self.pop_expecteds(&types)?;
                self.unreachable();
            }
            Call(func_idx) => {
                let ft = self
                    .module
                    .function_type(*func_idx)
                    .ok_or(ValidationError::UnknownFunction(*func_idx))?;
                self.pop_expecteds(&ft.parameters)?;
                self.push_vals(&ft.return_types);
            }
            CallIndirect { type_index, table_index } => {
                if *table_index != 0 || !self.module.has_table() {
                    return Err(ValidationError::UnknownTable(*table_index));
                }
                let ft = self
                    .module
                    .types
                    .get(*type_index as usize)
                    .ok_or(ValidationError::UnknownType(*type_index))?;
                self.pop_expected(ValueType::I32)?;
                self.pop_expecteds(&ft.parameters)?;
                self.push_vals(&ft.return_types);
            }
            Drop => {
                self.pop_val()?;
            }
            Select => {
                self.pop_expected(ValueType::I32)?;
                let t1 = self.pop_val()?;
                let t2 = self.pop_val()?;
                if !t1.matches(&t2) {
                    return Err(ValidationError::TypeMismatch);
                }
                self.push_val(if t1 == Unknown { t2 } else { t1 });
            }
            LocalGet(idx) => {
                let t = self.local_type(*idx)?;
                self.push_val(Val(t));
            }
            LocalSet(idx) => {
                let t = self.local_type(*idx)?;
                self.pop_expected(t)?;
            }
            LocalTee(idx) => {
                let t = self.local_type(*idx)?;
                self.pop_expected(t)?;
                self.push_val(Val(t));
            }
            GlobalGet(idx) => {
                let gt = self
                    .module
                    .global_type(*idx)
                    .ok_or(ValidationError::UnknownGlobal(*idx))?;
                self.push_val(Val(gt.value_type));
            }
            GlobalSet(idx) => {
                let gt = self
                    .module
                    .global_type(*idx)
                    .ok_or(ValidationError::UnknownGlobal(*idx))?;
                if !gt.mutable {
                    return Err(ValidationError::ImmutableGlobal);
                }
                self.pop_expected(gt.value_type)?;
            }
            Load(op, memarg) => {
                self.check_memory(Some((memarg, op.width())))?;
                self.pop_expected(ValueType::I32)?;
                self.push_val(Val(op.value_type()));
            }
            Store(op, memarg) => {
                self.check_memory(Some((memarg, op.width())))?;
                self.pop_expected(op.value_type())?;
                self.pop_expected(ValueType::I32)?;
            }
            MemorySize => {
                self.check_memory(None)?;
                self.push_val(Val(ValueType::I32));
            }
            MemoryGrow => {
                self.check_memory(None)?;
                self.pop_expected(ValueType::I32)?;
                self.push_val(Val(ValueType::I32));
            }
            I32Const(_) => self.push_val(Val(ValueType::I32)),
            I64Const(_) => self.push_val(Val(ValueType::I64)),
            F32Const(_) => self.push_val(Val(ValueType::F32)),
            F64Const(_) => self.push_val(Val(ValueType::F64)),
            Numeric(op) => {
                let (inputs, output) = op.signature();
                self.pop_expecteds(inputs)?;
                self.push_val(Val(output));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::instruction::{LoadOp, NumericOp};
    use crate::parser::module::Limits;
    use Instruction::*;
    use ValueType::*;

    fn validate(module: &ParsedModule, ft: &FunctionType, code: &[Instruction]) -> Result<u32, ValidationError> {
        let mut v = CodeValidator::new(module, ft, std::iter::empty());
        for inst in code {
            v.validate(inst)?;
        }
        v.finish()
    }

    fn block(bt: BlockType) -> Instruction {
        Block { block_type: bt, end: 0 }
    }

    #[test]
    fn test_add_validates_with_height() {
        let module = ParsedModule::default();
        let ft = FunctionType::new(&[I32, I32], &[I32]);
        let height = validate(
            &module,
            &ft,
            &[LocalGet(0), LocalGet(1), Numeric(NumericOp::I32Add), End],
        )
        .unwrap();
        assert_eq!(height, 2);
    }

    #[test]
    fn test_result_arity_enforced() {
        let module = ParsedModule::default();
        let ft = FunctionType::new(&[], &[I32]);
        assert_eq!(validate(&module, &ft, &[End]), Err(ValidationError::TypeMismatch));
        assert_eq!(
            validate(&module, &ft, &[I32Const(1), I32Const(2), End]),
            Err(ValidationError::TypeMismatch)
        );
        assert_eq!(
            validate(&module, &ft, &[I64Const(1), End]),
            Err(ValidationError::TypeMismatch)
        );
    }

    #[test]
    fn test_unreachable_is_polymorphic() {
        let module = ParsedModule::default();
        let ft = FunctionType::new(&[], &[I32]);
        assert!(validate(&module, &ft, &[Unreachable, Numeric(NumericOp::I32Add), End]).is_ok());
        assert!(validate(&module, &ft, &[I32Const(1), Br(0), Numeric(NumericOp::I64Add), End]).is_err());
        assert!(validate(&module, &ft, &[I32Const(1), Br(0), Drop, End]).is_ok());
    }

    #[test]
    fn test_nesting_errors() {
        let module = ParsedModule::default();
        let ft = FunctionType::default();
        assert_eq!(
            validate(&module, &ft, &[block(BlockType::Empty), End]),
            Err(ValidationError::MissingEnd)
        );
        assert_eq!(
            validate(&module, &ft, &[End, Nop]),
            Err(ValidationError::OperatorsAfterEnd)
        );
        assert_eq!(
            validate(&module, &ft, &[Else { end: 0 }, End]),
            Err(ValidationError::ElseWithoutIf)
        );
        assert_eq!(validate(&module, &ft, &[Br(1), End]), Err(ValidationError::UnknownLabel(1)));
    }

    #[test]
    fn test_if_without_else_must_balance() {
        let module = ParsedModule::default();
        let ft = FunctionType::new(&[], &[I32]);
        let if_i32 = If {
            block_type: BlockType::Value(I32),
            else_pc: 0,
            end: 0,
        };
        assert_eq!(
            validate(&module, &ft, &[I32Const(1), if_i32.clone(), I32Const(2), End, End]),
            Err(ValidationError::TypeMismatch)
        );
        assert!(validate(
            &module,
            &ft,
            &[I32Const(1), if_i32, I32Const(2), Else { end: 0 }, I32Const(3), End, End]
        )
        .is_ok());
    }

    #[test]
    fn test_memory_access_requires_memory() {
        let mut module = ParsedModule::default();
        let ft = FunctionType::new(&[], &[I32]);
        let load = Load(LoadOp::I32Load, MemArg { align: 2, offset: 0 });
        let code = [I32Const(0), load, End];
        assert_eq!(validate(&module, &ft, &code), Err(ValidationError::UnknownMemory));

        module.memories.push(Limits { min: 1, max: None });
        assert!(validate(&module, &ft, &code).is_ok());

        let misaligned = Load(LoadOp::I32Load, MemArg { align: 3, offset: 0 });
        assert_eq!(
            validate(&module, &ft, &[I32Const(0), misaligned, End]),
            Err(ValidationError::BadAlignment)
        );
    }

    #[test]
    fn test_loop_label_uses_params() {
        let mut module = ParsedModule::default();
        module.types.push(FunctionType::new(&[I32], &[I32]));
        let ft = FunctionType::new(&[], &[I32]);
        let code = [
            I32Const(10),
            Loop {
                block_type: BlockType::FuncType(0),
            },
            I32Const(1),
            Numeric(NumericOp::I32Sub),
            LocalTee(0),
            LocalGet(0),
            BrIf(0),
            End,
            End,
        ];
        // local 0 doesn't exist for this function type
        assert_eq!(validate(&module, &ft, &code), Err(ValidationError::UnknownLocal(0)));

        let mut v = CodeValidator::new(&module, &ft, std::iter::once(I32));
        for inst in &code {
            v.validate(inst).unwrap();
        }
        assert_eq!(v.finish().unwrap(), 2);
    }
}
