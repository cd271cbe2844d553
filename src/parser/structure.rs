//! Branch target resolution for flat instruction streams
//!
//! WebAssembly's control instructions form a tree but are encoded as a flat
//! sequence. Rather than rebuilding the tree, the control map records, for
//! every `block`/`if`/`else`, the index of its matching `else` and `end` as
//! the body is decoded. The interpreter then jumps directly to those indices.
//!
//! Nesting errors are reported by the validator, which sees each instruction
//! first; the map only has to track open constructs.

use super::instruction::Instruction;

pub struct ControlMap {
    /// Indices of currently open block/loop/if instructions
    open: Vec<usize>,
    code: Vec<Instruction>,
    finished: bool,
}

impl Default for ControlMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlMap {
    pub fn new() -> Self {
        ControlMap {
            open: Vec::new(),
            code: Vec::new(),
            finished: false,
        }
    }

    /// Whether the `end` closing the function body has been seen
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, inst: Instruction) {
        let pc = self.code.len();
        match &inst {
            Instruction::Block { .. } | Instruction::Loop { .. } | Instruction::If { .. } => {
                self.open.push(pc);
            }
            Instruction::Else { .. } => {
                if let Some(&if_pc) = self.open.last() {
                    if let Instruction::If { else_pc, .. } = &mut self.code[if_pc] {
                        *else_pc = pc as u32;
                    }
                }
            }
            Instruction::End => match self.open.pop() {
                Some(start) => self.close(start, pc as u32),
                None => self.finished = true,
            },
            _ => {}
        }
        self.code.push(inst);
    }

    fn close(&mut self, start: usize, end_pc: u32) {
        match &mut self.code[start] {
            Instruction::Block { end, .. } => *end = end_pc,
            Instruction::If { else_pc, end, .. } => {
                *end = end_pc;
                if *else_pc == 0 {
                    *else_pc = end_pc;
                } else {
                    let else_at = *else_pc as usize;
                    if let Instruction::Else { end } = &mut self.code[else_at] {
                        *end = end_pc;
                    }
                }
            }
            _ => {}
        }
    }

    pub fn into_code(self) -> Vec<Instruction> {
        self.code
    }
}
