//! Function reference tables
//!
//! Tables hold runtime function addresses for `call_indirect`. Slots start
//! out empty; element segments fill them at load time.

use super::store::FuncAddr;
use super::Trap;
use crate::parser::module::Limits;

#[derive(Debug, Clone)]
pub struct Table {
    elements: Vec<Option<FuncAddr>>,
    limits: Limits,
}

impl Table {
    pub fn new(limits: Limits) -> Self {
        Table {
            elements: vec![None; limits.min as usize],
            limits,
        }
    }

    pub fn size(&self) -> u32 {
        self.elements.len() as u32
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Look up a slot for an indirect call
    pub fn get(&self, index: u32) -> Result<FuncAddr, Trap> {
        match self.elements.get(index as usize) {
            None => Err(Trap::UndefinedElement),
            Some(None) => Err(Trap::UninitializedElement),
            Some(Some(addr)) => Ok(*addr),
        }
    }

    /// Whether `len` slots starting at `offset` are inside the table
    pub fn fits(&self, offset: u32, len: usize) -> bool {
        offset as u64 + len as u64 <= self.elements.len() as u64
    }

    /// Write a run of function addresses starting at `offset`
    pub fn init(&mut self, offset: u32, funcs: &[FuncAddr]) -> Result<(), Trap> {
        if !self.fits(offset, funcs.len()) {
            return Err(Trap::UndefinedElement);
        }
        for (slot, addr) in self.elements[offset as usize..].iter_mut().zip(funcs) {
            *slot = Some(*addr);
        }
        Ok(())
    }
}
