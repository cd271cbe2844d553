//! Host functions
//!
//! A host function is bound to a function import and invoked by the
//! interpreter with the import's declared parameter values. It sees the
//! runtime's memory and user data through a [`HostContext`]; the runtime is
//! busy for the duration of the call, so the context is the only way back in.

use std::any::Any;

use super::memory::Memory;
use super::{Trap, Value};

/// Callback bound to a function import
pub trait HostFunction: Send + Sync {
    fn call(&self, ctx: &mut HostContext<'_>, args: &[Value]) -> Result<Vec<Value>, Trap>;
}

impl<F> HostFunction for F
where
    F: Fn(&mut HostContext<'_>, &[Value]) -> Result<Vec<Value>, Trap> + Send + Sync,
{
    fn call(&self, ctx: &mut HostContext<'_>, args: &[Value]) -> Result<Vec<Value>, Trap> {
        self(ctx, args)
    }
}

pub struct HostContext<'a> {
    memory: Option<&'a mut Memory>,
    user_data: Option<&'a (dyn Any + Send + Sync)>,
}

impl<'a> HostContext<'a> {
    pub(crate) fn new(memory: Option<&'a mut Memory>, user_data: Option<&'a (dyn Any + Send + Sync)>) -> Self {
        HostContext { memory, user_data }
    }

    /// Memory bytes; empty when the runtime has no memory yet
    pub fn memory(&self) -> &[u8] {
        self.memory.as_deref().map(Memory::data).unwrap_or(&[])
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        match self.memory.as_deref_mut() {
            Some(mem) => mem.data_mut(),
            None => &mut [],
        }
    }

    pub fn read_bytes(&self, addr: u32, len: usize) -> Result<&[u8], Trap> {
        self.memory
            .as_deref()
            .ok_or(Trap::OutOfBoundsMemory)?
            .read_bytes(addr, len)
    }

    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Trap> {
        self.memory
            .as_deref_mut()
            .ok_or(Trap::OutOfBoundsMemory)?
            .write_bytes(addr, bytes)
    }

    /// Runtime user data, if set and of type `T`
    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.and_then(|data| data.downcast_ref::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_as_host_function() {
        let double = |_: &mut HostContext<'_>, args: &[Value]| -> Result<Vec<Value>, Trap> {
            let v = args[0].as_i32().ok_or(Trap::Host("expected i32".into()))?;
            Ok(vec![Value::I32(v * 2)])
        };
        let mut ctx = HostContext::new(None, None);
        assert_eq!(double.call(&mut ctx, &[Value::I32(21)]), Ok(vec![Value::I32(42)]));
        assert!(ctx.memory().is_empty());
        assert!(ctx.memory_mut().is_empty());
        assert_eq!(ctx.read_bytes(0, 1), Err(Trap::OutOfBoundsMemory));
    }

    #[test]
    fn test_context_memory_and_user_data() {
        let mut mem = Memory::new(1, 1);
        let data: u64 = 7;
        let mut ctx = HostContext::new(Some(&mut mem), Some(&data));
        ctx.write_bytes(4, b"hi").unwrap();
        assert_eq!(ctx.read_bytes(4, 2).unwrap(), b"hi");
        assert_eq!(ctx.memory()[5], b'i');
        assert_eq!(ctx.user_data::<u64>(), Some(&7));
        assert_eq!(ctx.user_data::<u32>(), None);
    }
}
