//! WebAssembly linear memory
//!
//! All access is bounds-checked before touching the underlying bytes; an
//! out-of-range access is a trap, never a partial read or write.
//!
//! - Page size: 64 KiB
//! - Address space: 32-bit, effective addresses computed in 64 bits so that
//!   `addr + offset` cannot wrap

use super::Trap;

/// WebAssembly page size in bytes (64KB)
pub const PAGE_SIZE: usize = 65536;

/// Maximum number of pages (2^16 = 64K pages = 4GB total)
pub const MAX_PAGES: u32 = 65536;

#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
    current_pages: u32,
    /// Effective maximum: the declared maximum capped by runtime config
    max_pages: u32,
}

impl Memory {
    /// Create a zeroed memory, or `None` when the host cannot allocate it.
    /// The caller has already checked `initial_pages <= max_pages <= MAX_PAGES`.
    pub fn try_new(initial_pages: u32, max_pages: u32) -> Option<Self> {
        debug_assert!(initial_pages <= max_pages && max_pages <= MAX_PAGES);
        let bytes = initial_pages as usize * PAGE_SIZE;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes).ok()?;
        data.resize(bytes, 0);
        Some(Memory {
            data,
            current_pages: initial_pages,
            max_pages,
        })
    }

    #[cfg(test)]
    pub fn new(initial_pages: u32, max_pages: u32) -> Self {
        Self::try_new(initial_pages, max_pages).unwrap()
    }

    /// Current size in pages
    pub fn size(&self) -> u32 {
        self.current_pages
    }

    /// Current size in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Grow by `delta_pages`, returning the previous size in pages.
    ///
    /// Returns `None` with no change when the new size would exceed the
    /// maximum or the host cannot allocate it.
    pub fn grow(&mut self, delta_pages: u32) -> Option<u32> {
        let current = self.current_pages;
        let new_pages = current.checked_add(delta_pages)?;
        if new_pages > self.max_pages {
            return None;
        }

        let new_bytes = new_pages as usize * PAGE_SIZE;
        self.data.try_reserve(new_bytes - self.data.len()).ok()?;
        self.data.resize(new_bytes, 0);
        self.current_pages = new_pages;
        Some(current)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Resolve an access of `size` bytes at `addr + offset`
    #[inline]
    fn range(&self, addr: u32, offset: u32, size: usize) -> Result<std::ops::Range<usize>, Trap> {
        let start = addr as u64 + offset as u64;
        let end = start + size as u64;
        if end > self.data.len() as u64 {
            return Err(Trap::OutOfBoundsMemory);
        }
        Ok(start as usize..end as usize)
    }

    pub fn read_bytes(&self, addr: u32, len: usize) -> Result<&[u8], Trap> {
        let range = self.range(addr, 0, len)?;
        Ok(&self.data[range])
    }

    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Trap> {
        let range = self.range(addr, 0, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Little-endian load of `N` bytes at `addr + offset`
    #[inline]
    pub fn load<const N: usize>(&self, addr: u32, offset: u32) -> Result<[u8; N], Trap> {
        let range = self.range(addr, offset, N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.data[range]);
        Ok(buf)
    }

    #[inline]
    pub fn store<const N: usize>(&mut self, addr: u32, offset: u32, bytes: [u8; N]) -> Result<(), Trap> {
        let range = self.range(addr, offset, N)?;
        self.data[range].copy_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_memory_is_zeroed() {
        let mem = Memory::try_new(2, 4).unwrap();
        assert_eq!(mem.size(), 2);
        assert_eq!(mem.max_pages(), 4);
        assert_eq!(mem.size_bytes(), 2 * PAGE_SIZE);
        assert!(mem.data().iter().all(|b| *b == 0));

        let empty = Memory::try_new(0, 0).unwrap();
        assert_eq!(empty.size_bytes(), 0);
    }

    #[test]
    fn test_grow() {
        let mut mem = Memory::new(1, 3);
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.size_bytes(), 2 * PAGE_SIZE);
        assert_eq!(mem.grow(2), None);
        assert_eq!(mem.size(), 2);
        assert_eq!(mem.grow(0), Some(2));
        assert_eq!(mem.grow(u32::MAX), None);
    }

    #[test]
    fn test_bounds() {
        let mut mem = Memory::new(1, 1);
        let last = PAGE_SIZE as u32 - 4;
        mem.store(last, 0, 7u32.to_le_bytes()).unwrap();
        assert_eq!(u32::from_le_bytes(mem.load(last, 0).unwrap()), 7);
        assert_eq!(mem.load::<4>(last, 1), Err(Trap::OutOfBoundsMemory));
        assert_eq!(mem.load::<1>(u32::MAX, u32::MAX), Err(Trap::OutOfBoundsMemory));
        assert_eq!(mem.store(PAGE_SIZE as u32, 0, [1u8]), Err(Trap::OutOfBoundsMemory));
        assert!(mem.write_bytes(last, &[1, 2, 3, 4, 5]).is_err());
        assert_eq!(mem.data()[last as usize], 7);
    }

    #[test]
    fn test_zero_page_memory() {
        let mut mem = Memory::new(0, 1);
        assert_eq!(mem.read_bytes(0, 0).unwrap(), &[] as &[u8]);
        assert!(mem.load::<1>(0, 0).is_err());
        assert_eq!(mem.grow(1), Some(0));
        assert!(mem.load::<1>(0, 0).is_ok());
    }
}
