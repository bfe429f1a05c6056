//! Read-only access to captured stack memory.

use scroll::ctx::{SizeWith, TryFromCtx};
use scroll::Pread;

/// A range of memory captured from the crashed process, typically the
/// fragment of a thread's stack that made it into the snapshot.
///
/// Reads are bounds-checked against `[base_address, base_address + size)`
/// and are always little-endian.
#[derive(Debug, Clone, Copy)]
pub struct StackMemory<'a> {
    /// The starting address of this range of memory.
    pub base_address: u64,
    /// The length of this range of memory.
    pub size: u64,
    /// The contents of the memory.
    pub bytes: &'a [u8],
}

impl<'a> StackMemory<'a> {
    /// Create a `StackMemory` over `bytes` as captured from `base_address`.
    pub fn new(base_address: u64, bytes: &'a [u8]) -> StackMemory<'a> {
        StackMemory {
            base_address,
            size: bytes.len() as u64,
            bytes,
        }
    }

    /// Get `mem::size_of::<T>()` bytes of memory at `addr` as a `T`,
    /// or `None` if any part of the read falls outside this range.
    pub fn get_memory_at_address<T>(&self, addr: u64) -> Option<T>
    where
        T: TryFromCtx<'a, scroll::Endian, [u8], Error = scroll::Error> + SizeWith<scroll::Endian>,
    {
        let in_range = |a: u64| a >= self.base_address && a < self.base_address + self.size;
        let size = <T>::size_with(&scroll::LE) as u64;
        if size == 0 || !in_range(addr) || !in_range(addr + size - 1) {
            return None;
        }
        let start = (addr - self.base_address) as usize;
        self.bytes.pread_with::<T>(start, scroll::LE).ok()
    }

    /// The range of addresses this memory covers, or `None` for an empty
    /// or address-space-overflowing range.
    pub fn memory_range(&self) -> Option<std::ops::Range<u64>> {
        if self.size == 0 {
            return None;
        }
        let end = self.base_address.checked_add(self.size)?;
        Some(self.base_address..end)
    }
}
