use crate::bufmgr::bo::BufferObject;
use crate::error::{BufmgrError, BufmgrResult};
use crate::utils::align_up;

/// Minimum alignment of pinned addresses.
pub const SOFTPIN_ALIGN: u64 = 64 * 1024;
/// Alignment used when the manager is configured for 1 MiB pinning.
pub const SOFTPIN_ALIGN_1M: u64 = 1024 * 1024;
/// Pinned allocations must end below this address.
pub const ADDRESS_CEILING: u64 = 1 << 48;
/// First pinned address; keeps the zero page unused.
pub const PINNED_BASE: u64 = 0x1_0000;

/// Hands out monotonically increasing GPU addresses for pinned objects.
///
/// Addresses are never reclaimed: an object keeps its address for its lifetime and the
/// range is not reused after it is freed.
#[derive(Debug)]
pub struct PinnedAddressAllocator {
    cursor: u64,
    last_size: u64,
}

impl PinnedAddressAllocator {
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self {
            cursor: base,
            last_size: 0,
        }
    }

    /// Reserves `size` bytes at the next address aligned to `alignment` (at least 64 KiB).
    ///
    /// # Errors
    /// `AddressSpaceExhausted` if the range would reach the 48-bit ceiling or the alignment
    /// has no power of two; the allocator is left unchanged.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> BufmgrResult<u64> {
        let align = alignment
            .max(SOFTPIN_ALIGN)
            .checked_next_power_of_two()
            .ok_or(BufmgrError::AddressSpaceExhausted)?;
        let next = self
            .cursor
            .checked_add(align_up(self.last_size, SOFTPIN_ALIGN))
            .ok_or(BufmgrError::AddressSpaceExhausted)?;
        let addr = next
            .checked_add(align - 1)
            .map(|v| v & !(align - 1))
            .ok_or(BufmgrError::AddressSpaceExhausted)?;

        match addr.checked_add(size) {
            Some(end) if end < ADDRESS_CEILING => {}
            _ => return Err(BufmgrError::AddressSpaceExhausted),
        }

        self.cursor = addr;
        self.last_size = size;
        Ok(addr)
    }

    /// Next address the allocator would consider, before alignment.
    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }
}

impl Default for PinnedAddressAllocator {
    fn default() -> Self {
        Self::new(PINNED_BASE)
    }
}

impl BufferObject {
    /// Gives the object a fixed GPU address from the manager's pinned allocator.
    ///
    /// Pinning an already pinned object returns its existing address.
    ///
    /// # Errors
    /// `AddressSpaceExhausted` once the 48-bit range is used up.
    pub fn set_softpin(&self) -> BufmgrResult<u64> {
        let mut state = self.mgr.lock();
        let entry = &state.arena[self.id];
        if entry.softpin {
            return Ok(entry.offset);
        }

        let alignment = if self.mgr.config.softpin_1m_align {
            SOFTPIN_ALIGN_1M
        } else {
            SOFTPIN_ALIGN
        };
        let size = entry.size;
        let offset = state.pinned.allocate(size, alignment)?;

        let entry = &mut state.arena[self.id];
        entry.softpin = true;
        entry.use_48b = true;
        entry.offset = offset;
        log::debug!("bo {} pinned at {offset:#x}", entry.handle);
        Ok(offset)
    }

    /// Pins the object at a caller-chosen address.
    pub fn set_softpin_offset(&self, offset: u64) {
        let mut state = self.mgr.lock();
        let entry = &mut state.arena[self.id];
        entry.softpin = true;
        entry.use_48b = true;
        entry.offset = offset;
    }

    #[must_use]
    pub fn is_softpin(&self) -> bool {
        self.mgr.lock().arena[self.id].softpin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_monotonic_and_spaced() {
        let mut alloc = PinnedAddressAllocator::default();
        let sizes = [4096, 100_000, 64 * 1024, 1, 3 * 1024 * 1024];
        let mut prev: Option<(u64, u64)> = None;

        for size in sizes {
            let addr = alloc.allocate(size, 0).unwrap();
            assert_eq!(addr % SOFTPIN_ALIGN, 0);
            if let Some((prev_addr, prev_size)) = prev {
                assert!(addr >= prev_addr + align_up(prev_size, SOFTPIN_ALIGN));
            }
            prev = Some((addr, size));
        }
    }

    #[test]
    fn first_address_is_base() {
        let mut alloc = PinnedAddressAllocator::default();
        assert_eq!(alloc.allocate(4096, 0).unwrap(), PINNED_BASE);
    }

    #[test]
    fn honours_larger_alignment() {
        let mut alloc = PinnedAddressAllocator::default();
        alloc.allocate(4096, 0).unwrap();
        let addr = alloc.allocate(4096, SOFTPIN_ALIGN_1M).unwrap();
        assert_eq!(addr % SOFTPIN_ALIGN_1M, 0);
    }

    #[test]
    fn rejects_past_ceiling_without_moving() {
        let mut alloc = PinnedAddressAllocator::new(ADDRESS_CEILING - 2 * SOFTPIN_ALIGN);
        let before = alloc.cursor();
        assert!(matches!(
            alloc.allocate(4 * SOFTPIN_ALIGN, 0),
            Err(BufmgrError::AddressSpaceExhausted)
        ));
        assert_eq!(alloc.cursor(), before);

        let addr = alloc.allocate(SOFTPIN_ALIGN, 0).unwrap();
        assert!(addr + SOFTPIN_ALIGN < ADDRESS_CEILING);
    }

    #[test]
    fn oversized_alignment_is_refused() {
        let mut alloc = PinnedAddressAllocator::default();
        let before = alloc.cursor();
        assert!(matches!(
            alloc.allocate(4096, (1 << 63) + 1),
            Err(BufmgrError::AddressSpaceExhausted)
        ));
        assert!(matches!(
            alloc.allocate(4096, u64::MAX),
            Err(BufmgrError::AddressSpaceExhausted)
        ));
        assert_eq!(alloc.cursor(), before);
        assert_eq!(alloc.allocate(4096, 0).unwrap(), PINNED_BASE);
    }
}
