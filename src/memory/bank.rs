use super::MemoryBank;
use crate::utils::align_up;
use std::collections::BTreeMap;

/// Allocation granularity. Everything is rounded up to a page because
/// downstream consumers (export-to-file, mmap) require page alignment.
pub const ALLOC_ALIGN: u64 = 4096;

/// First-fit allocator over one bank's address range.
///
/// Tracks occupied ranges as start address -> rounded size and scans for
/// holes between them on allocation.
#[derive(Debug)]
pub struct BankAllocator {
    base: u64,
    limit: u64,
    allocations: BTreeMap<u64, u64>,
    free_bytes: u64,
}

impl BankAllocator {
    #[must_use]
    pub fn new(bank: MemoryBank) -> Self {
        debug_assert!(bank.size > 0, "bank must have a non-zero size");
        Self {
            base: align_up(bank.base, ALLOC_ALIGN),
            limit: bank.base + bank.size,
            allocations: BTreeMap::new(),
            free_bytes: bank.base + bank.size - align_up(bank.base, ALLOC_ALIGN),
        }
    }

    /// Reserve `size` bytes, rounded up to [`ALLOC_ALIGN`]. A zero-size
    /// request is normalized to one alignment unit; nothing is ever
    /// allocated at literally zero length.
    ///
    /// Returns `None` when no contiguous hole is large enough. Callers
    /// must surface that as an out-of-memory condition, not retry.
    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        let request = align_up(size.max(1), ALLOC_ALIGN);

        let mut candidate = self.base;
        for (&start, &len) in &self.allocations {
            if start > candidate && start - candidate >= request {
                break;
            }
            candidate = start + len;
        }

        if candidate + request > self.limit {
            return None;
        }
        self.allocations.insert(candidate, request);
        self.free_bytes -= request;
        Some(candidate)
    }

    /// Release a prior allocation.
    ///
    /// `addr` must be an address previously returned by [`Self::alloc`]
    /// and not yet freed; passing anything else is a caller bug and is
    /// logged without touching allocator state.
    pub fn free(&mut self, addr: u64) {
        match self.allocations.remove(&addr) {
            Some(len) => self.free_bytes += len,
            None => log::error!("free of untracked device address {addr:#x}"),
        }
    }

    /// Bytes not currently reserved.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.free_bytes
    }

    /// Total managed bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.limit - self.base
    }

    /// Whether `addr` falls inside this bank's range.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.limit
    }

    /// The rounded size tracked for an allocation, if `addr` is live.
    #[must_use]
    pub fn allocation_size(&self, addr: u64) -> Option<u64> {
        self.allocations.get(&addr).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(size: u64) -> BankAllocator {
        BankAllocator::new(MemoryBank::new(0, size))
    }

    #[test]
    fn allocations_never_overlap() {
        let mut b = bank(64 * 4096);
        let mut got: Vec<(u64, u64)> = Vec::new();
        for sz in [1u64, 4096, 5000, 12288, 1] {
            let addr = b.alloc(sz).unwrap();
            let len = align_up(sz.max(1), ALLOC_ALIGN);
            for &(a, l) in &got {
                assert!(addr + len <= a || a + l <= addr, "overlap at {addr:#x}");
            }
            got.push((addr, len));
        }
    }

    #[test]
    fn balanced_alloc_free_restores_capacity() {
        let mut b = bank(16 * 4096);
        let cap = b.available();
        let a = b.alloc(4096).unwrap();
        let c = b.alloc(8192).unwrap();
        let d = b.alloc(1).unwrap();
        assert!(b.available() < cap);
        b.free(c);
        b.free(a);
        b.free(d);
        assert_eq!(b.available(), cap);
        assert_eq!(cap, b.capacity());
    }

    #[test]
    fn over_capacity_request_returns_none() {
        let mut b = bank(4 * 4096);
        assert!(b.alloc(5 * 4096).is_none());
        // Never partially succeeds: full capacity still available.
        assert_eq!(b.available(), 4 * 4096);
        assert!(b.alloc(4 * 4096).is_some());
        assert!(b.alloc(1).is_none());
    }

    #[test]
    fn zero_size_is_normalized_to_one_unit() {
        let mut b = bank(4 * 4096);
        let addr = b.alloc(0).unwrap();
        assert_eq!(b.allocation_size(addr), Some(ALLOC_ALIGN));
    }

    #[test]
    fn holes_are_reused_first_fit() {
        let mut b = bank(8 * 4096);
        let a = b.alloc(4096).unwrap();
        let c = b.alloc(4096).unwrap();
        let _d = b.alloc(4096).unwrap();
        b.free(a);
        b.free(c);
        // First fit lands in the lowest freed hole.
        assert_eq!(b.alloc(4096), Some(a));
        assert_eq!(b.alloc(4096), Some(c));
    }

    #[test]
    fn free_of_untracked_address_is_ignored() {
        let mut b = bank(4 * 4096);
        let before = b.available();
        b.free(0x1234_0000);
        assert_eq!(b.available(), before);
        assert!(b.alloc(4096).is_some());
    }

    #[test]
    fn unaligned_base_is_rounded_up() {
        let mut b = BankAllocator::new(MemoryBank::new(100, 3 * 4096));
        let addr = b.alloc(1).unwrap();
        assert_eq!(addr % ALLOC_ALIGN, 0);
        assert!(addr >= 100);
    }
}
