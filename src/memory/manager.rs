use super::bank::BankAllocator;
use super::MemoryBank;

/// All banks of one device, allocated independently.
///
/// Callers select a bank by index through an allocation flag. The system
/// linker does not run under emulation, so an out-of-range bank index is
/// redirected to bank 0 rather than rejected.
#[derive(Debug)]
pub struct DeviceMemory {
    banks: Vec<BankAllocator>,
}

impl DeviceMemory {
    /// `banks` must be non-empty and each bank non-zero sized.
    #[must_use]
    pub fn new(banks: &[MemoryBank]) -> Self {
        debug_assert!(!banks.is_empty(), "a device needs at least one bank");
        Self {
            banks: banks.iter().map(|b| BankAllocator::new(*b)).collect(),
        }
    }

    /// Reserve `size` bytes in the selected bank. Returns the device base
    /// address, or `None` when the bank has no hole large enough.
    pub fn alloc(&mut self, bank: u32, size: u64) -> Option<u64> {
        let idx = if (bank as usize) < self.banks.len() {
            bank as usize
        } else {
            0
        };
        self.banks[idx].alloc(size)
    }

    /// Release a prior allocation; routed to whichever bank contains `addr`.
    pub fn free(&mut self, addr: u64) {
        match self.banks.iter_mut().find(|b| b.contains(addr)) {
            Some(bank) => bank.free(addr),
            None => log::error!("free of address {addr:#x} outside all banks"),
        }
    }

    /// Bytes free across all banks.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.banks.iter().map(BankAllocator::available).sum()
    }

    /// Total bytes across all banks.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.banks.iter().map(BankAllocator::capacity).sum()
    }

    #[must_use]
    pub fn bank_count(&self) -> u32 {
        self.banks.len() as u32
    }

    /// Free bytes of the selected bank, for out-of-memory diagnostics.
    #[must_use]
    pub fn bank_available(&self, bank: u32) -> u64 {
        let idx = if (bank as usize) < self.banks.len() {
            bank as usize
        } else {
            0
        };
        self.banks[idx].available()
    }
}
