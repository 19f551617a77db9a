pub mod bank;
pub mod manager;

/// One contiguous device address range `[base, base + size)`.
///
/// Banks are fixed at device-open time from the configuration list and
/// live for the lifetime of the device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBank {
    pub base: u64,
    pub size: u64,
}

impl MemoryBank {
    /// `size` must be greater than zero.
    #[must_use]
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }
}

// Re-export the main types for easy access
pub use bank::BankAllocator;
pub use manager::DeviceMemory;
