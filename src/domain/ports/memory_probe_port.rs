//! System memory probe port definition.

/// Reports physical memory figures used to size frame caches.
pub trait MemoryProbe: Send + Sync {
    /// Total physical memory in bytes, if it can be determined.
    fn total_memory(&self) -> Option<u64>;

    /// Currently free physical memory in bytes, if it can be determined.
    fn free_memory(&self) -> Option<u64>;
}

#[cfg(test)]
pub mod mock {
    use super::*;

    /// Probe reporting fixed figures.
    pub struct FixedMemory {
        pub total: Option<u64>,
        pub free: Option<u64>,
    }

    impl FixedMemory {
        pub fn new(total: u64, free: u64) -> Self {
            Self {
                total: Some(total),
                free: Some(free),
            }
        }

        /// Probe that cannot read anything.
        pub fn unknown() -> Self {
            Self {
                total: None,
                free: None,
            }
        }
    }

    impl MemoryProbe for FixedMemory {
        fn total_memory(&self) -> Option<u64> {
            self.total
        }

        fn free_memory(&self) -> Option<u64> {
            self.free
        }
    }
}
