//! Physical memory figures from the operating system.

use crate::domain::ports::MemoryProbe;

/// Reads total and free physical memory from the OS. Platforms without an
/// implementation report nothing, which leaves frame budgets unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

impl SystemMemory {
    /// Creates the probe.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl MemoryProbe for SystemMemory {
    fn total_memory(&self) -> Option<u64> {
        platform::total_memory()
    }

    fn free_memory(&self) -> Option<u64> {
        platform::free_memory()
    }
}

#[cfg(target_os = "linux")]
mod platform {
    fn sysinfo() -> Option<libc::sysinfo> {
        let mut info = std::mem::MaybeUninit::<libc::sysinfo>::uninit();
        // SAFETY: sysinfo only writes into the provided struct.
        let rc = unsafe { libc::sysinfo(info.as_mut_ptr()) };
        if rc != 0 {
            return None;
        }
        // SAFETY: rc == 0 means the kernel filled the struct.
        Some(unsafe { info.assume_init() })
    }

    pub fn total_memory() -> Option<u64> {
        let info = sysinfo()?;
        Some(u64::from(info.totalram).saturating_mul(u64::from(info.mem_unit)))
    }

    pub fn free_memory() -> Option<u64> {
        let info = sysinfo()?;
        let pages = u64::from(info.freeram).saturating_add(u64::from(info.bufferram));
        Some(pages.saturating_mul(u64::from(info.mem_unit)))
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use std::ffi::CString;
    use std::mem::size_of;
    use std::ptr;

    fn sysctl<T: Default + Copy>(name: &str) -> Option<T> {
        let key = CString::new(name).ok()?;
        let mut value = T::default();
        let mut len = size_of::<T>();
        // SAFETY: value is a plain integer of the size passed in len.
        let rc = unsafe {
            libc::sysctlbyname(
                key.as_ptr(),
                (&raw mut value).cast::<libc::c_void>(),
                &mut len,
                ptr::null_mut(),
                0,
            )
        };
        (rc == 0 && len == size_of::<T>()).then_some(value)
    }

    pub fn total_memory() -> Option<u64> {
        sysctl::<u64>("hw.memsize")
    }

    pub fn free_memory() -> Option<u64> {
        let pages = sysctl::<u32>("vm.page_free_count")?;
        let page_size = sysctl::<u64>("hw.pagesize")
            .or_else(|| sysctl::<u32>("hw.pagesize").map(u64::from))?;
        Some(u64::from(pages).saturating_mul(page_size))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod platform {
    pub fn total_memory() -> Option<u64> {
        None
    }

    pub fn free_memory() -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn test_reports_plausible_figures() {
        let probe = SystemMemory::new();
        let total = probe.total_memory().unwrap();
        assert!(total > 0);
        if let Some(free) = probe.free_memory() {
            assert!(free <= total);
        }
    }
}
