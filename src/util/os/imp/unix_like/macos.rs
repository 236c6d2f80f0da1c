use crate::util::address::Address;
use crate::util::os::imp::unix_like::unix_common;
use crate::util::os::*;
use std::io::Result;

/// MacOS implementation of the `OS` trait.
pub struct MacOS;

impl OSMemory for MacOS {
    fn dzmmap(
        start: Address,
        size: usize,
        strategy: MmapStrategy,
        _annotation: &MmapAnnotation<'_>,
    ) -> Result<Address> {
        let addr = unix_common::mmap(start, size, strategy)?;

        // Annotation is ignored on macOS. Huge pages are ignored on macOS.

        // Zero memory if we actually reserve the memory.
        if strategy.reserve {
            crate::util::memory::zero(start, size);
        }
        Ok(addr)
    }

    fn mmap_anywhere(size: usize, _annotation: &MmapAnnotation<'_>) -> Result<Address> {
        let addr = unix_common::mmap_anywhere(size, MmapProtection::ReadWrite)?;
        crate::util::memory::zero(addr, size);
        Ok(addr)
    }

    fn munmap(start: Address, size: usize) -> Result<()> {
        unix_common::munmap(start, size)
    }

    fn mprotect(start: Address, size: usize) -> Result<()> {
        unix_common::mprotect(start, size)
    }

    fn munprotect(start: Address, size: usize, prot: MmapProtection) -> Result<()> {
        unix_common::munprotect(start, size, prot)
    }

    fn is_mmap_oom(os_errno: i32) -> bool {
        unix_common::is_mmap_oom(os_errno)
    }

    fn panic_if_unmapped(_start: Address, _size: usize) {
        // Unimplemented for now.
    }
}

impl MmapStrategy {
    /// get the flags for POSIX mmap.
    pub fn get_posix_mmap_flags(&self) -> i32 {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED;
        // `replace` is ignored on macOS.
        if !self.reserve {
            flags |= libc::MAP_NORESERVE;
        }
        flags
    }
}

impl OSProcess for MacOS {
    fn get_process_memory_maps() -> Result<String> {
        let pid = std::process::id();
        let output = std::process::Command::new("vmmap")
            .arg(pid.to_string())
            .output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(std::io::Error::other(format!(
                "Failed to get process memory map: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    fn get_process_id() -> Result<String> {
        unix_common::get_process_id()
    }

    fn get_thread_id() -> Result<String> {
        unix_common::get_thread_id()
    }

    fn get_total_num_cpus() -> CoreNum {
        num_cpus::get() as CoreNum
    }

    fn bind_current_thread_to_core(_core_id: CoreId) {
        // Thread affinity is not exposed portably on macOS; this is a no-op.
    }

    fn bind_current_thread_to_cpuset(_core_ids: &[CoreId]) {
        // Thread affinity is not exposed portably on macOS; this is a no-op.
    }
}
