use crate::util::address::Address;
use crate::util::os::*;
use std::io::Result;

impl MmapProtection {
    fn get_native_flags(&self) -> i32 {
        use libc::{PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE};
        match self {
            Self::ReadWrite => PROT_READ | PROT_WRITE,
            Self::ReadWriteExec => PROT_READ | PROT_WRITE | PROT_EXEC,
            Self::NoAccess => PROT_NONE,
        }
    }
}

pub fn mmap(start: Address, size: usize, strategy: MmapStrategy) -> Result<Address> {
    let ptr = start.to_mut_ptr();
    let prot = strategy.prot.get_native_flags();
    let flags = strategy.get_posix_mmap_flags();
    let result = unsafe { libc::mmap(ptr, size, prot, flags, -1, 0) };
    if result == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok(Address::from_mut_ptr(result))
}

/// `mmap` a fresh anonymous region anywhere the kernel picks (no `MAP_FIXED`). This is what
/// heap and backup-file backing storage uses: unlike the teacher's VM-heap reservations, a
/// pool's backing bytes have no required virtual address.
pub fn mmap_anywhere(size: usize, prot: MmapProtection) -> Result<Address> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let result = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot.get_native_flags(),
            flags,
            -1,
            0,
        )
    };
    if result == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok(Address::from_mut_ptr(result))
}

pub fn is_mmap_oom(os_errno: i32) -> bool {
    os_errno == libc::ENOMEM
}

pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Revoke all access to `[start, start+size)`.
pub fn mprotect(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, libc::PROT_NONE) },
        0,
    )
}

/// Restore access to `[start, start+size)`.
pub fn munprotect(start: Address, size: usize, prot: MmapProtection) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot.get_native_flags()) },
        0,
    )
}

pub fn get_process_id() -> Result<String> {
    Ok(unsafe { libc::getpid() }.to_string())
}

pub fn get_thread_id() -> Result<String> {
    Ok(format!("{:?}", unsafe { libc::pthread_self() }))
}

pub fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
