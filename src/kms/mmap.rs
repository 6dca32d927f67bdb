use std::ffi::c_void;
use std::io;
use std::os::fd::AsFd;
use std::ptr;

use rustix::mm::{self, MapFlags, ProtFlags};

use crate::error::os_error;

/// A read/write memory mapping, unmapped on drop.
pub struct MemoryMap {
    ptr: *mut c_void,
    len: usize,
}

impl MemoryMap {
    /// Map `len` bytes of `fd` at `offset` shared with the kernel object behind it.
    pub fn shared<Fd: AsFd>(fd: Fd, offset: u64, len: usize) -> io::Result<Self> {
        // SAFETY: a fresh mapping at a kernel-chosen address aliases no Rust memory.
        let ptr = unsafe {
            mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                offset,
            )
        }
        .map_err(os_error)?;
        Ok(Self { ptr, len })
    }

    /// Private anonymous memory, used where no device object backs the pixels.
    #[cfg(test)]
    pub fn anonymous(len: usize) -> io::Result<Self> {
        // SAFETY: as above, the mapping is new and unaliased.
        let ptr = unsafe {
            mm::mmap_anonymous(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .map_err(os_error)?;
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.cast::<u8>(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.cast::<u8>(), self.len) }
    }
}

impl Drop for MemoryMap {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by mmap with exactly this length.
        if let Err(e) = unsafe { mm::munmap(self.ptr, self.len) } {
            tracing::warn!("munmap of {} bytes failed: {e}", self.len);
        }
    }
}

impl std::fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMap")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
