//! mmap-backed pool files.

use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;

use nix::fcntl::{open, OFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};

/// One pool's backing file, mapped shared read-write.
pub struct PoolFile {
    ptr: NonNull<u8>,
    len: usize,
    fd: RawFd,
}

impl PoolFile {
    /// Create (or truncate) the backing file at `len` bytes and map it.
    pub fn create(path: &Path, len: usize) -> io::Result<Self> {
        let owned_fd = open(
            path,
            OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        if let Err(e) = ftruncate(&owned_fd, len as i64) {
            return Err(io::Error::from_raw_os_error(e as i32));
        }
        Self::map(owned_fd, len)
    }

    /// Map an existing backing file at its current size.
    pub fn open(path: &Path) -> io::Result<Self> {
        let owned_fd = open(path, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let mut stat_buf: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(owned_fd.as_raw_fd(), &mut stat_buf) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Self::map(owned_fd, stat_buf.st_size as usize)
    }

    fn map(owned_fd: std::os::fd::OwnedFd, len: usize) -> io::Result<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-length pool"))?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &owned_fd,
                0,
            )
        }
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        Ok(PoolFile {
            ptr: NonNull::new(ptr.as_ptr().cast()).expect("mmap returned null"),
            len,
            fd: owned_fd.into_raw_fd(),
        })
    }

    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PoolFile {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
        let _ = close(self.fd);
    }
}
