//! A circular byte region without wraparound.
//!
//! One memfd of `N` bytes is mapped twice, back to back, into a `2N` byte
//! reservation, so byte `N + i` aliases byte `i` and any window of up to `N`
//! bytes is a single flat slice.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tracing::error;

use crate::error::{Error, Result};

pub struct RingBuffer {
    base: *mut u8,
    size: usize,
}

// The mapping is owned exclusively; access goes through &self/&mut self.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Maps a ring of at least `size` bytes, rounded up to the page size.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("ring buffer size must be non-zero".into()));
        }
        let page = page_size();
        let size = size
            .checked_add(page - 1)
            .map(|size| size / page * page)
            .ok_or_else(|| Error::Config(format!("ring buffer of {size} bytes")))?;

        let name = b"rdma-stream-ring\0";
        let fd = unsafe { libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os("memfd_create"));
        }
        // The fd is only needed until both views exist.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            return Err(Error::last_os("ftruncate"));
        }

        let reserved = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                2 * size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reserved == libc::MAP_FAILED {
            return Err(Error::last_os("mmap"));
        }
        let ring = Self {
            base: reserved as *mut u8,
            size,
        };

        for half in 0..2 {
            let addr = unsafe { ring.base.add(half * size) } as *mut libc::c_void;
            let mapped = unsafe {
                libc::mmap(
                    addr,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd.as_raw_fd(),
                    0,
                )
            };
            if mapped != addr {
                let err = Error::last_os("mmap");
                error!("failed to map ring buffer half {half}, {err}");
                return Err(err);
            }
        }
        Ok(ring)
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Start of the first view; `size` bytes are registered from here.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Address of `offset` inside the first view.
    pub fn addr_at(&self, offset: usize) -> u64 {
        self.base as u64 + (offset % self.size) as u64
    }

    /// The `len` bytes starting at `offset`, crossing the end if needed.
    pub fn window(&self, offset: usize, len: usize) -> &[u8] {
        assert!(len <= self.size, "window of {len} bytes exceeds ring");
        let offset = offset % self.size;
        unsafe { core::slice::from_raw_parts(self.base.add(offset), len) }
    }

    pub fn window_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        assert!(len <= self.size, "window of {len} bytes exceeds ring");
        let offset = offset % self.size;
        unsafe { core::slice::from_raw_parts_mut(self.base.add(offset), len) }
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(self.window(offset, buf.len()));
    }

    pub fn write_at(&mut self, offset: usize, buf: &[u8]) {
        self.window_mut(offset, buf.len()).copy_from_slice(buf);
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base as *mut libc::c_void, 2 * self.size) } < 0 {
            error!(
                "failed to unmap ring buffer, {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

impl core::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

pub(crate) fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_page() {
        let ring = RingBuffer::new(100).unwrap();
        assert_eq!(page_size(), ring.size());
        assert!(RingBuffer::new(0).is_err());
    }

    #[test]
    fn second_view_aliases_first() {
        let mut ring = RingBuffer::new(page_size()).unwrap();
        let size = ring.size();
        ring.write_at(0, b"head");
        let mirrored = unsafe { core::slice::from_raw_parts(ring.as_ptr().add(size), 4) };
        assert_eq!(b"head", mirrored);
    }

    #[test]
    fn windows_cross_the_end() {
        let mut ring = RingBuffer::new(page_size()).unwrap();
        let size = ring.size();
        let data: Vec<u8> = (0..64u8).collect();
        ring.write_at(size - 10, &data);
        assert_eq!(&data[10..], ring.window(0, 54));
        let mut out = [0u8; 64];
        ring.read_at(size - 10, &mut out);
        assert_eq!(&data[..], &out[..]);
        assert_eq!(ring.addr_at(size + 3), ring.addr_at(3));
    }
}
