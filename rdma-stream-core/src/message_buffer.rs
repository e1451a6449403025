use std::collections::VecDeque;

use thiserror::Error;

use crate::ring_buffer::page_size;

/// A fixed set of equally sized message buffers carved out of one
/// page-aligned allocation, so the whole pool registers as a single region.
///
/// Buffers cycle through a free ring: [`BufferPool::get`] pops the oldest free
/// one and [`BufferPool::free`] returns it by address once its send or receive
/// completed. A buffer is either free or in flight, never both.
pub(crate) struct BufferPool {
    ptr: *mut u8,
    buffer_size: usize,
    count: usize,
    free: VecDeque<usize>,
    in_flight: Vec<bool>,
}

unsafe impl Send for BufferPool {}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("allocate failed, {0}")]
    Allocate(String),
    #[error("address {0:#x} is not a buffer of this pool")]
    Foreign(u64),
    #[error("buffer {0} freed twice")]
    DoubleFree(usize),
}

impl BufferPool {
    pub(crate) fn new(count: usize, buffer_size: usize) -> Result<Self, PoolError> {
        let len = count
            .checked_mul(buffer_size)
            .filter(|len| *len > 0)
            .ok_or_else(|| PoolError::Allocate(format!("{count} buffers of {buffer_size} bytes")))?;
        let mut ptr = core::ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&mut ptr, page_size(), len) };
        if ret != 0 || ptr.is_null() {
            return Err(PoolError::Allocate(format!(
                "posix_memalign of {len} bytes failed with {ret}"
            )));
        }
        // 0xff until first use
        unsafe { core::ptr::write_bytes(ptr as *mut u8, 0xff, len) };
        Ok(Self {
            ptr: ptr as _,
            buffer_size,
            count,
            free: (0..count).collect(),
            in_flight: vec![false; count],
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Length of the whole allocation.
    pub(crate) fn len(&self) -> usize {
        self.count * self.buffer_size
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Takes the next free buffer, returning its address.
    pub(crate) fn get(&mut self) -> Option<u64> {
        let index = self.free.pop_front()?;
        self.in_flight[index] = true;
        Some(self.addr(index))
    }

    pub(crate) fn free(&mut self, addr: u64) -> Result<(), PoolError> {
        let index = self.index(addr)?;
        if !self.in_flight[index] {
            return Err(PoolError::DoubleFree(index));
        }
        self.in_flight[index] = false;
        self.free.push_back(index);
        Ok(())
    }

    pub(crate) fn slice(&self, addr: u64, len: usize) -> Result<&[u8], PoolError> {
        let index = self.index(addr)?;
        let len = len.min(self.buffer_size);
        Ok(unsafe { core::slice::from_raw_parts(self.ptr.add(index * self.buffer_size), len) })
    }

    pub(crate) fn slice_mut(&mut self, addr: u64) -> Result<&mut [u8], PoolError> {
        let index = self.index(addr)?;
        Ok(unsafe {
            core::slice::from_raw_parts_mut(self.ptr.add(index * self.buffer_size), self.buffer_size)
        })
    }

    fn addr(&self, index: usize) -> u64 {
        self.ptr as u64 + (index * self.buffer_size) as u64
    }

    fn index(&self, addr: u64) -> Result<usize, PoolError> {
        let offset = addr
            .checked_sub(self.ptr as u64)
            .ok_or(PoolError::Foreign(addr))? as usize;
        if offset >= self.len() || offset % self.buffer_size != 0 {
            return Err(PoolError::Foreign(addr));
        }
        Ok(offset / self.buffer_size)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr as _) }
    }
}
