//! Host memory buffers visible to the RDMA device.
//!
//! A [`HostBuffer`] is a fixed-size heap allocation that is never resized, so
//! its virtual address is stable for its whole life. Clones share the same
//! memory, which is how the device keeps a registered region alive while the
//! application still holds its own handle.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// A shared, fixed-size, address-stable byte buffer.
#[derive(Clone)]
pub struct HostBuffer {
    data: Arc<RwLock<Box<[u8]>>>,
    addr: u64,
    len: usize,
}

impl HostBuffer {
    /// Allocates a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Takes ownership of `data` as a buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let boxed = data.into_boxed_slice();
        let addr = boxed.as_ptr() as u64;
        let len = boxed.len();
        Self {
            data: Arc::new(RwLock::new(boxed)),
            addr,
            len,
        }
    }

    /// Virtual address of the first byte.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Virtual address of the byte at `offset`.
    pub fn addr_at(&self, offset: usize) -> u64 {
        self.addr + offset as u64
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the buffer has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if `[addr, addr + len)` lies inside this buffer.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr && addr + len as u64 <= self.addr + self.len as u64
    }

    /// Translates an absolute address into an offset in this buffer.
    pub fn offset_of(&self, addr: u64, len: usize) -> Option<usize> {
        if self.contains(addr, len) {
            Some((addr - self.addr) as usize)
        } else {
            None
        }
    }

    /// Copies `len` bytes starting at `offset` out of the buffer.
    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        let data = self.data.read();
        data.get(offset..end).map(|s| s.to_vec())
    }

    /// Writes `src` at `offset`; returns false when it does not fit.
    pub fn write(&self, offset: usize, src: &[u8]) -> bool {
        let end = match offset.checked_add(src.len()) {
            Some(end) if end <= self.len => end,
            _ => return false,
        };
        self.data.write()[offset..end].copy_from_slice(src);
        true
    }

    /// Copies `len` bytes from `src[src_offset..]` into `self[dst_offset..]`.
    pub fn copy_from(
        &self,
        dst_offset: usize,
        src: &HostBuffer,
        src_offset: usize,
        len: usize,
    ) -> bool {
        match src.read(src_offset, len) {
            Some(bytes) => self.write(dst_offset, &bytes),
            None => false,
        }
    }

    /// Full contents as a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().to_vec()
    }

    /// Fills the whole buffer with `byte`.
    pub fn fill(&self, byte: u8) {
        self.data.write().fill(byte);
    }

    /// Returns true if both handles share the same memory.
    pub fn same_memory(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("addr", &format_args!("0x{:x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}
