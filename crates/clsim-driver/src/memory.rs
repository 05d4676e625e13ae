//! Guest-memory collaborator interface and a sparse paged memory.
//!
//! The driver never owns guest memory; it reaches it through
//! [`GuestMemory`]. [`PagedMemory`] backs both the guest view used by the
//! harness and the device's flat video memory.

use std::collections::HashMap;

use crate::error::{DriverError, Result};

/// Page granularity of [`PagedMemory`].
pub const PAGE_SIZE: usize = 4096;

/// Byte-addressed view of a simulated 32-bit address space.
pub trait GuestMemory {
    /// Read `len` bytes starting at `addr`.
    fn read(&self, addr: u32, len: usize) -> Result<Vec<u8>>;

    /// Write `bytes` starting at `addr`.
    fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<()>;

    /// Read a NUL-terminated string of at most `max` bytes.
    ///
    /// The returned bytes exclude the terminator. When no terminator is
    /// found within `max` bytes, all `max` bytes are returned, which callers
    /// treat as "buffer too small".
    fn read_string(&self, addr: u32, max: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for offset in 0..max {
            let at = checked_addr(addr, offset, 1)?;
            let byte = self.read(at, 1)?[0];
            if byte == 0 {
                return Ok(out);
            }
            out.push(byte);
        }
        Ok(out)
    }

    /// Read a little-endian `u32`.
    fn read_u32(&self, addr: u32) -> Result<u32> {
        let bytes = self.read(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a little-endian `u32`.
    fn write_u32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }
}

fn checked_addr(base: u32, offset: usize, len: usize) -> Result<u32> {
    let end = u64::from(base) + offset as u64 + len as u64;
    if end > u64::from(u32::MAX) + 1 {
        return Err(DriverError::GuestMemoryFault {
            addr: base,
            size: offset + len,
        });
    }
    Ok(base + offset as u32)
}

/// Sparse memory made of zero-initialised 4 KiB pages.
///
/// Pages are materialised on first write; reads of untouched pages yield
/// zeros.
#[derive(Debug, Default, Clone)]
pub struct PagedMemory {
    pages: HashMap<u32, Box<[u8]>>,
}

impl PagedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages that have been written at least once.
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    fn for_each_chunk(
        addr: u32,
        len: usize,
        mut f: impl FnMut(u32, usize, usize, usize),
    ) -> Result<()> {
        checked_addr(addr, 0, len)?;
        let mut done = 0usize;
        while done < len {
            let at = addr as usize + done;
            let page = (at / PAGE_SIZE) as u32;
            let offset = at % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(len - done);
            f(page, offset, done, chunk);
            done += chunk;
        }
        Ok(())
    }
}

impl GuestMemory for PagedMemory {
    fn read(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        Self::for_each_chunk(addr, len, |page, offset, done, chunk| {
            if let Some(data) = self.pages.get(&page) {
                out[done..done + chunk].copy_from_slice(&data[offset..offset + chunk]);
            }
        })?;
        Ok(out)
    }

    fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        let pages = &mut self.pages;
        Self::for_each_chunk(addr, bytes.len(), |page, offset, done, chunk| {
            let data = pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
            data[offset..offset + chunk].copy_from_slice(&bytes[done..done + chunk]);
        })
    }
}
