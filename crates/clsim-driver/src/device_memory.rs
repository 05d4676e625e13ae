//! Device (video) memory: a bump allocator over a flat address space.
//!
//! Allocation only ever advances the top of the heap. Freed ranges are
//! never reused and the heap has no upper bound; both gaps are part of the
//! driver's observable contract.

use tracing::{debug, warn};

use crate::error::{DriverError, Result};
use crate::memory::{GuestMemory, PagedMemory};

/// Flat device address space with a monotonically increasing top.
#[derive(Debug, Default)]
pub struct DeviceMemory {
    top: u32,
    mem: PagedMemory,
}

impl DeviceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current top of the device heap. Every byte below it is allocated.
    pub fn top(&self) -> u32 {
        self.top
    }

    /// Reserve `size` bytes, returning the device address of the block.
    pub fn allocate(&mut self, size: u32) -> u32 {
        let device_ptr = self.top;
        // No exhaustion check: the heap wraps like the 32-bit guest pointer.
        self.top = self.top.wrapping_add(size);
        debug!("{size} bytes of device memory allocated at 0x{device_ptr:x}");
        device_ptr
    }

    /// Release a block. Device memory is never reclaimed; the pointer is
    /// returned unchanged.
    pub fn free(&mut self, device_ptr: u32) -> u32 {
        warn!("ignoring free of 0x{device_ptr:x}: device memory is never reclaimed");
        device_ptr
    }

    /// Fail unless `[addr, addr + size)` lies below the heap top.
    pub fn check_range(&self, call: &'static str, addr: u32, size: u32) -> Result<()> {
        if u64::from(addr) + u64::from(size) > u64::from(self.top) {
            return Err(DriverError::DeviceMemoryFault {
                call,
                addr,
                size,
                top: self.top,
            });
        }
        Ok(())
    }

    /// Read allocated device memory.
    pub fn read(&self, call: &'static str, addr: u32, size: u32) -> Result<Vec<u8>> {
        self.check_range(call, addr, size)?;
        self.mem.read(addr, size as usize)
    }

    /// Write allocated device memory.
    pub fn write(&mut self, call: &'static str, addr: u32, bytes: &[u8]) -> Result<()> {
        let size = u32::try_from(bytes.len())
            .map_err(|_| DriverError::protocol(call, "transfer larger than 4 GiB"))?;
        self.check_range(call, addr, size)?;
        self.mem.write(addr, bytes)
    }

    /// Device to host: copy `size` bytes from `device_ptr` into guest memory.
    pub fn copy_to_host(
        &self,
        host: &mut dyn GuestMemory,
        host_ptr: u32,
        device_ptr: u32,
        size: u32,
    ) -> Result<()> {
        let buf = self.read("si_mem_read", device_ptr, size)?;
        host.write(host_ptr, &buf)
    }

    /// Host to device: copy `size` bytes from guest memory to `device_ptr`.
    pub fn copy_from_host(
        &mut self,
        host: &dyn GuestMemory,
        device_ptr: u32,
        host_ptr: u32,
        size: u32,
    ) -> Result<()> {
        self.check_range("si_mem_write", device_ptr, size)?;
        let buf = host.read(host_ptr, size as usize)?;
        self.mem.write(device_ptr, &buf)
    }

    /// Device to device copy through a scratch buffer of exactly `size` bytes.
    pub fn copy(&mut self, dest_ptr: u32, src_ptr: u32, size: u32) -> Result<()> {
        self.check_range("si_mem_copy", src_ptr, size)?;
        self.check_range("si_mem_copy", dest_ptr, size)?;
        let buf = self.mem.read(src_ptr, size as usize)?;
        self.mem.write(dest_ptr, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_bumps_top() {
        let mut dm = DeviceMemory::new();
        assert_eq!(dm.allocate(100), 0);
        assert_eq!(dm.allocate(28), 100);
        assert_eq!(dm.top(), 128);
    }

    #[test]
    fn free_is_a_no_op_returning_its_input() {
        let mut dm = DeviceMemory::new();
        let p = dm.allocate(64);
        assert_eq!(dm.free(p), p);
        assert_eq!(dm.top(), 64);
        // Freed space is not reused.
        assert_eq!(dm.allocate(8), 64);
    }

    #[test]
    fn access_ending_exactly_at_top_is_allowed() {
        let mut dm = DeviceMemory::new();
        dm.allocate(16);
        dm.write("test", 8, &[1; 8]).unwrap();
        assert_eq!(dm.read("test", 8, 8).unwrap(), vec![1; 8]);
    }

    #[test]
    fn access_past_top_faults() {
        let mut dm = DeviceMemory::new();
        dm.allocate(16);
        let err = dm.read("si_mem_read", 8, 9).unwrap_err();
        assert!(matches!(err, DriverError::DeviceMemoryFault { top: 16, .. }));
    }

    #[test]
    fn range_check_does_not_wrap() {
        let mut dm = DeviceMemory::new();
        dm.allocate(16);
        assert!(dm.check_range("test", u32::MAX, 2).is_err());
    }

    #[test]
    fn host_round_trip_and_device_copy() {
        let mut host = PagedMemory::new();
        let mut dm = DeviceMemory::new();
        let src = dm.allocate(32);
        let dst = dm.allocate(32);
        let data: Vec<u8> = (0..32).map(|i| i * 3).collect();
        host.write(0x1000, &data).unwrap();

        dm.copy_from_host(&host, src, 0x1000, 32).unwrap();
        dm.copy(dst, src, 32).unwrap();
        dm.copy_to_host(&mut host, 0x2000, dst, 32).unwrap();

        assert_eq!(host.read(0x2000, 32).unwrap(), data);
    }

    #[test]
    fn failed_copy_leaves_destination_untouched() {
        let mut dm = DeviceMemory::new();
        let dst = dm.allocate(8);
        dm.write("test", dst, &[7; 8]).unwrap();
        assert!(dm.copy(dst, 4, 8).is_err());
        assert_eq!(dm.read("test", dst, 8).unwrap(), vec![7; 8]);
    }
}
