//! Memory-mapped access to a device address space.
//!
//! [`MmioAccess`] is the byte-granular read/write interface the emulated
//! transport and the ring-buffer code are written against. [`MemoryWindow`]
//! is a host-memory implementation: a set of BAR-addressed regions, each
//! bounds-checked, used as the shared window of the in-process simulator.

use std::sync::{Mutex, PoisonError};

use crate::error::{EtError, Result};

/// Byte-granular access to a device address space.
pub trait MmioAccess {
    /// Read `buf.len()` bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is not backed by the device.
    fn mmio_read(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is not backed by the device.
    fn mmio_write(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// Read a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is not backed by the device.
    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.mmio_read(addr, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Write a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is not backed by the device.
    fn write_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.mmio_write(addr, &value.to_le_bytes())
    }

    /// Read a little-endian `i16`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is not backed by the device.
    fn read_i16(&self, addr: u64) -> Result<i16> {
        let mut raw = [0u8; 2];
        self.mmio_read(addr, &mut raw)?;
        Ok(i16::from_le_bytes(raw))
    }
}

#[derive(Debug)]
struct Region {
    base: u64,
    size: usize,
    bytes: Mutex<Vec<u8>>,
}

impl Region {
    fn contains(&self, addr: u64, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        let offset = usize::try_from(offset).ok()?;
        (offset.checked_add(len)? <= self.size).then_some(offset)
    }
}

/// Host-memory backed address space made of disjoint regions.
#[derive(Debug, Default)]
pub struct MemoryWindow {
    regions: Vec<Region>,
}

impl MemoryWindow {
    /// Empty window
    pub fn new() -> Self {
        Self::default()
    }

    /// Back `[base, base + size)` with zeroed memory.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the range overlaps an existing region.
    pub fn add_region(&mut self, base: u64, size: usize) -> Result<()> {
        let end = base + size as u64;
        for region in &self.regions {
            let r_end = region.base + region.size as u64;
            if base < r_end && region.base < end {
                return Err(EtError::invalid_argument(format!(
                    "region {base:#x}+{size:#x} overlaps {:#x}+{:#x}",
                    region.base, region.size
                )));
            }
        }
        tracing::debug!("Backing window region {base:#x}+{size:#x}");
        self.regions.push(Region {
            base,
            size,
            bytes: Mutex::new(vec![0; size]),
        });
        Ok(())
    }

    /// Zero `len` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is not backed.
    pub fn fill_zero(&self, addr: u64, len: usize) -> Result<()> {
        self.mmio_write(addr, &vec![0; len])
    }

    fn locate(&self, addr: u64, len: usize) -> Result<(&Region, usize)> {
        self.regions
            .iter()
            .find_map(|r| r.contains(addr, len).map(|offset| (r, offset)))
            .ok_or_else(|| {
                EtError::transport_fault(format!("access {addr:#x}+{len:#x} outside the window"))
            })
    }
}

impl MmioAccess for MemoryWindow {
    fn mmio_read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let (region, offset) = self.locate(addr, buf.len())?;
        let bytes = region.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn mmio_write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let (region, offset) = self.locate(addr, data.len())?;
        let mut bytes = region.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
