use alloc::vec;
use alloc::vec::Vec;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: usize,
    pub num_blocks: u64,
    pub read_only: bool,
}

impl Geometry {
    pub fn capacity_bytes(&self) -> u64 {
        self.num_blocks * self.block_size as u64
    }
}

/// A linear array of fixed-size logical blocks.
///
/// `read` and `write` take buffers whose length is a whole number of
/// blocks and return the number of bytes the device actually moved, which
/// may be less than the buffer on a short transfer.
pub trait BlockDevice {
    /// Identify the device and query its geometry. Must be called once
    /// before any I/O.
    fn init(&mut self) -> Result<(), ErrorKind>;
    fn geometry(&self) -> Option<Geometry>;
    fn read(&mut self, lba: LbaId, data: &mut [u8]) -> Result<usize, ErrorKind>;
    fn write(&mut self, lba: LbaId, data: &[u8]) -> Result<usize, ErrorKind>;

    fn block_size(&self) -> usize {
        self.geometry().map(|g| g.block_size).unwrap_or(0)
    }

    fn block_count(&self) -> u64 {
        self.geometry().map(|g| g.num_blocks).unwrap_or(0)
    }

    fn read_only(&self) -> bool {
        self.geometry().map(|g| g.read_only).unwrap_or(false)
    }

    /// Read `count` blocks into a fresh buffer, truncated to what arrived.
    fn read_blocks(&mut self, lba: LbaId, count: u32) -> Result<Vec<u8>, ErrorKind> {
        let geometry = self.geometry().ok_or(ErrorKind::NotInitialized)?;
        let mut data = vec![0u8; geometry.block_size * count as usize];
        let len = self.read(lba, &mut data)?;
        data.truncate(len);
        Ok(data)
    }
}

/// Check an I/O request against the device geometry and return its length
/// in blocks.
pub(crate) fn check_request(
    geometry: Option<&Geometry>,
    lba: LbaId,
    len: usize,
) -> Result<u64, ErrorKind> {
    let geometry = geometry.ok_or(ErrorKind::NotInitialized)?;
    if len % geometry.block_size != 0 {
        return Err(ErrorKind::InvalidParameter);
    }
    let blocks = (len / geometry.block_size) as u64;
    if lba.0 as u64 + blocks > geometry.num_blocks {
        return Err(ErrorKind::OutOfBounds);
    }
    Ok(blocks)
}
