/// Upper bound on the data moved by one READ(10)/WRITE(10) command.
pub const DEFAULT_MAX_TRANSFER_BYTES: usize = 64 * 1024;

/// Upper bound on one bulk transfer during the data phase.
pub const DEFAULT_MAX_BULK_TRANSFER: usize = 16 * 1024;

pub const DEFAULT_READY_RETRIES: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Logical unit addressed by every CBW.
    pub lun: u8,
    pub max_transfer_bytes: usize,
    pub max_bulk_transfer: usize,
    /// How many times `init` repeats TEST UNIT READY while the unit reports
    /// a failed status (e.g. unit attention after power-on).
    pub ready_retries: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            lun: 0,
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            max_bulk_transfer: DEFAULT_MAX_BULK_TRANSFER,
            ready_retries: DEFAULT_READY_RETRIES,
        }
    }
}

impl DriverConfig {
    /// Largest block count one command may carry for the given block size.
    pub fn max_blocks_per_command(&self, block_size: usize) -> u16 {
        let blocks = core::cmp::max(self.max_transfer_bytes / block_size, 1);
        core::cmp::min(blocks, u16::MAX as usize) as u16
    }
}
