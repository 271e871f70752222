use crate::async_scsi_device::AsyncScsiBlockDevice;
use crate::config::DriverConfig;
use crate::error::ErrorKind;
use crate::scsi::InquiryResponse;
use crate::scsi_device::ScsiBlockDevice;
use crate::storage::{BlockDevice, Geometry, LbaId};
use crate::transport::{AsyncBulkTransport, BulkTransport};

/// Either driver variant behind one [`BlockDevice`].
pub enum BlockDeviceDriver<T: BulkTransport + AsyncBulkTransport> {
    Sync(ScsiBlockDevice<T>),
    Async(AsyncScsiBlockDevice<T>),
}

/// Create a driver for a mass storage device speaking the SCSI transparent
/// command set, which is the only command set supported.
pub fn create_block_device<T: BulkTransport + AsyncBulkTransport>(
    transport: T,
    async_mode: bool,
    config: DriverConfig,
) -> BlockDeviceDriver<T> {
    if async_mode {
        BlockDeviceDriver::Async(AsyncScsiBlockDevice::with_config(transport, config))
    } else {
        BlockDeviceDriver::Sync(ScsiBlockDevice::with_config(transport, config))
    }
}

impl<T: BulkTransport + AsyncBulkTransport> BlockDeviceDriver<T> {
    pub fn is_async(&self) -> bool {
        matches!(self, BlockDeviceDriver::Async(_))
    }

    pub fn inquiry(&self) -> Option<&InquiryResponse> {
        match self {
            BlockDeviceDriver::Sync(dev) => dev.inquiry(),
            BlockDeviceDriver::Async(dev) => dev.inquiry(),
        }
    }

    pub fn transport(&self) -> &T {
        match self {
            BlockDeviceDriver::Sync(dev) => dev.transport(),
            BlockDeviceDriver::Async(dev) => dev.transport(),
        }
    }

    pub fn into_transport(self) -> T {
        match self {
            BlockDeviceDriver::Sync(dev) => dev.into_transport(),
            BlockDeviceDriver::Async(dev) => dev.into_transport(),
        }
    }
}

impl<T: BulkTransport + AsyncBulkTransport> BlockDevice for BlockDeviceDriver<T> {
    fn init(&mut self) -> Result<(), ErrorKind> {
        match self {
            BlockDeviceDriver::Sync(dev) => dev.init(),
            BlockDeviceDriver::Async(dev) => dev.init(),
        }
    }

    fn geometry(&self) -> Option<Geometry> {
        match self {
            BlockDeviceDriver::Sync(dev) => dev.geometry(),
            BlockDeviceDriver::Async(dev) => dev.geometry(),
        }
    }

    fn read(&mut self, lba: LbaId, data: &mut [u8]) -> Result<usize, ErrorKind> {
        match self {
            BlockDeviceDriver::Sync(dev) => dev.read(lba, data),
            BlockDeviceDriver::Async(dev) => dev.read(lba, data),
        }
    }

    fn write(&mut self, lba: LbaId, data: &[u8]) -> Result<usize, ErrorKind> {
        match self {
            BlockDeviceDriver::Sync(dev) => dev.write(lba, data),
            BlockDeviceDriver::Async(dev) => dev.write(lba, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi;
    use crate::tests_util::*;

    #[test]
    fn builds_requested_variant() {
        init();
        let sync = create_block_device(SimDevice::new(16, 512), false, DriverConfig::default());
        assert!(!sync.is_async());
        let asynchronous =
            create_block_device(SimDevice::new(16, 512), true, DriverConfig::default());
        assert!(asynchronous.is_async());
    }

    #[test]
    fn both_variants_behave_alike() {
        init();
        for async_mode in [false, true] {
            let mut dev =
                create_block_device(SimDevice::new(32, 4096), async_mode, DriverConfig::default());
            assert_eq!(dev.geometry(), None);
            dev.init().unwrap();
            assert_eq!(dev.block_size(), 4096);
            assert_eq!(dev.block_count(), 32);
            assert_eq!(dev.inquiry().unwrap().vendor(), "SIMULATE");

            let txt = rust_counter_strings::generate(2 * 4096);
            let data = txt.as_bytes();
            assert_eq!(dev.write(LbaId(30), data), Ok(data.len()));
            assert_eq!(dev.read_blocks(LbaId(30), 2).unwrap(), data);
            assert_eq!(
                dev.write(LbaId(31), data),
                Err(ErrorKind::OutOfBounds)
            );

            let sim = dev.into_transport();
            assert_eq!(sim.resets, 0);
            assert_eq!(
                &sim.opcodes[sim.opcodes.len() - 2..],
                &[scsi::WRITE_10, scsi::READ_10]
            );
        }
    }
}
