#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod async_scsi_device;
mod block_io;
pub mod cbw;
pub mod command;
pub mod config;
pub mod csw;
pub mod error;
pub mod factory;
pub mod scsi;
pub mod scsi_device;
pub mod storage;
pub mod transport;
pub mod util;

#[cfg(test)]
mod tests_util;

pub use async_scsi_device::{AsyncScsiBlockDevice, Outcome};
pub use cbw::{encode_command, Direction};
pub use command::{Command, CommandExecutor, DataBuffer, Phase};
pub use config::DriverConfig;
pub use csw::{decode_status, CommandStatus};
pub use error::ErrorKind;
pub use factory::{create_block_device, BlockDeviceDriver};
pub use scsi::{Capacity, InquiryResponse, SenseData, SenseKey};
pub use scsi_device::ScsiBlockDevice;
pub use storage::{BlockDevice, Geometry, LbaId};
pub use transport::{
    AsyncBulkTransport, BulkTransport, Completion, ControlTransport, Endpoint, Transfer,
    TransportError,
};
