use log::{trace, warn};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::ErrorKind;
use crate::util::Signature;

pub const CSW_SIGNATURE: Signature = Signature(*b"USBS");

pub const CSW_LEN: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Good,
    Failed,
    PhaseError,
}

impl CommandStatus {
    fn from_byte(status: u8) -> Option<Self> {
        match status {
            0x00 => Some(CommandStatus::Good),
            0x01 => Some(CommandStatus::Failed),
            0x02 => Some(CommandStatus::PhaseError),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            CommandStatus::Good => 0x00,
            CommandStatus::Failed => 0x01,
            CommandStatus::PhaseError => 0x02,
        }
    }
}

#[derive(Debug, AsBytes, FromBytes, Unaligned, Clone, PartialEq)]
#[repr(C)]
pub struct CommandStatusWrapper {
    signature: Signature,
    tag: U32<LittleEndian>,
    data_residue: U32<LittleEndian>,
    status: u8,
}

impl CommandStatusWrapper {
    /// Build a CSW as a device would send it.
    pub fn new(tag: u32, data_residue: u32, status: CommandStatus) -> Self {
        CommandStatusWrapper {
            signature: CSW_SIGNATURE,
            tag: U32::new(tag),
            data_residue: U32::new(data_residue),
            status: status.to_byte(),
        }
    }

    pub fn tag(&self) -> u32 {
        self.tag.get()
    }

    pub fn data_residue(&self) -> u32 {
        self.data_residue.get()
    }

    /// Only meaningful on a CSW that went through [`decode_status`].
    pub fn status(&self) -> CommandStatus {
        CommandStatus::from_byte(self.status).unwrap_or(CommandStatus::PhaseError)
    }
}

/// Decode and validate a CSW received for the command tagged `expected_tag`.
pub fn decode_status(bytes: &[u8], expected_tag: u32) -> Result<CommandStatusWrapper, ErrorKind> {
    let csw: Option<LayoutVerified<_, CommandStatusWrapper>> =
        LayoutVerified::new_unaligned(bytes);
    let csw = match csw {
        Some(csw) => csw,
        None => {
            warn!("csw has {} bytes, expected {}", bytes.len(), CSW_LEN);
            return Err(ErrorKind::Protocol);
        }
    };

    if csw.signature != CSW_SIGNATURE {
        warn!("csw signature {:#010x}", csw.signature.as_u32());
        return Err(ErrorKind::Protocol);
    }
    if csw.tag.get() != expected_tag {
        warn!("csw tag {} does not match cbw tag {}", csw.tag.get(), expected_tag);
        return Err(ErrorKind::Protocol);
    }
    if CommandStatus::from_byte(csw.status).is_none() {
        warn!("csw status byte {:#04x}", csw.status);
        return Err(ErrorKind::Protocol);
    }

    trace!(
        "csw tag {} residue {} {:?}",
        csw.tag(),
        csw.data_residue(),
        csw.status()
    );
    Ok((*csw).clone())
}
