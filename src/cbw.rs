use core::convert::TryFrom;

use log::{error, trace};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::ErrorKind;
use crate::util::Signature;

pub const CBW_SIGNATURE: Signature = Signature(*b"USBC");

pub const CBW_LEN: usize = 31;

pub const MAX_CDB_LEN: usize = 16;

const FLAG_DATA_IN: u8 = 0x80;

pub const MAX_LUN: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

#[derive(Debug, AsBytes, FromBytes, Unaligned, Clone, PartialEq)]
#[repr(C)]
pub struct CommandBlockWrapper {
    signature: Signature,
    tag: U32<LittleEndian>,
    data_transfer_length: U32<LittleEndian>,
    flags: u8,
    lun: u8,
    cb_length: u8,
    cb: [u8; MAX_CDB_LEN],
}

impl CommandBlockWrapper {
    pub fn new(
        tag: u32,
        data_transfer_length: u32,
        direction: Direction,
        lun: u8,
        cdb: &[u8],
    ) -> Result<Self, ErrorKind> {
        if cdb.is_empty() || cdb.len() > MAX_CDB_LEN {
            error!("CDB length {} outside 1..={}", cdb.len(), MAX_CDB_LEN);
            return Err(ErrorKind::InvalidParameter);
        }
        if lun > MAX_LUN {
            error!("LUN {} out of range", lun);
            return Err(ErrorKind::InvalidParameter);
        }

        let mut cb = [0u8; MAX_CDB_LEN];
        cb[..cdb.len()].copy_from_slice(cdb);
        let flags = match direction {
            Direction::In => FLAG_DATA_IN,
            Direction::Out => 0,
        };

        Ok(CommandBlockWrapper {
            signature: CBW_SIGNATURE,
            tag: U32::new(tag),
            data_transfer_length: U32::new(data_transfer_length),
            flags,
            lun,
            cb_length: cdb.len() as u8,
            cb,
        })
    }

    pub fn tag(&self) -> u32 {
        self.tag.get()
    }

    pub fn data_transfer_length(&self) -> u32 {
        self.data_transfer_length.get()
    }

    pub fn direction(&self) -> Direction {
        if self.flags & FLAG_DATA_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cb[..self.cb_length as usize]
    }

    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut bytes = [0u8; CBW_LEN];
        bytes.copy_from_slice(self.as_bytes());
        bytes
    }
}

/// Parse a CBW as the device sees it.
impl TryFrom<&[u8]> for CommandBlockWrapper {
    type Error = ErrorKind;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let cbw: Option<LayoutVerified<_, CommandBlockWrapper>> =
            LayoutVerified::new_unaligned(bytes);
        match cbw {
            Some(cbw) => {
                let cb_length = cbw.cb_length as usize;
                if cbw.signature != CBW_SIGNATURE || cb_length == 0 || cb_length > MAX_CDB_LEN {
                    return Err(ErrorKind::Protocol);
                }
                Ok((*cbw).clone())
            }
            None => Err(ErrorKind::Protocol),
        }
    }
}

/// Encode a command into its 31-byte wire form.
pub fn encode_command(
    tag: u32,
    data_length: u32,
    direction: Direction,
    lun: u8,
    cdb: &[u8],
) -> Result<[u8; CBW_LEN], ErrorKind> {
    let cbw = CommandBlockWrapper::new(tag, data_length, direction, lun, cdb)?;
    trace!(
        "cbw tag {} len {} {:?} lun {} cdb {:02x?}",
        tag,
        data_length,
        direction,
        lun,
        cbw.cdb()
    );
    Ok(cbw.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const READ10: [u8; 10] = [0x28, 0, 0, 0, 0x10, 0, 0, 0, 8, 0];

    #[test]
    fn valid_cbw_size() {
        assert_eq!(core::mem::size_of::<CommandBlockWrapper>(), CBW_LEN);
    }

    #[test]
    fn encodes_header_little_endian() {
        let bytes = encode_command(0x1234_5678, 4096, Direction::In, 0, &READ10).unwrap();
        assert_eq!(&bytes[0..4], &[0x55, 0x53, 0x42, 0x43]);
        assert_eq!(&bytes[4..8], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&bytes[8..12], &[0x00, 0x10, 0x00, 0x00]);
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[13], 0);
        assert_eq!(bytes[14], 10);
        assert_eq!(&bytes[15..25], &READ10);
        assert!(bytes[25..].iter().all(|&b| b == 0));
    }

    #[test]
    fn out_direction_clears_flag() {
        let bytes = encode_command(1, 512, Direction::Out, 2, &[0x2a; 10]).unwrap();
        assert_eq!(bytes[12], 0x00);
        assert_eq!(bytes[13], 2);
    }

    #[test]
    fn rejects_bad_cdb_and_lun() {
        assert_eq!(
            encode_command(1, 0, Direction::Out, 0, &[]),
            Err(ErrorKind::InvalidParameter)
        );
        assert_eq!(
            encode_command(1, 0, Direction::Out, 0, &[0u8; 17]),
            Err(ErrorKind::InvalidParameter)
        );
        assert_eq!(
            encode_command(1, 0, Direction::Out, 16, &[0u8; 6]),
            Err(ErrorKind::InvalidParameter)
        );
    }

    #[test]
    fn device_side_parse() {
        let bytes = encode_command(77, 36, Direction::In, 1, &[0x12, 0, 0, 0, 36, 0]).unwrap();
        let cbw = CommandBlockWrapper::try_from(&bytes[..]).unwrap();
        assert_eq!(cbw.tag(), 77);
        assert_eq!(cbw.data_transfer_length(), 36);
        assert_eq!(cbw.direction(), Direction::In);
        assert_eq!(cbw.lun(), 1);
        assert_eq!(cbw.cdb(), &[0x12, 0, 0, 0, 36, 0]);

        let mut corrupt = bytes;
        corrupt[3] = 0x44;
        assert_eq!(
            CommandBlockWrapper::try_from(&corrupt[..]),
            Err(ErrorKind::Protocol)
        );
        assert_eq!(
            CommandBlockWrapper::try_from(&bytes[..30]),
            Err(ErrorKind::Protocol)
        );
    }

    proptest! {
        #[test]
        fn encoding_is_pure(
            tag in any::<u32>(),
            len in any::<u32>(),
            dir_in in any::<bool>(),
            lun in 0u8..16,
            cdb in proptest::collection::vec(any::<u8>(), 1..=16),
        ) {
            let direction = if dir_in { Direction::In } else { Direction::Out };
            let a = encode_command(tag, len, direction, lun, &cdb).unwrap();
            let b = encode_command(tag, len, direction, lun, &cdb).unwrap();
            prop_assert_eq!(a, b);
            prop_assert_eq!(&a[0..4], &[0x55u8, 0x53, 0x42, 0x43][..]);
            prop_assert_eq!(a[14] as usize, cdb.len());
        }
    }
}
