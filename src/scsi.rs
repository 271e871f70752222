use log::{debug, warn};
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::ErrorKind;

pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SENSE_6: u8 = 0x1a;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;

pub const INQUIRY_LEN: u8 = 36;
pub const SENSE_LEN: u8 = 18;
pub const READ_CAPACITY_LEN: usize = 8;
pub const MODE_SENSE_LEN: u8 = 192;

/// Mode page code requesting every page.
pub const MODE_PAGE_ALL: u8 = 0x3f;

pub const PERIPHERAL_DIRECT_ACCESS: u8 = 0x00;

/// A command descriptor block ready to be wrapped in a CBW.
pub trait Cdb: AsBytes {
    fn opcode(&self) -> u8 {
        self.as_bytes()[0]
    }
}

#[derive(Debug, AsBytes, FromBytes, Unaligned, Clone)]
#[repr(C)]
pub struct TestUnitReady {
    opcode: u8,
    reserved: [u8; 4],
    control: u8,
}

#[derive(Debug, AsBytes, FromBytes, Unaligned, Clone)]
#[repr(C)]
pub struct RequestSense {
    opcode: u8,
    desc: u8,
    reserved: [u8; 2],
    allocation_length: u8,
    control: u8,
}

#[derive(Debug, AsBytes, FromBytes, Unaligned, Clone)]
#[repr(C)]
pub struct Inquiry {
    opcode: u8,
    evpd: u8,
    page_code: u8,
    allocation_length: U16<BigEndian>,
    control: u8,
}

#[derive(Debug, AsBytes, FromBytes, Unaligned, Clone)]
#[repr(C)]
pub struct ModeSense6 {
    opcode: u8,
    dbd: u8,
    page_code: u8,
    subpage_code: u8,
    allocation_length: u8,
    control: u8,
}

#[derive(Debug, AsBytes, FromBytes, Unaligned, Clone)]
#[repr(C)]
pub struct ReadCapacity10 {
    opcode: u8,
    reserved: [u8; 8],
    control: u8,
}

/// READ(10) and WRITE(10) share a layout.
#[derive(Debug, AsBytes, FromBytes, Unaligned, Clone)]
#[repr(C)]
pub struct Rw10 {
    opcode: u8,
    flags: u8,
    lba: U32<BigEndian>,
    group: u8,
    transfer_length: U16<BigEndian>,
    control: u8,
}

impl Rw10 {
    pub fn lba(&self) -> u32 {
        self.lba.get()
    }

    pub fn transfer_length(&self) -> u16 {
        self.transfer_length.get()
    }
}

impl Cdb for TestUnitReady {}
impl Cdb for RequestSense {}
impl Cdb for Inquiry {}
impl Cdb for ModeSense6 {}
impl Cdb for ReadCapacity10 {}
impl Cdb for Rw10 {}

pub fn test_unit_ready() -> TestUnitReady {
    TestUnitReady {
        opcode: TEST_UNIT_READY,
        reserved: [0u8; 4],
        control: 0,
    }
}

/// Fixed-format sense data.
pub fn request_sense(allocation_length: u8) -> RequestSense {
    RequestSense {
        opcode: REQUEST_SENSE,
        desc: 0,
        reserved: [0u8; 2],
        allocation_length,
        control: 0,
    }
}

/// Standard inquiry data (no vital product data page).
pub fn inquiry(allocation_length: u16) -> Inquiry {
    Inquiry {
        opcode: INQUIRY,
        evpd: 0,
        page_code: 0,
        allocation_length: U16::new(allocation_length),
        control: 0,
    }
}

pub fn mode_sense_6(page_code: u8, allocation_length: u8) -> ModeSense6 {
    ModeSense6 {
        opcode: MODE_SENSE_6,
        dbd: 0,
        page_code: page_code & 0x3f,
        subpage_code: 0,
        allocation_length,
        control: 0,
    }
}

pub fn read_capacity_10() -> ReadCapacity10 {
    ReadCapacity10 {
        opcode: READ_CAPACITY_10,
        reserved: [0u8; 8],
        control: 0,
    }
}

pub fn read_10(lba: u32, blocks: u16) -> Rw10 {
    rw_10(READ_10, lba, blocks)
}

pub fn write_10(lba: u32, blocks: u16) -> Rw10 {
    rw_10(WRITE_10, lba, blocks)
}

fn rw_10(opcode: u8, lba: u32, blocks: u16) -> Rw10 {
    Rw10 {
        opcode,
        flags: 0,
        lba: U32::new(lba),
        group: 0,
        transfer_length: U16::new(blocks),
        control: 0,
    }
}

#[derive(AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct ReadCapacityData {
    last_lba: U32<BigEndian>,
    block_length: U32<BigEndian>,
}

/// Decoded READ CAPACITY(10) response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub last_lba: u32,
    pub block_size: u32,
}

impl Capacity {
    pub fn parse(bytes: &[u8]) -> Result<Self, ErrorKind> {
        let data: Option<LayoutVerified<_, ReadCapacityData>> =
            LayoutVerified::new_unaligned(bytes);
        match data {
            Some(data) => Ok(Capacity {
                last_lba: data.last_lba.get(),
                block_size: data.block_length.get(),
            }),
            None => {
                warn!("read capacity returned {} bytes", bytes.len());
                Err(ErrorKind::Protocol)
            }
        }
    }

    pub fn block_count(&self) -> u64 {
        self.last_lba as u64 + 1
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.block_count() * self.block_size as u64
    }
}

#[derive(AsBytes, FromBytes, Unaligned, Clone)]
#[repr(C)]
struct StandardInquiryData {
    peripheral: u8,
    removable: u8,
    version: u8,
    response_data_format: u8,
    additional_length: u8,
    flags: [u8; 3],
    vendor_id: [u8; 8],
    product_id: [u8; 16],
    product_revision: [u8; 4],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryResponse {
    pub peripheral_qualifier: u8,
    pub peripheral_device_type: u8,
    pub removable: bool,
    pub version: u8,
    pub response_data_format: u8,
    pub vendor_id: [u8; 8],
    pub product_id: [u8; 16],
    pub product_revision: [u8; 4],
}

impl InquiryResponse {
    /// Devices may return less than the full 36 bytes; missing fields read
    /// as zero.
    pub fn parse(bytes: &[u8]) -> Result<Self, ErrorKind> {
        if bytes.len() < 5 {
            warn!("inquiry returned {} bytes", bytes.len());
            return Err(ErrorKind::Protocol);
        }
        let mut raw = [0u8; INQUIRY_LEN as usize];
        let len = core::cmp::min(bytes.len(), raw.len());
        raw[..len].copy_from_slice(&bytes[..len]);

        let data: Option<LayoutVerified<_, StandardInquiryData>> =
            LayoutVerified::new_unaligned(&raw[..]);
        let data = data.ok_or(ErrorKind::Protocol)?;
        Ok(InquiryResponse {
            peripheral_qualifier: data.peripheral >> 5,
            peripheral_device_type: data.peripheral & 0x1f,
            removable: data.removable & 0x80 != 0,
            version: data.version,
            response_data_format: data.response_data_format & 0x0f,
            vendor_id: data.vendor_id,
            product_id: data.product_id,
            product_revision: data.product_revision,
        })
    }

    /// Qualifier 0 with device type 0: a connected direct-access block device.
    pub fn is_direct_access(&self) -> bool {
        self.peripheral_qualifier == 0 && self.peripheral_device_type == PERIPHERAL_DIRECT_ACCESS
    }

    pub fn vendor(&self) -> &str {
        ascii_field(&self.vendor_id)
    }

    pub fn product(&self) -> &str {
        ascii_field(&self.product_id)
    }

    pub fn revision(&self) -> &str {
        ascii_field(&self.product_revision)
    }
}

fn ascii_field(field: &[u8]) -> &str {
    core::str::from_utf8(field)
        .map(|s| s.trim_end_matches(|c: char| c == ' ' || c == '\0'))
        .unwrap_or("")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseKey {
    NoSense,
    RecoveredError,
    NotReady,
    MediumError,
    HardwareError,
    IllegalRequest,
    UnitAttention,
    DataProtect,
    BlankCheck,
    VendorSpecific,
    CopyAborted,
    AbortedCommand,
    Reserved,
    VolumeOverflow,
    Miscompare,
    Completed,
}

impl SenseKey {
    pub fn from_nibble(key: u8) -> Self {
        match key & 0x0f {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0x9 => SenseKey::VendorSpecific,
            0xa => SenseKey::CopyAborted,
            0xb => SenseKey::AbortedCommand,
            0xc => SenseKey::Reserved,
            0xd => SenseKey::VolumeOverflow,
            0xe => SenseKey::Miscompare,
            _ => SenseKey::Completed,
        }
    }
}

#[derive(AsBytes, FromBytes, Unaligned, Clone)]
#[repr(C)]
struct FixedSenseData {
    response_code: u8,
    obsolete: u8,
    flags: u8,
    information: U32<BigEndian>,
    additional_length: u8,
    command_specific: U32<BigEndian>,
    asc: u8,
    ascq: u8,
    fru_code: u8,
    sense_key_specific: [u8; 3],
}

const SENSE_FIXED_CURRENT: u8 = 0x70;
const SENSE_FIXED_DEFERRED: u8 = 0x71;
const SENSE_DESC_CURRENT: u8 = 0x72;
const SENSE_DESC_DEFERRED: u8 = 0x73;

/// Decoded REQUEST SENSE data, kept for diagnostics on a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub response_code: u8,
    pub sense_key: SenseKey,
    /// Additional sense code.
    pub asc: u8,
    /// Additional sense code qualifier.
    pub ascq: u8,
}

impl SenseData {
    /// Parse fixed (0x70/0x71) or descriptor (0x72/0x73) format sense data.
    pub fn parse(bytes: &[u8]) -> Result<Self, ErrorKind> {
        let response_code = match bytes.first() {
            Some(code) => code & 0x7f,
            None => return Err(ErrorKind::Protocol),
        };
        match response_code {
            SENSE_FIXED_CURRENT | SENSE_FIXED_DEFERRED => {
                if bytes.len() < 14 {
                    warn!("fixed sense data has only {} bytes", bytes.len());
                    return Err(ErrorKind::Protocol);
                }
                let mut raw = [0u8; SENSE_LEN as usize];
                let len = core::cmp::min(bytes.len(), raw.len());
                raw[..len].copy_from_slice(&bytes[..len]);
                let data: Option<LayoutVerified<_, FixedSenseData>> =
                    LayoutVerified::new_unaligned(&raw[..]);
                let data = data.ok_or(ErrorKind::Protocol)?;
                Ok(SenseData {
                    response_code,
                    sense_key: SenseKey::from_nibble(data.flags),
                    asc: data.asc,
                    ascq: data.ascq,
                })
            }
            SENSE_DESC_CURRENT | SENSE_DESC_DEFERRED => {
                if bytes.len() < 4 {
                    return Err(ErrorKind::Protocol);
                }
                Ok(SenseData {
                    response_code,
                    sense_key: SenseKey::from_nibble(bytes[1]),
                    asc: bytes[2],
                    ascq: bytes[3],
                })
            }
            other => {
                debug!("unknown sense response code {:#04x}", other);
                Err(ErrorKind::Protocol)
            }
        }
    }

    /// Sense data used when REQUEST SENSE itself could not be completed.
    pub fn unavailable() -> Self {
        SenseData {
            response_code: 0,
            sense_key: SenseKey::NoSense,
            asc: 0,
            ascq: 0,
        }
    }
}

#[derive(AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct ModeParameterHeader6 {
    mode_data_length: u8,
    medium_type: u8,
    device_specific: u8,
    block_descriptor_length: u8,
}

/// Header of a MODE SENSE(6) response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeParameterHeader {
    pub medium_type: u8,
    pub device_specific: u8,
}

impl ModeParameterHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ErrorKind> {
        let header = bytes.get(..4).ok_or(ErrorKind::Protocol)?;
        let header: Option<LayoutVerified<_, ModeParameterHeader6>> =
            LayoutVerified::new_unaligned(header);
        let header = header.ok_or(ErrorKind::Protocol)?;
        Ok(ModeParameterHeader {
            medium_type: header.medium_type,
            device_specific: header.device_specific,
        })
    }

    pub fn write_protected(&self) -> bool {
        self.device_specific & 0x80 != 0
    }
}
