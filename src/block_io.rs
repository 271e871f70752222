use log::{debug, info, warn};

use crate::cbw::Direction;
use crate::command::{Command, CommandExecutor, DataBuffer};
use crate::error::ErrorKind;
use crate::scsi::{self, Capacity, InquiryResponse, ModeParameterHeader, SenseData};
use crate::storage::{check_request, Geometry, LbaId};

/// INQUIRY, TEST UNIT READY, READ CAPACITY(10) and MODE SENSE(6), in that
/// order.
pub(crate) fn identify<E: CommandExecutor>(
    exec: &mut E,
) -> Result<(InquiryResponse, Geometry), ErrorKind> {
    let inquiry = inquiry(exec)?;
    if !inquiry.is_direct_access() {
        warn!(
            "unsupported peripheral qualifier {} device type {:#04x}",
            inquiry.peripheral_qualifier, inquiry.peripheral_device_type
        );
        return Err(ErrorKind::Unsupported);
    }

    wait_until_ready(exec)?;

    let capacity = read_capacity(exec)?;
    if capacity.block_size == 0 || !capacity.block_size.is_power_of_two() {
        warn!("unsupported block size {}", capacity.block_size);
        return Err(ErrorKind::Unsupported);
    }

    let read_only = write_protected(exec)?;
    let geometry = Geometry {
        block_size: capacity.block_size as usize,
        num_blocks: capacity.block_count(),
        read_only,
    };
    info!(
        "{} {} rev {}: {} blocks of {} bytes{}",
        inquiry.vendor(),
        inquiry.product(),
        inquiry.revision(),
        geometry.num_blocks,
        geometry.block_size,
        if read_only { ", write protected" } else { "" }
    );
    Ok((inquiry, geometry))
}

fn inquiry<E: CommandExecutor>(exec: &mut E) -> Result<InquiryResponse, ErrorKind> {
    let mut buf = [0u8; scsi::INQUIRY_LEN as usize];
    let command = Command::new(
        &scsi::inquiry(scsi::INQUIRY_LEN as u16),
        Direction::In,
        buf.len() as u32,
    );
    let len = exec.execute(&command, DataBuffer::In(&mut buf))?;
    InquiryResponse::parse(&buf[..len])
}

fn wait_until_ready<E: CommandExecutor>(exec: &mut E) -> Result<(), ErrorKind> {
    let retries = exec.config().ready_retries;
    let command = Command::new(&scsi::test_unit_ready(), Direction::Out, 0);
    let mut attempt = 0;
    loop {
        match exec.execute(&command, DataBuffer::None) {
            Ok(_) => return Ok(()),
            Err(ErrorKind::Command(sense)) if attempt < retries => {
                warn!("unit not ready: {:?}", sense.sense_key);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn read_capacity<E: CommandExecutor>(exec: &mut E) -> Result<Capacity, ErrorKind> {
    let mut buf = [0u8; scsi::READ_CAPACITY_LEN];
    let command = Command::new(&scsi::read_capacity_10(), Direction::In, buf.len() as u32);
    let len = exec.execute(&command, DataBuffer::In(&mut buf))?;
    Capacity::parse(&buf[..len])
}

/// A device that rejects MODE SENSE is treated as writable.
fn write_protected<E: CommandExecutor>(exec: &mut E) -> Result<bool, ErrorKind> {
    let mut buf = [0u8; scsi::MODE_SENSE_LEN as usize];
    let command = Command::new(
        &scsi::mode_sense_6(scsi::MODE_PAGE_ALL, scsi::MODE_SENSE_LEN),
        Direction::In,
        buf.len() as u32,
    );
    match exec.execute(&command, DataBuffer::In(&mut buf)) {
        Ok(len) => Ok(ModeParameterHeader::parse(&buf[..len])
            .map(|header| header.write_protected())
            .unwrap_or(false)),
        Err(ErrorKind::Command(sense)) => {
            debug!("mode sense rejected: {:?}", sense.sense_key);
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Decode the REQUEST SENSE reply that follows a FAILED status. Unusable
/// data yields [`SenseData::unavailable`].
pub(crate) fn parse_sense(bytes: &[u8]) -> SenseData {
    SenseData::parse(bytes).unwrap_or_else(|_| {
        warn!("no usable sense data in {} bytes", bytes.len());
        SenseData::unavailable()
    })
}

pub(crate) fn request_sense_command() -> Command {
    Command::new(
        &scsi::request_sense(scsi::SENSE_LEN),
        Direction::In,
        scsi::SENSE_LEN as u32,
    )
}

/// Split a request into READ(10)/WRITE(10) commands and run them in order,
/// stopping after the first command that moves less than asked.
fn transfer_blocks<E, F>(
    exec: &mut E,
    geometry: &Geometry,
    lba: LbaId,
    len: usize,
    mut run: F,
) -> Result<usize, ErrorKind>
where
    E: CommandExecutor,
    F: FnMut(&mut E, u32, u16, core::ops::Range<usize>) -> Result<usize, ErrorKind>,
{
    let blocks = check_request(Some(geometry), lba, len)?;
    let block_size = geometry.block_size;
    let per_command = exec.config().max_blocks_per_command(block_size) as u64;

    let mut done = 0u64;
    let mut total = 0usize;
    while done < blocks {
        let count = core::cmp::min(per_command, blocks - done);
        let start = (lba.0 as u64 + done) as u32;
        let range = done as usize * block_size..(done + count) as usize * block_size;
        let expected = range.len();

        let moved = run(exec, start, count as u16, range)?;
        total += moved;
        if moved < expected {
            debug!(
                "short transfer at lba {}: {} of {} bytes",
                start, moved, expected
            );
            break;
        }
        done += count;
    }
    Ok(total)
}

pub(crate) fn read<E: CommandExecutor>(
    exec: &mut E,
    geometry: &Geometry,
    lba: LbaId,
    data: &mut [u8],
) -> Result<usize, ErrorKind> {
    transfer_blocks(exec, geometry, lba, data.len(), |exec, start, count, range| {
        let command = Command::new(
            &scsi::read_10(start, count),
            Direction::In,
            range.len() as u32,
        );
        exec.execute(&command, DataBuffer::In(&mut data[range]))
    })
}

pub(crate) fn write<E: CommandExecutor>(
    exec: &mut E,
    geometry: &Geometry,
    lba: LbaId,
    data: &[u8],
) -> Result<usize, ErrorKind> {
    if geometry.read_only {
        return Err(ErrorKind::ReadOnly);
    }
    transfer_blocks(exec, geometry, lba, data.len(), |exec, start, count, range| {
        let command = Command::new(
            &scsi::write_10(start, count),
            Direction::Out,
            range.len() as u32,
        );
        exec.execute(&command, DataBuffer::Out(&data[range]))
    })
}
