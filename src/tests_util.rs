use std::collections::VecDeque;
use std::convert::TryFrom;
use std::vec;
use std::vec::Vec;

use log::trace;
use zerocopy::AsBytes;

use crate::cbw::{CommandBlockWrapper, Direction, CBW_LEN};
use crate::csw::{CommandStatus, CommandStatusWrapper, CSW_LEN};
use crate::scsi::{self, SenseKey};
use crate::transport::{
    AsyncBulkTransport, BulkTransport, Completion, ControlTransport, Endpoint, Transfer,
    TransportError,
};

pub(crate) fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Misbehaviour injected into the next command with a matching opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    PhaseError,
    StallData,
    StallStatus,
    /// Move this many bytes fewer than asked and report them as residue.
    Residue(u32),
    /// Move this many bytes fewer than asked but report no residue.
    ShortData(u32),
    BadTag,
    BadSignature,
    /// Report a few bytes more than the CSW actually holds.
    LongStatus,
    Failed(SenseKey, u8, u8),
}

#[derive(Debug)]
struct Status {
    csw: [u8; CSW_LEN],
    stall: bool,
    long: bool,
}

#[derive(Debug)]
enum State {
    AwaitCbw,
    DataIn {
        data: Vec<u8>,
        pos: usize,
        stall: bool,
        status: Status,
    },
    DataOut {
        /// `None` discards the data.
        offset: Option<usize>,
        expected: usize,
        received: Vec<u8>,
        stall: bool,
        status: Status,
    },
    Status(Status),
}

pub(crate) struct SimDevice {
    pub(crate) storage: Vec<u8>,
    pub(crate) block_size: usize,
    pub(crate) peripheral: u8,
    pub(crate) write_protected: bool,
    pub(crate) fail_reset: bool,
    /// Number of upcoming async completions delivered without a buffer.
    pub(crate) drop_buffers: usize,

    pub(crate) tags: Vec<u32>,
    pub(crate) opcodes: Vec<u8>,
    pub(crate) resets: usize,
    pub(crate) clear_halts: Vec<Endpoint>,

    faults: Vec<(u8, Fault)>,
    state: State,
    halted: bool,
    sense: Option<(SenseKey, u8, u8)>,
    completions: VecDeque<Completion>,
}

impl SimDevice {
    pub(crate) fn new(num_blocks: usize, block_size: usize) -> Self {
        SimDevice {
            storage: vec![0u8; num_blocks * block_size],
            block_size,
            peripheral: 0,
            write_protected: false,
            fail_reset: false,
            drop_buffers: 0,
            tags: Vec::new(),
            opcodes: Vec::new(),
            resets: 0,
            clear_halts: Vec::new(),
            faults: Vec::new(),
            state: State::AwaitCbw,
            halted: false,
            sense: None,
            completions: VecDeque::new(),
        }
    }

    pub(crate) fn inject(&mut self, opcode: u8, fault: Fault) {
        self.faults.push((opcode, fault));
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.storage.len() / self.block_size
    }

    /// Forget the commands seen so far, e.g. those issued by `init`.
    pub(crate) fn clear_log(&mut self) {
        self.tags.clear();
        self.opcodes.clear();
    }

    fn take_fault(&mut self, opcode: u8) -> Option<Fault> {
        let idx = self.faults.iter().position(|(op, _)| *op == opcode)?;
        Some(self.faults.remove(idx).1)
    }

    fn inquiry_data(&self) -> Vec<u8> {
        let mut data = vec![0u8; 36];
        data[0] = self.peripheral;
        data[1] = 0x80;
        data[2] = 0x04;
        data[3] = 0x02;
        data[4] = 31;
        data[8..16].copy_from_slice(b"SIMULATE");
        data[16..32].copy_from_slice(b"Flash Disk      ");
        data[32..36].copy_from_slice(b"1.00");
        data
    }

    fn sense_data(&mut self) -> Vec<u8> {
        let (key, asc, ascq) = self.sense.take().unwrap_or((SenseKey::NoSense, 0, 0));
        let mut data = vec![0u8; 18];
        data[0] = 0x70;
        data[2] = key as u8;
        data[7] = 10;
        data[12] = asc;
        data[13] = ascq;
        data
    }

    /// Byte range of a READ(10)/WRITE(10), if it fits the medium.
    fn block_range(&self, cdb: &[u8]) -> Option<(usize, usize)> {
        let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
        let count = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
        if lba + count > self.num_blocks() {
            None
        } else {
            Some((lba * self.block_size, count * self.block_size))
        }
    }

    /// Report FAILED. The data phase still runs: an IN command gets a zero
    /// length packet and OUT data is discarded.
    fn failed(&mut self, cbw: &CommandBlockWrapper, sense: (SenseKey, u8, u8)) -> State {
        self.sense = Some(sense);
        let length = cbw.data_transfer_length() as usize;
        let status = make_status(cbw.tag(), length, CommandStatus::Failed, None);
        match cbw.direction() {
            _ if length == 0 => State::Status(status),
            Direction::In => State::DataIn {
                data: Vec::new(),
                pos: 0,
                stall: false,
                status,
            },
            Direction::Out => State::DataOut {
                offset: None,
                expected: length,
                received: Vec::new(),
                stall: false,
                status,
            },
        }
    }

    fn process(&mut self, cbw: &CommandBlockWrapper) -> State {
        let tag = cbw.tag();
        let length = cbw.data_transfer_length() as usize;
        let cdb = cbw.cdb().to_vec();
        let opcode = cdb[0];
        self.tags.push(tag);
        self.opcodes.push(opcode);
        trace!("sim: cbw tag {} opcode {:#04x} len {}", tag, opcode, length);

        let fault = self.take_fault(opcode);
        if let Some(Fault::Failed(key, asc, ascq)) = fault {
            return self.failed(cbw, (key, asc, ascq));
        }
        let short = match fault {
            Some(Fault::Residue(short)) | Some(Fault::ShortData(short)) => short as usize,
            _ => 0,
        };
        let stall_data = fault == Some(Fault::StallData);

        let mut data = match opcode {
            scsi::INQUIRY => self.inquiry_data(),
            scsi::TEST_UNIT_READY => Vec::new(),
            scsi::REQUEST_SENSE => self.sense_data(),
            scsi::READ_CAPACITY_10 => {
                let last_lba = (self.num_blocks() - 1) as u32;
                let mut data = last_lba.to_be_bytes().to_vec();
                data.extend_from_slice(&(self.block_size as u32).to_be_bytes());
                data
            }
            scsi::MODE_SENSE_6 => vec![3, 0, if self.write_protected { 0x80 } else { 0 }, 0],
            scsi::READ_10 => match self.block_range(&cdb) {
                Some((offset, len)) => self.storage[offset..offset + len].to_vec(),
                None => return self.failed(cbw, (SenseKey::IllegalRequest, 0x21, 0)),
            },
            scsi::WRITE_10 => {
                if self.write_protected {
                    return self.failed(cbw, (SenseKey::DataProtect, 0x27, 0));
                }
                return match self.block_range(&cdb) {
                    Some((offset, _)) => State::DataOut {
                        offset: Some(offset),
                        expected: length,
                        received: Vec::new(),
                        stall: stall_data,
                        status: make_status(tag, short, CommandStatus::Good, fault),
                    },
                    None => self.failed(cbw, (SenseKey::IllegalRequest, 0x21, 0)),
                };
            }
            _ => return self.failed(cbw, (SenseKey::IllegalRequest, 0x20, 0)),
        };

        data.truncate(length);
        let residue = match fault {
            Some(Fault::ShortData(_)) => length - data.len(),
            _ => length - data.len().saturating_sub(short),
        };
        data.truncate(data.len().saturating_sub(short));
        let status = make_status(tag, residue, CommandStatus::Good, fault);
        if length == 0 {
            State::Status(status)
        } else {
            State::DataIn {
                data,
                pos: 0,
                stall: stall_data,
                status,
            }
        }
    }
}

fn make_status(tag: u32, residue: usize, status: CommandStatus, fault: Option<Fault>) -> Status {
    let status = if fault == Some(Fault::PhaseError) {
        CommandStatus::PhaseError
    } else {
        status
    };
    let tag = if fault == Some(Fault::BadTag) {
        tag.wrapping_add(1)
    } else {
        tag
    };
    let mut csw = [0u8; CSW_LEN];
    csw.copy_from_slice(CommandStatusWrapper::new(tag, residue as u32, status).as_bytes());
    if fault == Some(Fault::BadSignature) {
        csw[3] = b'X';
    }
    Status {
        csw,
        stall: fault == Some(Fault::StallStatus),
        long: fault == Some(Fault::LongStatus),
    }
}

impl ControlTransport for SimDevice {
    fn bulk_only_reset(&mut self) -> Result<(), TransportError> {
        if self.fail_reset {
            return Err(TransportError::Stall);
        }
        self.resets += 1;
        self.state = State::AwaitCbw;
        Ok(())
    }

    fn clear_halt(&mut self, endpoint: Endpoint) -> Result<(), TransportError> {
        self.clear_halts.push(endpoint);
        self.halted = false;
        Ok(())
    }
}

impl BulkTransport for SimDevice {
    fn bulk_out(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.halted {
            return Err(TransportError::Stall);
        }
        match std::mem::replace(&mut self.state, State::AwaitCbw) {
            State::AwaitCbw => {
                if data.len() != CBW_LEN {
                    self.halted = true;
                    return Err(TransportError::Stall);
                }
                let cbw = CommandBlockWrapper::try_from(data).map_err(|_| TransportError::Stall)?;
                self.state = self.process(&cbw);
                Ok(data.len())
            }
            State::DataOut {
                offset,
                expected,
                mut received,
                stall,
                status,
            } => {
                if stall {
                    self.halted = true;
                    return Err(TransportError::Stall);
                }
                let len = std::cmp::min(data.len(), expected - received.len());
                received.extend_from_slice(&data[..len]);
                if received.len() == expected {
                    if let Some(offset) = offset {
                        self.storage[offset..offset + expected].copy_from_slice(&received);
                    }
                    self.state = State::Status(status);
                } else {
                    self.state = State::DataOut {
                        offset,
                        expected,
                        received,
                        stall,
                        status,
                    };
                }
                Ok(len)
            }
            other => {
                self.state = other;
                self.halted = true;
                Err(TransportError::Stall)
            }
        }
    }

    fn bulk_in(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.halted {
            return Err(TransportError::Stall);
        }
        match std::mem::replace(&mut self.state, State::AwaitCbw) {
            State::DataIn {
                data,
                pos,
                stall,
                status,
            } => {
                if stall {
                    self.halted = true;
                    return Err(TransportError::Stall);
                }
                let len = std::cmp::min(buf.len(), data.len() - pos);
                buf[..len].copy_from_slice(&data[pos..pos + len]);
                if pos + len == data.len() {
                    self.state = State::Status(status);
                } else {
                    self.state = State::DataIn {
                        data,
                        pos: pos + len,
                        stall,
                        status,
                    };
                }
                Ok(len)
            }
            State::Status(status) => {
                if status.stall {
                    self.halted = true;
                    return Err(TransportError::Stall);
                }
                if buf.len() < CSW_LEN {
                    return Err(TransportError::Overflow);
                }
                buf[..CSW_LEN].copy_from_slice(&status.csw);
                if status.long {
                    Ok(CSW_LEN + 3)
                } else {
                    Ok(CSW_LEN)
                }
            }
            other => {
                self.state = other;
                self.halted = true;
                Err(TransportError::Stall)
            }
        }
    }
}

impl AsyncBulkTransport for SimDevice {
    fn submit(&mut self, transfer: Transfer) -> Result<(), TransportError> {
        let endpoint = transfer.endpoint();
        let completion = match transfer {
            Transfer::Out(data) => match self.bulk_out(&data) {
                Ok(len) => Completion::new(endpoint, Some(data), len as i32),
                Err(err) => Completion::failed(endpoint, err),
            },
            Transfer::In(len) => {
                let mut buf = vec![0u8; len];
                match self.bulk_in(&mut buf) {
                    Ok(len) => {
                        buf.truncate(len);
                        Completion::new(endpoint, Some(buf), len as i32)
                    }
                    Err(err) => Completion::failed(endpoint, err),
                }
            }
        };
        let completion = if self.drop_buffers > 0 {
            self.drop_buffers -= 1;
            Completion::new(completion.endpoint, None, completion.result)
        } else {
            completion
        };
        self.completions.push_back(completion);
        Ok(())
    }

    fn wait_completion(&mut self) -> Completion {
        self.completions
            .pop_front()
            .unwrap_or_else(|| Completion::failed(Endpoint::BulkIn, TransportError::Timeout))
    }
}

