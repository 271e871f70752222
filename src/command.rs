use log::{error, warn};

use crate::cbw::{encode_command, Direction, CBW_LEN, MAX_CDB_LEN};
use crate::config::DriverConfig;
use crate::csw::{CommandStatus, CommandStatusWrapper};
use crate::error::ErrorKind;
use crate::scsi::Cdb;
use crate::transport::{ControlTransport, Endpoint, TransportError};

/// Progress of the command currently on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CommandSent,
    DataPhase,
    StatusReceived,
    Complete,
    Error,
}

/// A SCSI command together with the data phase it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cdb: [u8; MAX_CDB_LEN],
    cdb_len: u8,
    direction: Direction,
    data_length: u32,
}

impl Command {
    pub fn new<C: Cdb>(cdb: &C, direction: Direction, data_length: u32) -> Self {
        let bytes = cdb.as_bytes();
        let len = core::cmp::min(bytes.len(), MAX_CDB_LEN);
        let mut raw = [0u8; MAX_CDB_LEN];
        raw[..len].copy_from_slice(&bytes[..len]);
        Command {
            cdb: raw,
            cdb_len: len as u8,
            direction,
            data_length,
        }
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }

    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn data_length(&self) -> usize {
        self.data_length as usize
    }

    pub(crate) fn wrap(&self, tag: u32, lun: u8) -> Result<[u8; CBW_LEN], ErrorKind> {
        encode_command(tag, self.data_length, self.direction, lun, self.cdb())
    }
}

/// Buffer for the data phase of a command.
#[derive(Debug)]
pub enum DataBuffer<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl DataBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::None => 0,
            DataBuffer::In(buf) => buf.len(),
            DataBuffer::Out(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this buffer can serve the data phase `command` expects.
    pub(crate) fn fits(&self, command: &Command) -> bool {
        let direction_ok = match (self, command.direction()) {
            (DataBuffer::None, _) => command.data_length() == 0,
            (DataBuffer::In(_), Direction::In) | (DataBuffer::Out(_), Direction::Out) => true,
            _ => false,
        };
        direction_ok && self.len() >= command.data_length()
    }
}

/// Something that runs one SCSI command to completion, recovery included.
pub trait CommandExecutor {
    fn config(&self) -> &DriverConfig;
    /// Returns the number of bytes moved in the data phase.
    fn execute(&mut self, command: &Command, data: DataBuffer<'_>) -> Result<usize, ErrorKind>;
}

/// Why one attempt at a command did not finish with GOOD status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    Transport(TransportError),
    PhaseError,
    Protocol,
    Failed,
}

impl From<TransportError> for Failure {
    fn from(err: TransportError) -> Self {
        Failure::Transport(err)
    }
}

/// What the driver does after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    /// Reset recovery, then run the command again with a fresh tag.
    RecoverAndRetry,
    /// Reset recovery, then report the error.
    RecoverAndFail(ErrorKind),
    /// Fetch sense data and report a command error.
    RequestSense,
}

/// Attempts allowed per logical operation, including the first.
pub(crate) const MAX_ATTEMPTS: u8 = 2;

pub(crate) fn next_action(failure: Failure, attempt: u8) -> Action {
    match failure {
        Failure::Failed => Action::RequestSense,
        Failure::Protocol => Action::RecoverAndFail(ErrorKind::Protocol),
        Failure::Transport(_) | Failure::PhaseError if attempt + 1 < MAX_ATTEMPTS => {
            Action::RecoverAndRetry
        }
        Failure::Transport(_) | Failure::PhaseError => {
            error!("{:?} after retry, abandoning operation", failure);
            Action::RecoverAndFail(ErrorKind::Device)
        }
    }
}

/// Turn a validated CSW into the number of bytes the device moved.
pub(crate) fn transferred(csw: &CommandStatusWrapper, requested: usize) -> Result<usize, Failure> {
    let residue = csw.data_residue() as usize;
    if residue > requested {
        warn!("csw residue {} exceeds requested {}", residue, requested);
        return Err(Failure::Protocol);
    }
    match csw.status() {
        CommandStatus::Good => Ok(requested - residue),
        CommandStatus::Failed => Err(Failure::Failed),
        CommandStatus::PhaseError => Err(Failure::PhaseError),
    }
}

/// Bulk-Only Mass Storage Reset followed by clear-halt on both endpoints.
pub(crate) fn reset_recovery<T: ControlTransport>(transport: &mut T) -> Result<(), ErrorKind> {
    warn!("performing bulk-only reset recovery");
    reset_sequence(transport).map_err(|e| {
        error!("reset recovery failed: {}", e);
        ErrorKind::Device
    })
}

fn reset_sequence<T: ControlTransport>(transport: &mut T) -> Result<(), TransportError> {
    transport.bulk_only_reset()?;
    transport.clear_halt(Endpoint::BulkIn)?;
    transport.clear_halt(Endpoint::BulkOut)
}
