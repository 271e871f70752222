use alloc::vec::Vec;

use log::{debug, error, trace, warn};

use crate::block_io;
use crate::cbw::{Direction, CBW_LEN, MAX_LUN};
use crate::command::{
    next_action, reset_recovery, transferred, Action, Command, CommandExecutor, DataBuffer,
    Failure, Phase,
};
use crate::config::DriverConfig;
use crate::csw::{decode_status, CSW_LEN};
use crate::error::ErrorKind;
use crate::scsi::{self, InquiryResponse, SenseData};
use crate::storage::{check_request, BlockDevice, Geometry, LbaId};
use crate::transport::{AsyncBulkTransport, Completion, Endpoint, Transfer, TransportError};
use crate::util::TagGenerator;

/// Result of a completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Bytes received in the data phase; empty for OUT commands.
    pub data: Vec<u8>,
    /// Requested length minus the residue the device reported.
    pub transferred: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Command,
    DataIn { asked: usize },
    DataOut { asked: usize },
    Status,
}

impl Stage {
    fn endpoint(&self) -> Endpoint {
        match self {
            Stage::Command | Stage::DataOut { .. } => Endpoint::BulkOut,
            Stage::DataIn { .. } | Stage::Status => Endpoint::BulkIn,
        }
    }
}

struct InFlight {
    command: Command,
    tag: u32,
    attempt: u8,
    stage: Stage,
    /// Payload of an OUT command.
    out_data: Vec<u8>,
    /// Bytes received so far by an IN command.
    in_data: Vec<u8>,
    sent: usize,
    /// This is the REQUEST SENSE issued after a FAILED status.
    sensing: bool,
}

impl InFlight {
    fn new(command: Command, out_data: Vec<u8>, sensing: bool) -> Self {
        InFlight {
            command,
            tag: 0,
            attempt: 0,
            stage: Stage::Command,
            out_data,
            in_data: Vec::new(),
            sent: 0,
            sensing,
        }
    }
}

/// Completion-driven driver. Transitions take `&mut self` and must run in
/// the context that owns the driver; completions produced on a transport
/// thread are forwarded there and passed to `on_completion`.
pub struct AsyncScsiBlockDevice<T: AsyncBulkTransport> {
    transport: T,
    config: DriverConfig,
    tags: TagGenerator,
    phase: Phase,
    in_flight: Option<InFlight>,
    inquiry: Option<InquiryResponse>,
    geometry: Option<Geometry>,
}

impl<T: AsyncBulkTransport> AsyncScsiBlockDevice<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, DriverConfig::default())
    }

    pub fn with_config(transport: T, config: DriverConfig) -> Self {
        AsyncScsiBlockDevice {
            transport,
            config,
            tags: TagGenerator::new(),
            phase: Phase::Idle,
            in_flight: None,
            inquiry: None,
            geometry: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub fn inquiry(&self) -> Option<&InquiryResponse> {
        self.inquiry.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Start `command`. `data` carries the payload of an OUT command and must
    /// be `None` otherwise.
    pub fn submit_command(
        &mut self,
        command: Command,
        data: Option<Vec<u8>>,
    ) -> Result<(), ErrorKind> {
        if self.in_flight.is_some() {
            return Err(ErrorKind::Busy);
        }
        if self.config.lun > MAX_LUN {
            return Err(ErrorKind::InvalidParameter);
        }
        let out_data = match (command.direction(), data) {
            (Direction::Out, Some(data)) if data.len() >= command.data_length() => data,
            (_, None) if command.direction() == Direction::In || command.data_length() == 0 => {
                Vec::new()
            }
            _ => return Err(ErrorKind::InvalidParameter),
        };

        debug!("submit command {:#04x}", command.opcode());
        self.launch(InFlight::new(command, out_data, false)).map(|_| ())
    }

    /// Start a READ(10) of `blocks` blocks at `lba`.
    pub fn submit_read(&mut self, lba: LbaId, blocks: u16) -> Result<(), ErrorKind> {
        let geometry = self.geometry.ok_or(ErrorKind::NotInitialized)?;
        let len = blocks as usize * geometry.block_size;
        check_request(Some(&geometry), lba, len)?;
        let command = Command::new(&scsi::read_10(lba.0, blocks), Direction::In, len as u32);
        self.submit_command(command, None)
    }

    /// Start a WRITE(10) of `data`, a whole number of blocks, at `lba`.
    pub fn submit_write(&mut self, lba: LbaId, data: Vec<u8>) -> Result<(), ErrorKind> {
        let geometry = self.geometry.ok_or(ErrorKind::NotInitialized)?;
        if geometry.read_only {
            return Err(ErrorKind::ReadOnly);
        }
        let blocks = check_request(Some(&geometry), lba, data.len())?;
        if blocks > u16::MAX as u64 {
            return Err(ErrorKind::InvalidParameter);
        }
        let command = Command::new(
            &scsi::write_10(lba.0, blocks as u16),
            Direction::Out,
            data.len() as u32,
        );
        self.submit_command(command, Some(data))
    }

    /// Apply one transfer completion.
    ///
    /// `Ok(None)` means the next transfer of the operation has been
    /// submitted, `Ok(Some(_))` that the operation finished. On `Err` the
    /// operation is over and the driver is idle again.
    pub fn on_completion(
        &mut self,
        completion: Completion,
    ) -> Result<Option<Outcome>, ErrorKind> {
        let stage = match self.in_flight.as_ref() {
            Some(op) => op.stage,
            None => {
                warn!("completion on {:?} with nothing in flight", completion.endpoint);
                return Err(ErrorKind::Protocol);
            }
        };
        if completion.endpoint != stage.endpoint() {
            warn!(
                "completion on {:?} while waiting on {:?}",
                completion.endpoint,
                stage.endpoint()
            );
            return self.fail(Failure::Protocol);
        }
        let (len, buffer) = match completion.into_result() {
            Ok(result) => result,
            Err(err) => return self.fail(Failure::Transport(err)),
        };

        match self.advance(stage, len, buffer) {
            Ok(outcome) => outcome,
            Err(failure) => self.fail(failure),
        }
    }

    /// Block on the transport until the in-flight operation finishes.
    pub fn run_to_completion(&mut self) -> Result<Outcome, ErrorKind> {
        if self.in_flight.is_none() {
            return Err(ErrorKind::InvalidParameter);
        }
        loop {
            let completion = self.transport.wait_completion();
            if let Some(outcome) = self.on_completion(completion)? {
                return Ok(outcome);
            }
        }
    }

    /// Move the in-flight operation one stage forward after a successful
    /// transfer of `len` bytes.
    fn advance(
        &mut self,
        stage: Stage,
        len: usize,
        buffer: Vec<u8>,
    ) -> Result<Result<Option<Outcome>, ErrorKind>, Failure> {
        let max_bulk = self.config.max_bulk_transfer.max(1);
        let op = match self.in_flight.as_mut() {
            Some(op) => op,
            None => return Err(Failure::Protocol),
        };
        let requested = op.command.data_length();

        let (next_stage, next) = match stage {
            Stage::Command => {
                if len != CBW_LEN {
                    warn!("cbw write moved {} bytes", len);
                    return Err(Failure::Transport(TransportError::Io));
                }
                let asked = core::cmp::min(requested, max_bulk);
                if requested == 0 {
                    (Stage::Status, Transfer::In(CSW_LEN))
                } else if op.command.direction() == Direction::In {
                    (Stage::DataIn { asked }, Transfer::In(asked))
                } else {
                    let chunk = op.out_data[..asked].to_vec();
                    (Stage::DataOut { asked }, Transfer::Out(chunk))
                }
            }
            Stage::DataIn { asked } => {
                let len = core::cmp::min(len, buffer.len());
                op.in_data.extend_from_slice(&buffer[..len]);
                let remaining = requested.saturating_sub(op.in_data.len());
                if len < asked || remaining == 0 {
                    trace!("data in {} of {} bytes", op.in_data.len(), requested);
                    (Stage::Status, Transfer::In(CSW_LEN))
                } else {
                    let asked = core::cmp::min(remaining, max_bulk);
                    (Stage::DataIn { asked }, Transfer::In(asked))
                }
            }
            Stage::DataOut { .. } => {
                if len == 0 {
                    return Err(Failure::Transport(TransportError::Io));
                }
                op.sent += len;
                if op.sent < requested {
                    let asked = core::cmp::min(requested - op.sent, max_bulk);
                    let chunk = op.out_data[op.sent..op.sent + asked].to_vec();
                    (Stage::DataOut { asked }, Transfer::Out(chunk))
                } else {
                    (Stage::Status, Transfer::In(CSW_LEN))
                }
            }
            Stage::Status => {
                self.phase = Phase::StatusReceived;
                let csw = decode_status(&buffer[..len.min(buffer.len())], op.tag)
                    .map_err(|_| Failure::Protocol)?;
                let moved = transferred(&csw, requested)?;
                let received = match op.command.direction() {
                    Direction::In => op.in_data.len(),
                    Direction::Out => op.sent,
                };
                if received < moved {
                    warn!("csw claims {} bytes, data phase moved {}", moved, received);
                }
                return Ok(self.finish(moved.min(received)));
            }
        };

        op.stage = next_stage;
        if next_stage != Stage::Status {
            self.phase = Phase::DataPhase;
        }
        self.transport.submit(next)?;
        Ok(Ok(None))
    }

    fn finish(&mut self, moved: usize) -> Result<Option<Outcome>, ErrorKind> {
        self.phase = Phase::Complete;
        let op = match self.in_flight.take() {
            Some(op) => op,
            None => return Err(ErrorKind::Protocol),
        };
        self.phase = Phase::Idle;
        if op.sensing {
            let sense = block_io::parse_sense(&op.in_data[..moved.min(op.in_data.len())]);
            debug!("sense {:?}", sense);
            return Err(ErrorKind::Command(sense));
        }
        Ok(Some(Outcome {
            data: op.in_data,
            transferred: moved,
        }))
    }

    /// Send the CBW of `op` under a fresh tag.
    fn launch(&mut self, mut op: InFlight) -> Result<Option<Outcome>, ErrorKind> {
        op.tag = self.tags.next_tag();
        op.stage = Stage::Command;
        op.sent = 0;
        op.in_data.clear();
        let cbw = op
            .command
            .wrap(op.tag, self.config.lun)
            .map_err(|_| ErrorKind::InvalidParameter)?;
        self.in_flight = Some(op);
        self.phase = Phase::CommandSent;
        match self.transport.submit(Transfer::Out(cbw.to_vec())) {
            Ok(()) => Ok(None),
            Err(err) => self.fail(Failure::Transport(err)),
        }
    }

    /// Error transition: recover, retry, fetch sense data or give up.
    fn fail(&mut self, failure: Failure) -> Result<Option<Outcome>, ErrorKind> {
        self.phase = Phase::Error;
        let op = match self.in_flight.take() {
            Some(op) => op,
            None => return Err(ErrorKind::Protocol),
        };
        debug!(
            "command {:#04x} attempt {} failed: {:?}",
            op.command.opcode(),
            op.attempt,
            failure
        );

        if op.sensing {
            error!("request sense failed: {:?}", failure);
            self.phase = Phase::Idle;
            if failure != Failure::Failed {
                reset_recovery(&mut self.transport)?;
            }
            return Err(ErrorKind::Command(SenseData::unavailable()));
        }

        match next_action(failure, op.attempt) {
            Action::RecoverAndRetry => {
                let recovered = reset_recovery(&mut self.transport);
                self.phase = Phase::Idle;
                recovered?;
                let mut op = op;
                op.attempt += 1;
                self.launch(op)
            }
            Action::RecoverAndFail(err) => {
                let recovered = reset_recovery(&mut self.transport);
                self.phase = Phase::Idle;
                recovered?;
                Err(err)
            }
            Action::RequestSense => {
                self.phase = Phase::Idle;
                let sense = InFlight::new(block_io::request_sense_command(), Vec::new(), true);
                self.launch(sense)
            }
        }
    }
}

impl<T: AsyncBulkTransport> CommandExecutor for AsyncScsiBlockDevice<T> {
    fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn execute(&mut self, command: &Command, data: DataBuffer<'_>) -> Result<usize, ErrorKind> {
        if !data.fits(command) {
            return Err(ErrorKind::InvalidParameter);
        }
        let payload = match &data {
            DataBuffer::Out(buf) => Some(buf[..command.data_length()].to_vec()),
            _ => None,
        };
        self.submit_command(command.clone(), payload)?;
        let outcome = self.run_to_completion()?;
        if let DataBuffer::In(buf) = data {
            let len = core::cmp::min(outcome.data.len(), buf.len());
            buf[..len].copy_from_slice(&outcome.data[..len]);
        }
        Ok(outcome.transferred)
    }
}

impl<T: AsyncBulkTransport> BlockDevice for AsyncScsiBlockDevice<T> {
    fn init(&mut self) -> Result<(), ErrorKind> {
        if self.in_flight.is_some() {
            return Err(ErrorKind::Busy);
        }
        let (inquiry, geometry) = block_io::identify(self)?;
        self.inquiry = Some(inquiry);
        self.geometry = Some(geometry);
        Ok(())
    }

    fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    fn read(&mut self, lba: LbaId, data: &mut [u8]) -> Result<usize, ErrorKind> {
        let geometry = self.geometry.ok_or(ErrorKind::NotInitialized)?;
        block_io::read(self, &geometry, lba, data)
    }

    fn write(&mut self, lba: LbaId, data: &[u8]) -> Result<usize, ErrorKind> {
        let geometry = self.geometry.ok_or(ErrorKind::NotInitialized)?;
        block_io::write(self, &geometry, lba, data)
    }
}
