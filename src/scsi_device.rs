use log::{debug, error, trace, warn};

use crate::block_io;
use crate::cbw::{CBW_LEN, MAX_LUN};
use crate::command::{
    next_action, reset_recovery, transferred, Action, Command, CommandExecutor, DataBuffer,
    Failure, Phase,
};
use crate::config::DriverConfig;
use crate::csw::{decode_status, CSW_LEN};
use crate::error::ErrorKind;
use crate::scsi::{InquiryResponse, SenseData};
use crate::storage::{BlockDevice, Geometry, LbaId};
use crate::transport::{BulkTransport, TransportError};
use crate::util::TagGenerator;

pub struct ScsiBlockDevice<T: BulkTransport> {
    transport: T,
    config: DriverConfig,
    tags: TagGenerator,
    phase: Phase,
    inquiry: Option<InquiryResponse>,
    geometry: Option<Geometry>,
}

impl<T: BulkTransport> ScsiBlockDevice<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, DriverConfig::default())
    }

    pub fn with_config(transport: T, config: DriverConfig) -> Self {
        ScsiBlockDevice {
            transport,
            config,
            tags: TagGenerator::new(),
            phase: Phase::Idle,
            inquiry: None,
            geometry: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
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

    /// Run `command` with at most one retry after reset recovery.
    pub fn transfer_command(
        &mut self,
        command: &Command,
        mut data: DataBuffer<'_>,
    ) -> Result<usize, ErrorKind> {
        if self.config.lun > MAX_LUN || !data.fits(command) {
            return Err(ErrorKind::InvalidParameter);
        }

        let mut attempt = 0;
        loop {
            let failure = match self.attempt(command, &mut data) {
                Ok(len) => {
                    self.phase = Phase::Idle;
                    return Ok(len);
                }
                Err(failure) => failure,
            };
            self.phase = Phase::Error;
            debug!(
                "command {:#04x} attempt {} failed: {:?}",
                command.opcode(),
                attempt,
                failure
            );

            let action = next_action(failure, attempt);
            let result = match action {
                Action::RecoverAndRetry => reset_recovery(&mut self.transport),
                Action::RecoverAndFail(err) => {
                    reset_recovery(&mut self.transport).and_then(|_| Err(err))
                }
                Action::RequestSense => self
                    .request_sense()
                    .and_then(|sense| Err(ErrorKind::Command(sense))),
            };
            self.phase = Phase::Idle;
            result?;
            attempt += 1;
        }
    }

    /// One pass through CBW, data and CSW.
    fn attempt(&mut self, command: &Command, data: &mut DataBuffer<'_>) -> Result<usize, Failure> {
        let tag = self.tags.next_tag();
        let cbw = command
            .wrap(tag, self.config.lun)
            .map_err(|_| Failure::Protocol)?;

        self.phase = Phase::CommandSent;
        let written = self.transport.bulk_out(&cbw)?;
        if written != CBW_LEN {
            warn!("cbw write moved {} bytes", written);
            return Err(Failure::Transport(TransportError::Io));
        }

        self.phase = Phase::DataPhase;
        let requested = command.data_length();
        let received = match data {
            DataBuffer::In(buf) => {
                let received = self.data_in(&mut buf[..requested])?;
                trace!("data in {} of {} bytes", received, requested);
                received
            }
            DataBuffer::Out(buf) => {
                self.data_out(&buf[..requested])?;
                requested
            }
            DataBuffer::None => 0,
        };

        let mut csw = [0u8; CSW_LEN];
        let len = self.transport.bulk_in(&mut csw)?;
        self.phase = Phase::StatusReceived;
        let csw = decode_status(&csw[..len.min(CSW_LEN)], tag).map_err(|_| Failure::Protocol)?;

        let moved = transferred(&csw, requested)?;
        if received < moved {
            warn!("csw claims {} bytes, data phase moved {}", moved, received);
        }
        self.phase = Phase::Complete;
        Ok(moved.min(received))
    }

    /// Fill `buf` with one or more bulk-IN transfers. A short transfer ends
    /// the data phase early.
    fn data_in(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut received = 0;
        while received < buf.len() {
            let chunk = core::cmp::min(buf.len() - received, self.max_bulk());
            let len = self
                .transport
                .bulk_in(&mut buf[received..received + chunk])?;
            received += len;
            if len < chunk {
                break;
            }
        }
        Ok(received)
    }

    fn data_out(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let mut sent = 0;
        while sent < buf.len() {
            let chunk = core::cmp::min(buf.len() - sent, self.max_bulk());
            let len = self.transport.bulk_out(&buf[sent..sent + chunk])?;
            if len == 0 {
                return Err(TransportError::Io);
            }
            sent += len;
        }
        Ok(())
    }

    fn max_bulk(&self) -> usize {
        self.config.max_bulk_transfer.max(1)
    }

    /// Sense data for the FAILED command just seen. A failed reset after an
    /// unusable REQUEST SENSE is a device error.
    fn request_sense(&mut self) -> Result<SenseData, ErrorKind> {
        let command = block_io::request_sense_command();
        let mut buf = [0u8; crate::scsi::SENSE_LEN as usize];
        let sense = match self.attempt(&command, &mut DataBuffer::In(&mut buf)) {
            Ok(len) => block_io::parse_sense(&buf[..len]),
            Err(failure) => {
                error!("request sense failed: {:?}", failure);
                if failure != Failure::Failed {
                    reset_recovery(&mut self.transport)?;
                }
                SenseData::unavailable()
            }
        };
        debug!("sense {:?}", sense);
        Ok(sense)
    }
}

impl<T: BulkTransport> CommandExecutor for ScsiBlockDevice<T> {
    fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn execute(&mut self, command: &Command, data: DataBuffer<'_>) -> Result<usize, ErrorKind> {
        self.transfer_command(command, data)
    }
}

impl<T: BulkTransport> BlockDevice for ScsiBlockDevice<T> {
    fn init(&mut self) -> Result<(), ErrorKind> {
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
