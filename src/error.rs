use core::fmt;

use crate::scsi::SenseData;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// CSW signature, length or tag did not match what was sent.
    Protocol,
    /// Bulk transfer failed and the single retry did not help.
    Transport(TransportError),
    /// Device answered with a FAILED status; sense data from REQUEST SENSE.
    Command(SenseData),
    /// Reset recovery failed or the operation failed again after recovery.
    Device,
    NotInitialized,
    Busy,
    InvalidParameter,
    OutOfBounds,
    ReadOnly,
    Unsupported,
}

impl From<TransportError> for ErrorKind {
    fn from(err: TransportError) -> Self {
        ErrorKind::Transport(err)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Protocol => write!(f, "bulk-only transport protocol violation"),
            ErrorKind::Transport(e) => write!(f, "transport error: {}", e),
            ErrorKind::Command(sense) => write!(
                f,
                "command failed: sense key {:?} asc {:#04x} ascq {:#04x}",
                sense.sense_key, sense.asc, sense.ascq
            ),
            ErrorKind::Device => write!(f, "device failed to recover"),
            ErrorKind::NotInitialized => write!(f, "block device not initialized"),
            ErrorKind::Busy => write!(f, "a command is already in flight"),
            ErrorKind::InvalidParameter => write!(f, "invalid parameter"),
            ErrorKind::OutOfBounds => write!(f, "block range out of bounds"),
            ErrorKind::ReadOnly => write!(f, "medium is write protected"),
            ErrorKind::Unsupported => write!(f, "unsupported device"),
        }
    }
}
