use alloc::vec::Vec;
use core::fmt;

/// Result codes follow libusb numbering: non-negative values are byte counts.
pub const RESULT_IO: i32 = -1;
pub const RESULT_NO_DEVICE: i32 = -4;
pub const RESULT_TIMEOUT: i32 = -7;
pub const RESULT_OVERFLOW: i32 = -8;
pub const RESULT_PIPE: i32 = -9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    BulkIn,
    BulkOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    Stall,
    Timeout,
    Disconnected,
    Overflow,
    Io,
}

impl TransportError {
    pub fn from_code(code: i32) -> Self {
        match code {
            RESULT_PIPE => TransportError::Stall,
            RESULT_TIMEOUT => TransportError::Timeout,
            RESULT_NO_DEVICE => TransportError::Disconnected,
            RESULT_OVERFLOW => TransportError::Overflow,
            _ => TransportError::Io,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            TransportError::Stall => RESULT_PIPE,
            TransportError::Timeout => RESULT_TIMEOUT,
            TransportError::Disconnected => RESULT_NO_DEVICE,
            TransportError::Overflow => RESULT_OVERFLOW,
            TransportError::Io => RESULT_IO,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TransportError::Stall => "endpoint stalled",
            TransportError::Timeout => "transfer timed out",
            TransportError::Disconnected => "device disconnected",
            TransportError::Overflow => "transfer overflow",
            TransportError::Io => "i/o error",
        };
        f.write_str(msg)
    }
}

/// Class-specific control requests used for reset recovery.
pub trait ControlTransport {
    /// Bulk-Only Mass Storage Reset (bRequest 0xFF, class, interface).
    fn bulk_only_reset(&mut self) -> Result<(), TransportError>;
    /// CLEAR_FEATURE(ENDPOINT_HALT) on one of the bulk endpoints.
    fn clear_halt(&mut self, endpoint: Endpoint) -> Result<(), TransportError>;
}

/// Blocking bulk transfers. Each call returns once the transfer completes.
pub trait BulkTransport: ControlTransport {
    fn bulk_out(&mut self, data: &[u8]) -> Result<usize, TransportError>;
    /// A return value smaller than `buf.len()` means the device sent a short
    /// packet and the transfer ended early.
    fn bulk_in(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// A bulk transfer handed to an [`AsyncBulkTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Out(Vec<u8>),
    In(usize),
}

impl Transfer {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Transfer::Out(_) => Endpoint::BulkOut,
            Transfer::In(_) => Endpoint::BulkIn,
        }
    }
}

/// Completion of a submitted [`Transfer`].
///
/// `buffer` holds the received bytes for IN transfers and the submitted
/// bytes for OUT transfers. `result` is a byte count or a negative code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub endpoint: Endpoint,
    pub buffer: Option<Vec<u8>>,
    pub result: i32,
}

impl Completion {
    pub fn new(endpoint: Endpoint, buffer: Option<Vec<u8>>, result: i32) -> Self {
        Completion {
            endpoint,
            buffer,
            result,
        }
    }

    pub fn failed(endpoint: Endpoint, err: TransportError) -> Self {
        Completion {
            endpoint,
            buffer: None,
            result: err.code(),
        }
    }

    /// Byte count and buffer, or the transport error the completion carries.
    pub(crate) fn into_result(self) -> Result<(usize, Vec<u8>), TransportError> {
        if self.result < 0 {
            return Err(TransportError::from_code(self.result));
        }
        match self.buffer {
            Some(buffer) => Ok((self.result as usize, buffer)),
            None => Err(TransportError::Io),
        }
    }
}

/// Callback-style bulk transfers.
///
/// `submit` queues a transfer and returns immediately; its completion is
/// later produced by `wait_completion`. The driver keeps at most one
/// transfer outstanding.
pub trait AsyncBulkTransport: ControlTransport {
    fn submit(&mut self, transfer: Transfer) -> Result<(), TransportError>;
    /// Block until the outstanding transfer completes.
    fn wait_completion(&mut self) -> Completion;
}
