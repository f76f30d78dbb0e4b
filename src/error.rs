//! Errors reported by the loaders.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use crate::connection::ConnectionError;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Everything that can abort a load. A failed load leaves the Propeller in an
/// undefined state; the only way forward is a fresh reset and load.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The Propeller did not answer with the expected LFSR continuation.
    #[error("handshake failed")]
    HandshakeMismatch,
    /// The handshake was fine but the chip reported a version we don't know.
    #[error("wrong propeller version {0}")]
    VersionMismatch(u8),
    /// No answer to the calibration bytes within the computed budget.
    #[error("timeout waiting for checksum ack")]
    ChecksumAckTimeout,
    /// The ROM answered, but not with an ACK.
    #[error("checksum verification failed, received {0:#04x}")]
    ChecksumAckNak(u8),
    /// A fast protocol packet got no acceptable answer.
    #[error("no response to packet {id} after {attempts} attempts")]
    PacketTimeout { id: i32, attempts: u32 },
    /// The second stage answered with something other than what we wanted.
    #[error("unexpected result: expected {expected}, received {received}")]
    ResultMismatch { expected: i32, received: i32 },
    /// An encoded packet would not fit in its buffer.
    #[error("packet buffer overflow")]
    BufferOverflow,
    /// The image is too short to hold a header.
    #[error("image of {0} bytes is smaller than the header")]
    ImageTooSmall(usize),
    /// The transport failed underneath us.
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),
    /// The connection could not be moved to a new baud rate.
    #[error("setting baud rate {0} failed")]
    BaudRateSwitch(u32),
    /// The operation was called out of sequence.
    #[error("operation not valid in the current loader state")]
    InvalidState,
}

pub type Result<T> = core::result::Result<T, Error>;

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
