//! The link to the Propeller.
//!
//! The loaders never touch hardware themselves. Whatever carries the bytes
//! (a hardware UART, a bit-banged pin pair, a test double) implements
//! `Connection`.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use log::{debug, error};

use crate::config::MAX_PACKET_SIZE;
use crate::error::Error;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Failures of the transport primitives.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum ConnectionError {
    /// The deadline passed before enough bytes arrived.
    #[error("receive timed out")]
    Timeout,
    /// Not all bytes could be written.
    #[error("send failed")]
    Send,
    /// The reset line could not be driven.
    #[error("reset failed")]
    Reset,
    /// The UART refused the requested rate.
    #[error("baud rate change failed")]
    BaudRate,
}

/// A duplex byte channel to a Propeller with control of its reset line.
///
/// Implementations only need the primitives; `receive_checksum_ack` is built
/// on top of them.
pub trait Connection {
    /// Pulse the reset line: release, assert, release, each with a settle
    /// delay, then throw away anything already received.
    fn generate_reset_signal(&mut self) -> Result<(), ConnectionError>;

    /// Write `data`, returning how many bytes went out.
    fn send_data(&mut self, data: &[u8]) -> Result<usize, ConnectionError>;

    /// Fill `buffer` completely, or fail with `ConnectionError::Timeout` if
    /// `timeout_ms` passes first.
    fn receive_data_exact_timeout(
        &mut self,
        buffer: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), ConnectionError>;

    /// Drain pending output, then switch rates.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), ConnectionError>;

    /// The rate currently in use.
    fn baud_rate(&self) -> u32;

    /// Largest fast protocol payload this link can carry in one go.
    fn max_data_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    /// Poll the ROM for the ACK it sends once it has checked the image.
    ///
    /// The budget covers the time to clock out `byte_count` bytes at the
    /// current rate plus `delay_ms`, split into `CALIBRATE_PAUSE_MS` slots.
    /// Each slot sends one calibration byte, which gives the ROM a template
    /// to answer on, and waits for a single byte.
    fn receive_checksum_ack(&mut self, byte_count: usize, delay_ms: u32) -> Result<(), Error> {
        let baud_rate = u64::from(self.baud_rate().max(1));
        let ms_send_time = (byte_count as u64 * 10 * 1000 / baud_rate) as u32;
        let mut retries = ms_send_time / CALIBRATE_PAUSE_MS + delay_ms / CALIBRATE_PAUSE_MS;
        let mut buffer = [0u8; 1];

        loop {
            send_all(self, &[CALIBRATE_BYTE])?;
            match self.receive_data_exact_timeout(&mut buffer, CALIBRATE_PAUSE_MS) {
                Ok(()) => {
                    debug!("received ack {:02x}", buffer[0]);
                    return if buffer[0] == CHECKSUM_ACK {
                        Ok(())
                    } else {
                        Err(Error::ChecksumAckNak(buffer[0]))
                    };
                }
                Err(ConnectionError::Timeout) => {}
                Err(e) => return Err(e.into()),
            }
            retries = retries.saturating_sub(1);
            if retries == 0 {
                break;
            }
        }

        error!("timeout waiting for checksum ack");
        Err(Error::ChecksumAckTimeout)
    }
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// Milliseconds between attempts to read the checksum ACK.
pub const CALIBRATE_PAUSE_MS: u32 = 10;

/// Sent to prompt the ROM for its ACK.
pub const CALIBRATE_BYTE: u8 = 0xF9;

/// What the ROM answers when the image checksum is good.
pub const CHECKSUM_ACK: u8 = 0xFE;

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

/// Send `data` and insist all of it went out.
pub fn send_all<C: Connection + ?Sized>(connection: &mut C, data: &[u8]) -> Result<(), ConnectionError> {
    if connection.send_data(data)? == data.len() {
        Ok(())
    } else {
        Err(ConnectionError::Send)
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
