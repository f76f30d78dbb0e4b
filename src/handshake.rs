//! The ROM handshake.
//!
//! After reset neither side knows the Propeller's exact clock, so the host
//! leads with timing templates the chip uses to measure the bit time. The
//! host then sends 250 bits from an 8-bit LFSR seeded with `'P'`, followed by
//! one template per bit it expects back. The Propeller answers with the next
//! 250 bits of the same LFSR and then its 8-bit version number.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use log::error;

use crate::error::{Error, Result};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// The handshake bit generator.
///
/// Each step yields bit 0 of the register, then shifts left and feeds back
/// bits 7, 5, 4 and 1 XORed together. The sequence repeats every 255 bits.
#[derive(Debug, Clone)]
pub struct Lfsr {
    state: u8,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// The ROM starts the LFSR from this value.
pub const LFSR_SEED: u8 = b'P';

/// Number of LFSR bits each side sends.
pub const HANDSHAKE_BITS: usize = 250;

/// Bytes of handshake the Propeller sends back, two bits per byte.
pub const RX_HANDSHAKE_SIZE: usize = 125;

/// Bytes of version number that follow the handshake, two bits per byte.
pub const VERSION_RESPONSE_SIZE: usize = 4;

/// Total reply to `TX_HANDSHAKE`.
pub const HANDSHAKE_RESPONSE_SIZE: usize = RX_HANDSHAKE_SIZE + VERSION_RESPONSE_SIZE;

/// The only hardware version we know how to load.
pub const PROPELLER_VERSION: u8 = 1;

/// Everything the host sends before the command: the templates, the 250
/// handshake bits and 258 more templates to clock out the Propeller's reply.
pub static TX_HANDSHAKE: [u8; 198] = [
    // Timing template ('1', '0') and the first two handshake bits ('0', '1').
    0x49,
    // The remaining 248 handshake bits.
    0xAA, 0x52, 0xA5, 0xAA, 0x25, 0xAA, 0xD2, 0xCA, 0x52, 0x25, 0xD2, 0xD2, 0xD2, 0xAA, 0x49, 0x92,
    0xC9, 0x2A, 0xA5, 0x25, 0x4A, 0x49, 0x49, 0x2A, 0x25, 0x49, 0xA5, 0x4A, 0xAA, 0x2A, 0xA9, 0xCA,
    0xAA, 0x55, 0x52, 0xAA, 0xA9, 0x29, 0x92, 0x92, 0x29, 0x25, 0x2A, 0xAA, 0x92, 0x92, 0x55, 0xCA,
    0x4A, 0xCA, 0xCA, 0x92, 0xCA, 0x92, 0x95, 0x55, 0xA9, 0x92, 0x2A, 0xD2, 0x52, 0x92, 0x52, 0xCA,
    0xD2, 0xCA, 0x2A, 0xFF,
    // 250 templates for the Propeller's handshake, two per byte.
    0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29,
    0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29,
    0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29,
    0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29,
    0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29,
    0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29,
    0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29,
    0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29, 0x29,
    // 8 templates for the version number.
    0x29, 0x29, 0x29, 0x29,
];

/// The 250 bits the Propeller must answer with. Bit 0 and bit 5 of each
/// byte carry one LFSR bit each.
pub static RX_HANDSHAKE: [u8; RX_HANDSHAKE_SIZE] = [
    0xEE, 0xCE, 0xCE, 0xCF, 0xEF, 0xCF, 0xEE, 0xEF, 0xCF, 0xCF, 0xEF, 0xEF, 0xCF, 0xCE, 0xEF, 0xCF,
    0xEE, 0xEE, 0xCE, 0xEE, 0xEF, 0xCF, 0xCE, 0xEE, 0xCE, 0xCF, 0xEE, 0xEE, 0xEF, 0xCF, 0xEE, 0xCE,
    0xEE, 0xCE, 0xEE, 0xCF, 0xEF, 0xEE, 0xEF, 0xCE, 0xEE, 0xEE, 0xCF, 0xEE, 0xCF, 0xEE, 0xEE, 0xCF,
    0xEF, 0xCE, 0xCF, 0xEE, 0xEF, 0xEE, 0xEE, 0xEE, 0xEE, 0xEF, 0xEE, 0xCF, 0xCF, 0xEF, 0xEE, 0xCE,
    0xEF, 0xEF, 0xEF, 0xEF, 0xCE, 0xEF, 0xEE, 0xEF, 0xCF, 0xEF, 0xCF, 0xCF, 0xCE, 0xCE, 0xCE, 0xCF,
    0xCF, 0xEF, 0xCE, 0xEE, 0xCF, 0xEE, 0xEF, 0xCE, 0xCE, 0xCE, 0xEF, 0xEF, 0xCF, 0xCF, 0xEE, 0xEE,
    0xEE, 0xCE, 0xCF, 0xCE, 0xCE, 0xCF, 0xCE, 0xEE, 0xEF, 0xEE, 0xEF, 0xEF, 0xCF, 0xEF, 0xCE, 0xCE,
    0xEF, 0xCE, 0xEE, 0xCE, 0xEF, 0xCE, 0xCE, 0xEE, 0xCF, 0xCF, 0xCE, 0xCF, 0xCF,
];

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl Lfsr {
    /// A generator in the ROM's starting state.
    pub fn new() -> Lfsr {
        Lfsr { state: LFSR_SEED }
    }
}

impl Default for Lfsr {
    fn default() -> Lfsr {
        Lfsr::new()
    }
}

impl Iterator for Lfsr {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let s = self.state;
        let bit = s & 0x01;
        self.state = ((s << 1) & 0xFE) | (((s >> 7) ^ (s >> 5) ^ (s >> 4) ^ (s >> 1)) & 0x01);
        Some(bit)
    }
}

/// Check the handshake part of a reply byte for byte.
pub fn verify_rx_handshake(response: &[u8]) -> Result<()> {
    match response.get(..RX_HANDSHAKE_SIZE) {
        Some(received) if received == &RX_HANDSHAKE[..] => Ok(()),
        Some(received) => {
            error!("handshake failed, received {:02x?}", received);
            Err(Error::HandshakeMismatch)
        }
        None => Err(Error::HandshakeMismatch),
    }
}

/// Assemble the version number from the bytes following the handshake.
/// Bits arrive least significant first, two per byte in bits 0 and 5.
pub fn decode_version(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |version, &b| {
        ((version >> 2) & 0x3F) | ((b & 0x01) << 6) | ((b & 0x20) << 2)
    })
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
