//! Propeller Download Stream encoding.
//!
//! The ROM boot loader does not read plain UART bytes. It measures the width
//! of every low pulse on its receive pin: one bit time low is a `1`, two bit
//! times low is a `0`. Each byte we send (start bit, eight data bits LSB
//! first, stop bit) therefore carries between one and five stream bits,
//! depending on how many pulses fit in its frame.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use core::cmp;

use crate::error::Result;
use crate::packet::ByteArray;

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// Widest group of bits a single output byte can carry.
pub const MAX_GROUP_BITS: usize = 5;

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

// Indexed by [value][width - 1]. Each entry is (byte to send, number of
// input bits it actually encodes). Some groups cannot be packed into one
// frame, so the encoder advances by the second field rather than by width.
static PDS_TX: [[(u8, u8); 5]; 32] = [
    //   1-bit        2-bit        3-bit        4-bit        5-bit
    [(0xFE, 1), (0xF2, 2), (0x92, 3), (0x92, 3), (0x92, 3)], // %00000
    [(0xFF, 1), (0xF9, 2), (0xC9, 3), (0xC9, 3), (0xC9, 3)], // %00001
    [(0x00, 0), (0xFA, 2), (0xCA, 3), (0xCA, 3), (0xCA, 3)], // %00010
    [(0x00, 0), (0xFD, 2), (0xE5, 3), (0x25, 4), (0x25, 4)], // %00011
    [(0x00, 0), (0x00, 0), (0xD2, 3), (0xD2, 3), (0xD2, 3)], // %00100
    [(0x00, 0), (0x00, 0), (0xE9, 3), (0x29, 4), (0x29, 4)], // %00101
    [(0x00, 0), (0x00, 0), (0xEA, 3), (0x2A, 4), (0x2A, 4)], // %00110
    // 0xF5, not 0xFA: 0xFA only carries two bits and cannot send %111.
    [(0x00, 0), (0x00, 0), (0xF5, 3), (0x95, 4), (0x95, 4)], // %00111
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x92, 3), (0x92, 3)], // %01000
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x49, 4), (0x49, 4)], // %01001
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x4A, 4), (0x4A, 4)], // %01010
    [(0x00, 0), (0x00, 0), (0x00, 0), (0xA5, 4), (0xA5, 4)], // %01011
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x52, 4), (0x52, 4)], // %01100
    [(0x00, 0), (0x00, 0), (0x00, 0), (0xA9, 4), (0xA9, 4)], // %01101
    [(0x00, 0), (0x00, 0), (0x00, 0), (0xAA, 4), (0xAA, 4)], // %01110
    [(0x00, 0), (0x00, 0), (0x00, 0), (0xD5, 4), (0xD5, 4)], // %01111
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0x92, 3)], // %10000
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0xC9, 3)], // %10001
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0xCA, 3)], // %10010
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0x25, 4)], // %10011
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0xD2, 3)], // %10100
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0x29, 4)], // %10101
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0x2A, 4)], // %10110
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0x95, 4)], // %10111
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0x92, 3)], // %11000
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0x49, 4)], // %11001
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0x4A, 4)], // %11010
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0xA5, 4)], // %11011
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0x52, 4)], // %11100
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0xA9, 4)], // %11101
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0xAA, 4)], // %11110
    [(0x00, 0), (0x00, 0), (0x00, 0), (0x00, 0), (0x55, 5)], // %11111
];

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

/// Look up the output byte for the low `width` bits of `value`.
///
/// Returns the byte and the number of bits it consumed, which may be fewer
/// than `width`. Returns `None` if `width` is not 1 to 5 or `value` does not
/// fit in `width` bits.
pub fn encode_bits(value: u8, width: usize) -> Option<(u8, usize)> {
    if width == 0 || width > MAX_GROUP_BITS || (value as usize) >= (1 << width) {
        return None;
    }
    let (byte, consumed) = PDS_TX[value as usize][width - 1];
    Some((byte, consumed as usize))
}

/// Encode `data` into `packet` as a download stream.
///
/// Bits are taken LSB first within each byte, bytes in order. If the packet
/// runs out of room it is restored to its previous length and the error is
/// returned.
pub fn encode_bytes(packet: &mut ByteArray, data: &[u8]) -> Result<()> {
    let mark = packet.len();
    let result = encode_into(packet, data);
    if result.is_err() {
        packet.truncate(mark);
    }
    result
}

// ****************************************************************************
//
// Private Impl/Functions/Modules
//
// ****************************************************************************

fn encode_into(packet: &mut ByteArray, data: &[u8]) -> Result<()> {
    let bit_count = data.len() * 8;
    let mut next_bit = 0;
    while next_bit < bit_count {
        let width = cmp::min(MAX_GROUP_BITS, bit_count - next_bit);
        let bits = extract_bits(data, next_bit, width);
        let (byte, consumed) = PDS_TX[bits as usize][width - 1];
        packet.push(byte)?;
        next_bit += consumed as usize;
    }
    Ok(())
}

/// Pull `width` bits starting at bit `bit`, spanning into the next byte if
/// needed. Bits past the end of `data` read as zero.
fn extract_bits(data: &[u8], bit: usize, width: usize) -> u8 {
    let index = bit / 8;
    let shift = bit % 8;
    let low = u16::from(data[index]) >> shift;
    let high = data.get(index + 1).map_or(0, |&b| u16::from(b) << (8 - shift));
    ((low | high) & ((1 << width) - 1)) as u8
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
