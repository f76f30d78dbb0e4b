//! A scripted Propeller for the unit tests.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::{INITIAL_BAUD_RATE, MAX_PACKET_SIZE};
use crate::connection::{Connection, ConnectionError, CHECKSUM_ACK};
use crate::fast_loader::{
    INIT_CALL_FRAME, LAUNCH_NOW, PROGRAM_VERIFY_EEPROM, READY_TO_LAUNCH, VERIFY_RAM,
};
use crate::handshake::RX_HANDSHAKE;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// How the simulated second stage answers one packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    /// Echo the tag with this result.
    Result(i32),
    /// Answer with this result but a different tag.
    WrongTag(i32),
    /// Send only half a response.
    Short,
    /// Say nothing.
    Silent,
}

pub trait Responder {
    fn respond(&mut self, id: i32, payload: &[u8]) -> Reply;
}

impl<F: FnMut(i32, &[u8]) -> Reply> Responder for F {
    fn respond(&mut self, id: i32, payload: &[u8]) -> Reply {
        self(id, payload)
    }
}

/// A well-behaved second-stage loader.
#[derive(Debug, Default)]
pub struct SecondStage {
    pub checksum: i32,
}

/// One fast protocol packet as the device saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: i32,
    pub tag: i32,
    pub payload: Vec<u8>,
}

/// Records everything sent to it and plays back scripted replies.
///
/// Bytes given to `script` arrive after the next transmission, the way the
/// ROM answers only once it has seen the download packet. After the baud
/// rate changes the device switches to packet mode and answers each
/// transmission through its responder.
pub struct SimPropeller {
    pub sent: Vec<Vec<u8>>,
    pub packets: Vec<Packet>,
    pub rx: VecDeque<u8>,
    pub baud: u32,
    pub baud_changes: Vec<u32>,
    pub resets: usize,
    pub receives: usize,
    /// `(bytes wanted, timeout)` for every receive, in order.
    pub timeouts: Vec<(usize, u32)>,
    pub max_data_size: usize,
    pub short_writes: bool,
    pub fail_baud: bool,
    script: VecDeque<u8>,
    responder: Option<Box<dyn Responder>>,
    packet_mode: bool,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// Version bytes that decode to 1.
pub const VERSION_1: [u8; 4] = [0xCF, 0xCE, 0xCE, 0xCE];

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl SimPropeller {
    pub fn new() -> SimPropeller {
        SimPropeller {
            sent: Vec::new(),
            packets: Vec::new(),
            rx: VecDeque::new(),
            baud: INITIAL_BAUD_RATE,
            baud_changes: Vec::new(),
            resets: 0,
            receives: 0,
            timeouts: Vec::new(),
            max_data_size: MAX_PACKET_SIZE,
            short_writes: false,
            fail_baud: false,
            script: VecDeque::new(),
            responder: None,
            packet_mode: false,
        }
    }

    /// A device that is already in packet mode.
    pub fn with_responder<R: Responder + 'static>(responder: R) -> SimPropeller {
        let mut sim = SimPropeller::new();
        sim.responder = Some(Box::new(responder));
        sim.packet_mode = true;
        sim
    }

    /// A device that first has to be booted through the ROM, then answers
    /// packets with `responder`.
    pub fn booting<R: Responder + 'static>(responder: R) -> SimPropeller {
        let mut sim = SimPropeller::new();
        sim.responder = Some(Box::new(responder));
        sim
    }

    /// Make bytes available right now.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Make bytes available after the next transmission.
    pub fn script(&mut self, bytes: &[u8]) {
        self.script.extend(bytes.iter().copied());
    }

    /// Script a good ROM reply: handshake, version 1 and the checksum ACK.
    pub fn script_rom_reply(&mut self) {
        self.script(&RX_HANDSHAKE);
        self.script(&VERSION_1);
        self.script(&[CHECKSUM_ACK]);
    }

    /// Everything sent so far, in one piece.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent.iter().flatten().copied().collect()
    }

    fn answer_packet(&mut self, data: &[u8]) {
        let id = LittleEndian::read_i32(&data[0..4]);
        let tag = LittleEndian::read_i32(&data[4..8]);
        let payload = &data[8..];
        self.packets.push(Packet {
            id,
            tag,
            payload: payload.to_vec(),
        });
        let reply = match self.responder.as_mut() {
            Some(responder) => responder.respond(id, payload),
            None => Reply::Silent,
        };
        let mut response = [0u8; 8];
        match reply {
            Reply::Result(result) => {
                LittleEndian::write_i32(&mut response[0..4], result);
                LittleEndian::write_i32(&mut response[4..8], tag);
                self.queue(&response);
            }
            Reply::WrongTag(result) => {
                LittleEndian::write_i32(&mut response[0..4], result);
                LittleEndian::write_i32(&mut response[4..8], tag ^ 0x5A5A);
                self.queue(&response);
            }
            Reply::Short => self.queue(&response[0..4]),
            Reply::Silent => {}
        }
    }
}

impl Connection for SimPropeller {
    fn generate_reset_signal(&mut self) -> Result<(), ConnectionError> {
        self.resets += 1;
        self.rx.clear();
        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.sent.push(data.to_vec());
        if self.packet_mode && data.len() >= 8 {
            self.answer_packet(data);
        } else {
            let arrived: Vec<u8> = self.script.drain(..).collect();
            self.queue(&arrived);
        }
        if self.short_writes {
            Ok(data.len().saturating_sub(1))
        } else {
            Ok(data.len())
        }
    }

    fn receive_data_exact_timeout(
        &mut self,
        buffer: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), ConnectionError> {
        self.receives += 1;
        self.timeouts.push((buffer.len(), timeout_ms));
        if self.rx.len() < buffer.len() {
            self.rx.clear();
            return Err(ConnectionError::Timeout);
        }
        for b in buffer.iter_mut() {
            *b = self.rx.pop_front().unwrap_or(0);
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), ConnectionError> {
        if self.fail_baud {
            return Err(ConnectionError::BaudRate);
        }
        self.baud_changes.push(baud_rate);
        self.baud = baud_rate;
        self.packet_mode = self.responder.is_some() && baud_rate != INITIAL_BAUD_RATE;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn max_data_size(&self) -> usize {
        self.max_data_size
    }
}

impl Responder for SecondStage {
    fn respond(&mut self, id: i32, payload: &[u8]) -> Reply {
        if payload == &VERIFY_RAM[..] {
            for &b in INIT_CALL_FRAME.iter() {
                self.checksum = self.checksum.wrapping_add(i32::from(b));
            }
            Reply::Result(self.checksum.wrapping_neg())
        } else if payload == &PROGRAM_VERIFY_EEPROM[..] {
            Reply::Result(self.checksum.wrapping_neg().wrapping_mul(2))
        } else if payload == &READY_TO_LAUNCH[..] {
            Reply::Result(id.wrapping_sub(1))
        } else if payload == &LAUNCH_NOW[..] {
            Reply::Silent
        } else {
            for &b in payload {
                self.checksum = self.checksum.wrapping_add(i32::from(b));
            }
            Reply::Result(id.wrapping_sub(1))
        }
    }
}

/// Decode a download stream the way the ROM does: one bit time low is a 1,
/// two bit times low is a 0.
pub fn rom_decode(stream: &[u8]) -> Vec<u8> {
    let mut bits = Vec::new();
    for &byte in stream {
        let mut run = 0;
        // start bit, eight data bits LSB first, stop bit
        let frame = core::iter::once(0)
            .chain((0..8).map(|i| (byte >> i) & 1))
            .chain(core::iter::once(1));
        for level in frame {
            if level == 0 {
                run += 1;
                continue;
            }
            match run {
                0 => {}
                1 => bits.push(1),
                2 => bits.push(0),
                _ => panic!("low pulse of {} bit times in {:#04x}", run, byte),
            }
            run = 0;
        }
    }
    bits
}

/// The bits of `data` in stream order.
pub fn stream_bits(data: &[u8]) -> Vec<u8> {
    (0..data.len() * 8).map(|i| (data[i / 8] >> (i % 8)) & 1).collect()
}

/// Assemble stream bits (LSB first) into a number.
pub fn bits_value(bits: &[u8]) -> u32 {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (i, &b)| acc | (u32::from(b) << i))
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
