//! The Propeller ROM download protocol.
//!
//! After a reset the ROM listens for a handshake at roughly 115200 baud.
//! Everything it receives is bit-stream encoded (see `encoding`), so a
//! single packet carries the handshake, a command, the image length in longs
//! and the image itself. The ROM answers with its half of the handshake and
//! its version, then checks the image and ACKs it.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use log::{debug, error, info};

use crate::config::ROM_PACKET_SIZE;
use crate::connection::{send_all, Connection};
use crate::encoding::encode_bytes;
use crate::error::{Error, Result};
use crate::handshake::{
    decode_version, verify_rx_handshake, HANDSHAKE_RESPONSE_SIZE, PROPELLER_VERSION,
    RX_HANDSHAKE_SIZE, TX_HANDSHAKE,
};
use crate::packet::ByteArray;
use crate::{ImageTransport, LoadType};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Where a ROM load got to. A load that fails stops in `Failed`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LoaderState {
    Idle,
    Reset,
    HandshakeSent,
    HandshakeVerified,
    VersionVerified,
    ChecksumAckPending,
    EepromProgramAckPending,
    EepromVerifyAckPending,
    Done,
    Failed,
}

/// Loads an image through the ROM.
///
/// The loader holds the connection exclusively for its lifetime, so only one
/// load can be in flight per connection.
pub struct PropellerLoader<'c, C: Connection + ?Sized> {
    connection: &'c mut C,
    packet: ByteArray,
    state: LoaderState,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// How long the ROM gets to answer the handshake.
pub const HANDSHAKE_TIMEOUT_MS: u32 = 2000;

/// Extra time allowed for the ROM to checksum RAM.
pub const RAM_CHECKSUM_DELAY_MS: u32 = 250;

/// Time allowed for the ROM to program the EEPROM.
pub const EEPROM_PROGRAM_DELAY_MS: u32 = 5000;

/// Time allowed for the ROM to read the EEPROM back.
pub const EEPROM_VERIFY_DELAY_MS: u32 = 2000;

/// The command sent by `identify`: 0, shut down.
pub static SHUTDOWN_CMD: [u8; 11] = [
    0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0xF2,
];

/// Command 1: load into RAM and run.
pub static LOAD_RUN_CMD: [u8; 11] = [
    0xC9, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0xF2,
];

/// Command 2: load, program the EEPROM and shut down.
pub static PROGRAM_SHUTDOWN_CMD: [u8; 11] = [
    0xCA, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0xF2,
];

/// Command 3: load, program the EEPROM and run.
pub static PROGRAM_RUN_CMD: [u8; 11] = [
    0x25, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0x92, 0xFE,
];

/// Bytes in the encoded length field.
pub const LENGTH_FIELD_SIZE: usize = 11;

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl<'c, C: Connection + ?Sized> PropellerLoader<'c, C> {
    /// A loader with room for a default-sized ROM packet.
    pub fn new(connection: &'c mut C) -> PropellerLoader<'c, C> {
        PropellerLoader::with_packet_capacity(connection, ROM_PACKET_SIZE)
    }

    /// A loader whose encoded packet may grow to `capacity` bytes.
    pub fn with_packet_capacity(connection: &'c mut C, capacity: usize) -> PropellerLoader<'c, C> {
        PropellerLoader {
            connection,
            packet: ByteArray::new(capacity),
            state: LoaderState::Idle,
        }
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// Reset the Propeller and download `image` through the ROM.
    pub fn load(&mut self, image: &[u8], load_type: LoadType) -> Result<()> {
        let result = self.run_load(image, load_type);
        if result.is_err() {
            self.state = LoaderState::Failed;
        }
        result
    }

    /// Reset the Propeller and report its hardware version without
    /// loading anything. The ROM shuts down afterwards.
    pub fn identify(&mut self) -> Result<u8> {
        let result = self.run_identify();
        self.state = if result.is_ok() {
            LoaderState::Done
        } else {
            LoaderState::Failed
        };
        result
    }

    fn run_load(&mut self, image: &[u8], load_type: LoadType) -> Result<()> {
        self.state = LoaderState::Idle;
        generate_loader_packet(&mut self.packet, image, load_type)?;
        info!(
            "loading {} byte image ({:?}) as {} byte packet",
            image.len(),
            load_type,
            self.packet.len()
        );

        let version = self.handshake()?;
        if version != PROPELLER_VERSION {
            error!("wrong propeller version: got {}, expected {}", version, PROPELLER_VERSION);
            return Err(Error::VersionMismatch(version));
        }
        self.state = LoaderState::VersionVerified;

        self.state = LoaderState::ChecksumAckPending;
        self.connection
            .receive_checksum_ack(self.packet.len(), RAM_CHECKSUM_DELAY_MS)
            .map_err(|e| {
                error!("RAM checksum failed: {}", e);
                e
            })?;

        if load_type.programs_eeprom() {
            info!("programming EEPROM");
            self.state = LoaderState::EepromProgramAckPending;
            self.connection
                .receive_checksum_ack(0, EEPROM_PROGRAM_DELAY_MS)
                .map_err(|e| {
                    error!("EEPROM programming failed: {}", e);
                    e
                })?;
            self.state = LoaderState::EepromVerifyAckPending;
            self.connection
                .receive_checksum_ack(0, EEPROM_VERIFY_DELAY_MS)
                .map_err(|e| {
                    error!("EEPROM verify failed: {}", e);
                    e
                })?;
        }

        info!("load complete");
        self.state = LoaderState::Done;
        Ok(())
    }

    fn run_identify(&mut self) -> Result<u8> {
        self.state = LoaderState::Idle;
        generate_identify_packet(&mut self.packet)?;
        let version = self.handshake()?;
        info!("found propeller version {}", version);
        Ok(version)
    }

    /// Reset, send the prepared packet, check the handshake reply and return
    /// the reported version.
    fn handshake(&mut self) -> Result<u8> {
        self.connection.generate_reset_signal()?;
        self.state = LoaderState::Reset;

        send_all(&mut *self.connection, self.packet.data())?;
        self.state = LoaderState::HandshakeSent;

        let mut response = [0u8; HANDSHAKE_RESPONSE_SIZE];
        if let Err(e) = self
            .connection
            .receive_data_exact_timeout(&mut response, HANDSHAKE_TIMEOUT_MS)
        {
            error!("no handshake response: {}", e);
            return Err(e.into());
        }
        debug!("handshake response {:02x?}", &response[..]);

        verify_rx_handshake(&response)?;
        self.state = LoaderState::HandshakeVerified;

        Ok(decode_version(&response[RX_HANDSHAKE_SIZE..]))
    }
}

impl<'c, C: Connection + ?Sized> ImageTransport for PropellerLoader<'c, C> {
    fn load_image(&mut self, image: &[u8], load_type: LoadType) -> Result<()> {
        self.load(image, load_type)
    }
}

/// Build the complete ROM packet for `image` in `packet`.
///
/// The packet is the handshake, the command for `load_type`, the image
/// length in longs and the encoded image. Fails with `BufferOverflow` if it
/// does not fit.
pub fn generate_loader_packet(packet: &mut ByteArray, image: &[u8], load_type: LoadType) -> Result<()> {
    packet.clear();
    packet.append(&TX_HANDSHAKE)?;
    packet.append(command_for(load_type))?;
    packet.append(&encode_long_count(image.len()))?;
    encode_bytes(packet, image)
}

/// Build the packet that only asks for the version.
pub fn generate_identify_packet(packet: &mut ByteArray) -> Result<()> {
    packet.clear();
    packet.append(&TX_HANDSHAKE)?;
    packet.append(&SHUTDOWN_CMD)
}

// ****************************************************************************
//
// Private Impl/Functions/Modules
//
// ****************************************************************************

fn command_for(load_type: LoadType) -> &'static [u8] {
    match load_type {
        LoadType::Run => &LOAD_RUN_CMD,
        LoadType::ProgramAndShutdown => &PROGRAM_SHUTDOWN_CMD,
        LoadType::ProgramAndRun => &PROGRAM_RUN_CMD,
    }
}

/// Encode the image length, rounded up to whole longs, as 32 bits three at
/// a time. The last byte carries the final two bits.
fn encode_long_count(image_size: usize) -> [u8; LENGTH_FIELD_SIZE] {
    let mut n = ((image_size + 3) / 4) as u32;
    let mut field = [0u8; LENGTH_FIELD_SIZE];
    for (i, byte) in field.iter_mut().enumerate() {
        let last = if i == LENGTH_FIELD_SIZE - 1 { 0x60 } else { 0x00 };
        *byte = 0x92 | last | (n & 0x01) as u8 | ((n & 0x02) << 2) as u8 | ((n & 0x04) << 4) as u8;
        n >>= 3;
    }
    field
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
