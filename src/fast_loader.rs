//! The fast packet protocol.
//!
//! The ROM protocol spends most of its time on encoding overhead, so instead
//! of the user image we send a small second-stage loader through the ROM.
//! Once running it switches to the final baud rate and accepts the image in
//! raw packets:
//!
//! | offset | size | field                 |
//! |--------|------|-----------------------|
//! | 0      | 4    | packet id, LE         |
//! | 4      | 4    | transaction tag, LE   |
//! | 8      | n    | payload               |
//!
//! Each packet is answered with eight bytes: a result (normally the id of the
//! next packet it expects) and the echoed tag. Packet ids count down to zero
//! so the loader knows how many remain.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use alloc::vec::Vec;
use core::cmp;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, warn};
use rand::RngCore;

use crate::config::Config;
use crate::connection::{send_all, Connection, ConnectionError};
use crate::error::{Error, Result};
use crate::image::PropellerImage;
use crate::loader::PropellerLoader;
use crate::{ImageTransport, LoadType};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Where a fast load got to. Any failure leaves it in `Failed`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FastLoaderState {
    Begin,
    SecondStageStarted,
    Transmitting,
    VerifyingRam,
    ProgrammingEeprom,
    ReadyToLaunch,
    Launched,
    Failed,
}

/// Loads an image through the second-stage loader.
///
/// `R` supplies the transaction tags. Any `RngCore` will do; the tags only
/// need to differ between attempts.
pub struct FastPropellerLoader<'c, C: Connection + ?Sized, R: RngCore> {
    connection: &'c mut C,
    rng: R,
    config: Config,
    packet_id: i32,
    checksum: i32,
    state: FastLoaderState,
    frame: Vec<u8>,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// How long the second stage gets to report in after the ROM load.
pub const SECOND_STAGE_START_TIMEOUT_MS: u32 = 2000;

/// Default wait for a packet response.
pub const PACKET_TIMEOUT_MS: u32 = 2000;

/// Wait for the EEPROM programming response.
pub const EEPROM_PROGRAM_TIMEOUT_MS: u32 = 8000;

/// Times a packet is sent before giving up.
pub const PACKET_ATTEMPTS: u32 = 3;

/// Size of a packet header.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Cycles by which the second stage may misjudge a start bit.
pub const MAX_RX_SENSE_ERROR: f64 = 23.0;

/// Size of the second-stage loader image.
pub const RAW_LOADER_SIZE: usize = 392;

/// The host-initialised longs start this far before the end of the loader.
pub const RAW_LOADER_INIT_OFFSET_FROM_END: usize = 10 * 4 + 8;

/// The second-stage loader before its timing values are patched in.
pub static RAW_LOADER_IMAGE: [u8; RAW_LOADER_SIZE] = [
    0x00, 0xB4, 0xC4, 0x04, 0x6F, 0x2B, 0x10, 0x00, 0x88, 0x01, 0x90, 0x01, 0x80, 0x01, 0x94, 0x01,
    0x78, 0x01, 0x02, 0x00, 0x70, 0x01, 0x00, 0x00, 0x4D, 0xE8, 0xBF, 0xA0, 0x4D, 0xEC, 0xBF, 0xA0,
    0x51, 0xB8, 0xBC, 0xA1, 0x01, 0xB8, 0xFC, 0x28, 0xF1, 0xB9, 0xBC, 0x80, 0xA0, 0xB6, 0xCC, 0xA0,
    0x51, 0xB8, 0xBC, 0xF8, 0xF2, 0x99, 0x3C, 0x61, 0x05, 0xB6, 0xFC, 0xE4, 0x59, 0x24, 0xFC, 0x54,
    0x62, 0xB4, 0xBC, 0xA0, 0x02, 0xBC, 0xFC, 0xA0, 0x51, 0xB8, 0xBC, 0xA0, 0xF1, 0xB9, 0xBC, 0x80,
    0x04, 0xBE, 0xFC, 0xA0, 0x08, 0xC0, 0xFC, 0xA0, 0x51, 0xB8, 0xBC, 0xF8, 0x4D, 0xE8, 0xBF, 0x64,
    0x01, 0xB2, 0xFC, 0x21, 0x51, 0xB8, 0xBC, 0xF8, 0x4D, 0xE8, 0xBF, 0x70, 0x12, 0xC0, 0xFC, 0xE4,
    0x51, 0xB8, 0xBC, 0xF8, 0x4D, 0xE8, 0xBF, 0x68, 0x0F, 0xBE, 0xFC, 0xE4, 0x48, 0x24, 0xBC, 0x80,
    0x0E, 0xBC, 0xFC, 0xE4, 0x52, 0xA2, 0xBC, 0xA0, 0x54, 0x44, 0xFC, 0x50, 0x61, 0xB4, 0xFC, 0xA0,
    0x5A, 0x5E, 0xBC, 0x54, 0x5A, 0x60, 0xBC, 0x54, 0x5A, 0x62, 0xBC, 0x54, 0x04, 0xBE, 0xFC, 0xA0,
    0x54, 0xB6, 0xBC, 0xA0, 0x53, 0xB8, 0xBC, 0xA1, 0x00, 0xBA, 0xFC, 0xA0, 0x80, 0xBA, 0xFC, 0x72,
    0xF2, 0x99, 0x3C, 0x61, 0x25, 0xB6, 0xF8, 0xE4, 0x36, 0x00, 0x78, 0x5C, 0xF1, 0xB9, 0xBC, 0x80,
    0x51, 0xB8, 0xBC, 0xF8, 0xF2, 0x99, 0x3C, 0x61, 0x00, 0xBB, 0xFC, 0x70, 0x01, 0xBA, 0xFC, 0x29,
    0x2A, 0x00, 0x4C, 0x5C, 0xFF, 0xC2, 0xFC, 0x64, 0x5D, 0xC2, 0xBC, 0x68, 0x08, 0xC2, 0xFC, 0x20,
    0x55, 0x44, 0xFC, 0x50, 0x22, 0xBE, 0xFC, 0xE4, 0x01, 0xB4, 0xFC, 0x80, 0x1E, 0x00, 0x7C, 0x5C,
    0x22, 0xB6, 0xBC, 0xA0, 0xFF, 0xB7, 0xFC, 0x60, 0x54, 0xB6, 0x7C, 0x86, 0x00, 0x8E, 0x68, 0x0C,
    0x59, 0xC2, 0x3C, 0xC2, 0x09, 0x00, 0x54, 0x5C, 0x01, 0xB2, 0xFC, 0xC1, 0x63, 0x00, 0x70, 0x5C,
    0x63, 0xB4, 0xFC, 0x84, 0x45, 0xC6, 0x3C, 0x08, 0x04, 0x8A, 0xFC, 0x80, 0x48, 0x7E, 0xBC, 0x80,
    0x3F, 0xB4, 0xFC, 0xE4, 0x63, 0x7E, 0xFC, 0x54, 0x09, 0x00, 0x7C, 0x5C, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00,
    0xFF, 0xFF, 0xF9, 0xFF, 0x10, 0xC0, 0x07, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x40,
    0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x10, 0x6F, 0x00, 0x00, 0x00, 0xB6, 0x02, 0x00, 0x00,
    0x56, 0x00, 0x00, 0x00, 0x82, 0x00, 0x00, 0x00, 0x55, 0x73, 0xCB, 0x00, 0x18, 0x51, 0x00, 0x00,
    0x30, 0x00, 0x00, 0x00, 0x30, 0x00, 0x00, 0x00, 0x68, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x35, 0xC7, 0x08, 0x35, 0x2C, 0x32, 0x00, 0x00,
];

/// Second stage code that checksums RAM and reports the negated sum.
pub static VERIFY_RAM: [u8; 68] = [
    0x49, 0xBC, 0xBC, 0xA0, 0x45, 0xBC, 0xBC, 0x84, 0x02, 0xBC, 0xFC, 0x2A, 0x45, 0x8C, 0x14, 0x08,
    0x04, 0x8A, 0xD4, 0x80, 0x66, 0xBC, 0xD4, 0xE4, 0x0A, 0xBC, 0xFC, 0x04, 0x04, 0xBC, 0xFC, 0x84,
    0x5E, 0x94, 0x3C, 0x08, 0x04, 0xBC, 0xFC, 0x84, 0x5E, 0x94, 0x3C, 0x08, 0x01, 0x8A, 0xFC, 0x84,
    0x45, 0xBE, 0xBC, 0x00, 0x5F, 0x8C, 0xBC, 0x80, 0x6E, 0x8A, 0x7C, 0xE8, 0x46, 0xB2, 0xBC, 0xA4,
    0x09, 0x00, 0x7C, 0x5C,
];

/// Second stage code that copies RAM into the EEPROM and reads it back.
pub static PROGRAM_VERIFY_EEPROM: [u8; 316] = [
    0x03, 0x8C, 0xFC, 0x2C, 0x4F, 0xEC, 0xBF, 0x68, 0x82, 0x18, 0xFD, 0x5C, 0x40, 0xBE, 0xFC, 0xA0,
    0x45, 0xBA, 0xBC, 0x00, 0xA0, 0x62, 0xFD, 0x5C, 0x79, 0x00, 0x70, 0x5C, 0x01, 0x8A, 0xFC, 0x80,
    0x67, 0xBE, 0xFC, 0xE4, 0x8F, 0x3E, 0xFD, 0x5C, 0x49, 0x8A, 0x3C, 0x86, 0x65, 0x00, 0x54, 0x5C,
    0x00, 0x8A, 0xFC, 0xA0, 0x49, 0xBE, 0xBC, 0xA0, 0x7D, 0x02, 0xFD, 0x5C, 0xA3, 0x62, 0xFD, 0x5C,
    0x45, 0xC0, 0xBC, 0x00, 0x5D, 0xC0, 0x3C, 0x86, 0x79, 0x00, 0x54, 0x5C, 0x01, 0x8A, 0xFC, 0x80,
    0x72, 0xBE, 0xFC, 0xE4, 0x01, 0x8C, 0xFC, 0x28, 0x8F, 0x3E, 0xFD, 0x5C, 0x01, 0x8C, 0xFC, 0x28,
    0x46, 0xB2, 0xBC, 0xA4, 0x09, 0x00, 0x7C, 0x5C, 0x82, 0x18, 0xFD, 0x5C, 0xA1, 0xBA, 0xFC, 0xA0,
    0x8D, 0x62, 0xFD, 0x5C, 0x79, 0x00, 0x70, 0x5C, 0x00, 0x00, 0x7C, 0x5C, 0xFF, 0xBD, 0xFC, 0xA0,
    0xA0, 0xBA, 0xFC, 0xA0, 0x8D, 0x62, 0xFD, 0x5C, 0x83, 0xBC, 0xF0, 0xE4, 0x45, 0xBA, 0x8C, 0xA0,
    0x08, 0xBA, 0xCC, 0x28, 0xA0, 0x62, 0xCD, 0x5C, 0x45, 0xBA, 0x8C, 0xA0, 0xA0, 0x62, 0xCD, 0x5C,
    0x79, 0x00, 0x70, 0x5C, 0x00, 0x00, 0x7C, 0x5C, 0x47, 0x8E, 0x3C, 0x62, 0x90, 0x00, 0x7C, 0x5C,
    0x47, 0x8E, 0x3C, 0x66, 0x09, 0xC0, 0xFC, 0xA0, 0x58, 0xB8, 0xBC, 0xA0, 0xF1, 0xB9, 0xBC, 0x80,
    0x4F, 0xE8, 0xBF, 0x64, 0x4E, 0xEC, 0xBF, 0x78, 0x56, 0xB8, 0xBC, 0xF8, 0x4F, 0xE8, 0xBF, 0x68,
    0xF2, 0x9D, 0x3C, 0x61, 0x56, 0xB8, 0xBC, 0xF8, 0x4E, 0xEC, 0xBB, 0x7C, 0x00, 0xB8, 0xF8, 0xF8,
    0xF2, 0x9D, 0x28, 0x61, 0x91, 0xC0, 0xCC, 0xE4, 0x79, 0x00, 0x44, 0x5C, 0x7B, 0x00, 0x48, 0x5C,
    0x00, 0x00, 0x68, 0x5C, 0x01, 0xBA, 0xFC, 0x2C, 0x01, 0xBA, 0xFC, 0x68, 0xA4, 0x00, 0x7C, 0x5C,
    0xFE, 0xBB, 0xFC, 0xA0, 0x09, 0xC0, 0xFC, 0xA0, 0x58, 0xB8, 0xBC, 0xA0, 0xF1, 0xB9, 0xBC, 0x80,
    0x4F, 0xE8, 0xBF, 0x64, 0x00, 0xBB, 0x7C, 0x62, 0x01, 0xBA, 0xFC, 0x34, 0x4E, 0xEC, 0xBF, 0x78,
    0x57, 0xB8, 0xBC, 0xF8, 0x4F, 0xE8, 0xBF, 0x68, 0xF2, 0x9D, 0x3C, 0x61, 0x58, 0xB8, 0xBC, 0xF8,
    0xA7, 0xC0, 0xFC, 0xE4, 0xFF, 0xBA, 0xFC, 0x60, 0x00, 0x00, 0x7C, 0x5C,
];

/// Second stage code that prepares to start the user program.
pub static READY_TO_LAUNCH: [u8; 60] = [
    0xB8, 0x72, 0xFC, 0x58, 0x66, 0x72, 0xFC, 0x50, 0x09, 0x00, 0x7C, 0x5C, 0x06, 0xBE, 0xFC, 0x04,
    0x10, 0xBE, 0x7C, 0x86, 0x00, 0x8E, 0x54, 0x0C, 0x04, 0xBE, 0xFC, 0x00, 0x78, 0xBE, 0xFC, 0x60,
    0x50, 0xBE, 0xBC, 0x68, 0x00, 0xBE, 0x7C, 0x0C, 0x40, 0xAE, 0xFC, 0x2C, 0x6E, 0xAE, 0xFC, 0xE4,
    0x04, 0xBE, 0xFC, 0x00, 0x00, 0xBE, 0x7C, 0x0C, 0x02, 0x96, 0x7C, 0x0C,
];

/// Starts the user program. Never answered.
pub static LAUNCH_NOW: [u8; 4] = [
    0x66, 0x00, 0x7C, 0x5C,
];

/// The call frame the second stage writes below the image. It counts
/// towards the RAM checksum.
pub static INIT_CALL_FRAME: [u8; 8] = [
    0xFF, 0xFF, 0xF9, 0xFF, 0xFF, 0xFF, 0xF9, 0xFF,
];

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl<'c, C: Connection + ?Sized, R: RngCore> FastPropellerLoader<'c, C, R> {
    pub fn new(connection: &'c mut C, rng: R, config: Config) -> FastPropellerLoader<'c, C, R> {
        FastPropellerLoader {
            connection,
            rng,
            config,
            packet_id: 0,
            checksum: 0,
            state: FastLoaderState::Begin,
            frame: Vec::new(),
        }
    }

    pub fn state(&self) -> FastLoaderState {
        self.state
    }

    /// The id the next packet will carry.
    pub fn packet_id(&self) -> i32 {
        self.packet_id
    }

    /// Running sum of every image byte sent so far.
    pub fn checksum(&self) -> i32 {
        self.checksum
    }

    /// Largest payload per packet: the configured size, capped by what the
    /// connection can carry.
    pub fn packet_size(&self) -> usize {
        cmp::max(1, cmp::min(self.config.max_packet_size, self.connection.max_data_size()))
    }

    /// Start the second stage for an image of `image_size` bytes.
    ///
    /// Loads the patched second stage through the ROM at `initial_baud_rate`,
    /// waits for it to report in and moves the connection to
    /// `final_baud_rate`.
    pub fn load_begin(&mut self, image_size: usize, initial_baud_rate: u32, final_baud_rate: u32) -> Result<()> {
        let result = self.run_load_begin(image_size, initial_baud_rate, final_baud_rate);
        self.fail_on_error(result)
    }

    /// Send image data. May be called repeatedly with consecutive pieces.
    pub fn load_data(&mut self, data: &[u8]) -> Result<()> {
        let result = self.run_load_data(data);
        self.fail_on_error(result)
    }

    /// Verify the image, program the EEPROM if asked to, and start it.
    pub fn load_end(&mut self, load_type: LoadType) -> Result<()> {
        let result = self.run_load_end(load_type);
        self.fail_on_error(result)
    }

    /// Send one packet and wait for its answer, trying up to
    /// `PACKET_ATTEMPTS` times with a fresh tag each time.
    ///
    /// An answer only counts if all eight bytes arrive, the tag matches and
    /// the result differs from `id`; a result equal to `id` is a stale echo.
    pub fn transmit_packet(&mut self, id: i32, payload: &[u8], timeout_ms: u32) -> Result<i32> {
        let mut response = [0u8; PACKET_HEADER_SIZE];
        for attempt in 1..=PACKET_ATTEMPTS {
            let tag = self.rng.next_u32() as i32;
            self.send_frame(id, tag, payload)?;
            match self.connection.receive_data_exact_timeout(&mut response, timeout_ms) {
                Ok(()) => {
                    debug!("packet {} response {:02x?}", id, response);
                    let result = LittleEndian::read_i32(&response[0..4]);
                    let echoed = LittleEndian::read_i32(&response[4..8]);
                    if echoed == tag && result != id {
                        return Ok(result);
                    }
                    warn!(
                        "packet {} attempt {} rejected: tag {} (sent {}), result {}",
                        id, attempt, echoed, tag, result
                    );
                }
                Err(ConnectionError::Timeout) => {
                    warn!("packet {} attempt {} timed out", id, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        error!("packet {} failed after {} attempts", id, PACKET_ATTEMPTS);
        Err(Error::PacketTimeout {
            id,
            attempts: PACKET_ATTEMPTS,
        })
    }

    /// Send one packet without waiting for an answer.
    pub fn send_packet(&mut self, id: i32, payload: &[u8]) -> Result<()> {
        let tag = self.rng.next_u32() as i32;
        self.send_frame(id, tag, payload)
    }

    fn run_load_begin(&mut self, image_size: usize, initial_baud_rate: u32, final_baud_rate: u32) -> Result<()> {
        self.state = FastLoaderState::Begin;
        let packet_size = self.packet_size();
        self.packet_id = ((image_size + packet_size - 1) / packet_size) as i32;
        info!(
            "starting second stage for {} byte image in {} packets",
            image_size, self.packet_id
        );

        let second_stage =
            generate_initial_loader_image(&self.config, self.packet_id, initial_baud_rate, final_baud_rate)?;

        if self.connection.baud_rate() != initial_baud_rate {
            self.switch_baud_rate(initial_baud_rate)?;
        }

        PropellerLoader::with_packet_capacity(&mut *self.connection, self.config.rom_packet_size)
            .load(&second_stage, LoadType::Run)
            .map_err(|e| {
                error!("failed to load second stage: {}", e);
                e
            })?;

        let mut response = [0u8; PACKET_HEADER_SIZE];
        if let Err(e) = self
            .connection
            .receive_data_exact_timeout(&mut response, SECOND_STAGE_START_TIMEOUT_MS)
        {
            error!("second stage failed to start: {}", e);
            return Err(e.into());
        }
        debug!("second stage response {:02x?}", response);
        let result = LittleEndian::read_i32(&response[0..4]);
        if result != self.packet_id {
            error!(
                "second stage failed to start: expected {}, received {}",
                self.packet_id, result
            );
            return Err(Error::ResultMismatch {
                expected: self.packet_id,
                received: result,
            });
        }
        self.state = FastLoaderState::SecondStageStarted;

        self.switch_baud_rate(final_baud_rate)?;
        self.checksum = 0;
        Ok(())
    }

    fn run_load_data(&mut self, data: &[u8]) -> Result<()> {
        self.expect_transmitting()?;
        self.state = FastLoaderState::Transmitting;
        let packet_size = self.packet_size();
        for chunk in data.chunks(packet_size) {
            let expected = self.packet_id.wrapping_sub(1);
            let result = self.transmit_packet(self.packet_id, chunk, PACKET_TIMEOUT_MS)?;
            check_result(expected, result)?;
            self.packet_id = expected;
        }
        self.checksum = data
            .iter()
            .fold(self.checksum, |sum, &b| sum.wrapping_add(i32::from(b)));
        Ok(())
    }

    fn run_load_end(&mut self, load_type: LoadType) -> Result<()> {
        self.expect_transmitting()?;
        self.checksum = INIT_CALL_FRAME
            .iter()
            .fold(self.checksum, |sum, &b| sum.wrapping_add(i32::from(b)));

        info!("verifying RAM");
        self.state = FastLoaderState::VerifyingRam;
        let expected = self.checksum.wrapping_neg();
        let result = self.transmit_packet(self.packet_id, &VERIFY_RAM, PACKET_TIMEOUT_MS)?;
        check_result(expected, result)?;
        self.packet_id = expected;

        if load_type.programs_eeprom() {
            info!("programming EEPROM");
            self.state = FastLoaderState::ProgrammingEeprom;
            let expected = self.checksum.wrapping_neg().wrapping_mul(2);
            let result = self.transmit_packet(self.packet_id, &PROGRAM_VERIFY_EEPROM, EEPROM_PROGRAM_TIMEOUT_MS)?;
            check_result(expected, result)?;
            self.packet_id = expected;
        }

        self.state = FastLoaderState::ReadyToLaunch;
        let expected = self.packet_id.wrapping_sub(1);
        let result = self.transmit_packet(self.packet_id, &READY_TO_LAUNCH, PACKET_TIMEOUT_MS)?;
        check_result(expected, result)?;
        self.packet_id = expected;

        self.send_packet(0, &LAUNCH_NOW)?;
        info!("launched");
        self.state = FastLoaderState::Launched;
        Ok(())
    }

    fn expect_transmitting(&self) -> Result<()> {
        match self.state {
            FastLoaderState::SecondStageStarted | FastLoaderState::Transmitting => Ok(()),
            state => {
                error!("second stage not running ({:?})", state);
                Err(Error::InvalidState)
            }
        }
    }

    fn switch_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.connection.set_baud_rate(baud_rate).map_err(|e| {
            error!("setting baud rate {} failed: {}", baud_rate, e);
            Error::BaudRateSwitch(baud_rate)
        })
    }

    /// Header and payload go out in one write so the second stage sees them
    /// back to back.
    fn send_frame(&mut self, id: i32, tag: i32, payload: &[u8]) -> Result<()> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        LittleEndian::write_i32(&mut header[0..4], id);
        LittleEndian::write_i32(&mut header[4..8], tag);
        self.frame.clear();
        self.frame.extend_from_slice(&header);
        self.frame.extend_from_slice(payload);
        send_all(&mut *self.connection, &self.frame)?;
        Ok(())
    }

    fn fail_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = FastLoaderState::Failed;
        }
        result
    }
}

impl<'c, C: Connection + ?Sized, R: RngCore> ImageTransport for FastPropellerLoader<'c, C, R> {
    fn load_image(&mut self, image: &[u8], load_type: LoadType) -> Result<()> {
        let initial_baud_rate = self.config.initial_baud_rate;
        let final_baud_rate = self.config.final_baud_rate;
        self.load_begin(image.len(), initial_baud_rate, final_baud_rate)?;
        self.load_data(image)?;
        self.load_end(load_type)
    }
}

/// Patch the second-stage template for these baud rates and packet count.
///
/// The values land in the host-initialised longs near the end of the loader,
/// then the image checksum is fixed up.
pub fn generate_initial_loader_image(
    config: &Config,
    packet_id: i32,
    initial_baud_rate: u32,
    final_baud_rate: u32,
) -> Result<[u8; RAW_LOADER_SIZE]> {
    let clock = config.clock_speed;
    let initial_rate = f64::from(initial_baud_rate);
    let final_rate = f64::from(final_baud_rate);
    let init = RAW_LOADER_SIZE - RAW_LOADER_INIT_OFFSET_FROM_END;

    let mut data = RAW_LOADER_IMAGE;
    let mut image = PropellerImage::new(&mut data)?;
    // initial bit time
    image.set_long(init + 4, round(clock / initial_rate) as u32);
    // final bit time
    image.set_long(init + 8, round(clock / final_rate) as u32);
    // 1.5 final bit times less the start bit sense error
    image.set_long(init + 12, round(1.5 * clock / final_rate - MAX_RX_SENSE_ERROR) as u32);
    // failsafe, in receive loop iterations of 12 cycles
    image.set_long(init + 16, round(config.failsafe_timeout * clock / 12.0) as u32);
    // end of packet, two bytes of receive loop iterations
    image.set_long(init + 20, round((2.0 * clock / final_rate) * (10.0 / 12.0)) as u32);
    image.set_long(init + 36, packet_id as u32);
    image.update_checksum();
    Ok(data)
}

// ****************************************************************************
//
// Private Impl/Functions/Modules
//
// ****************************************************************************

/// Round half up, then truncate towards zero.
fn round(value: f64) -> i32 {
    (value + 0.5) as i32
}

fn check_result(expected: i32, received: i32) -> Result<()> {
    if received == expected {
        Ok(())
    } else {
        error!("unexpected result: expected {}, received {}", expected, received);
        Err(Error::ResultMismatch { expected, received })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{PropellerImage, SPIN_TARGET_CHECKSUM};
    use crate::sim::{rom_decode, stream_bits, Reply, SecondStage, SimPropeller};
    use alloc::vec;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    const INIT: usize = RAW_LOADER_SIZE - RAW_LOADER_INIT_OFFSET_FROM_END;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0x5EED)
    }

    fn test_image(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 13 + 5) as u8).collect()
    }

    fn image_checksum(image: &[u8]) -> i32 {
        image
            .iter()
            .chain(INIT_CALL_FRAME.iter())
            .fold(0i32, |sum, &b| sum + i32::from(b))
    }

    /// A Propeller that boots the second stage and then reports `packet_id`.
    fn booting_sim(packet_id: i32) -> SimPropeller {
        let mut sim = SimPropeller::booting(SecondStage::default());
        sim.script_rom_reply();
        let mut ready = [0u8; 8];
        LittleEndian::write_i32(&mut ready[0..4], packet_id);
        sim.script(&ready);
        sim
    }

    #[test]
    fn check_initial_loader_image() {
        let mut data = generate_initial_loader_image(&Config::default(), 3, 115_200, 921_600).unwrap();
        let image = PropellerImage::new(&mut data).unwrap();
        assert_eq!(image.get_long(INIT + 4), 694);
        assert_eq!(image.get_long(INIT + 8), 87);
        assert_eq!(image.get_long(INIT + 12), 107);
        assert_eq!(image.get_long(INIT + 16), 13_333_333);
        assert_eq!(image.get_long(INIT + 20), 145);
        assert_eq!(image.get_long(INIT + 36), 3);
        let sum = image.image_data().iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        assert_eq!(sum, SPIN_TARGET_CHECKSUM);
        // Code before the patched area is untouched.
        assert_eq!(&image.image_data()[16..INIT], &RAW_LOADER_IMAGE[16..INIT]);
    }

    #[test]
    fn check_full_load_run() {
        let image = test_image(2050);
        let mut sim = booting_sim(3);
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
            assert_eq!(loader.load_image(&image, LoadType::Run), Ok(()));
            assert_eq!(loader.state(), FastLoaderState::Launched);
        }
        let second_stage = generate_initial_loader_image(&Config::default(), 3, 115_200, 921_600).unwrap();
        assert_eq!(rom_decode(&sim.sent[0][220..]), stream_bits(&second_stage));
        assert_eq!(sim.baud_changes, vec![921_600]);

        let checksum = image_checksum(&image);
        let ids: Vec<i32> = sim.packets.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 2, 1, 0, -checksum, 0]);
        let sizes: Vec<usize> = sim.packets.iter().map(|p| p.payload.len()).collect();
        assert_eq!(sizes, vec![1024, 1024, 2, 68, 60, 4]);
        assert_eq!(&sim.packets[2].payload[..], &image[2048..]);
    }

    #[test]
    fn check_full_load_program() {
        let image = test_image(100);
        let mut sim = booting_sim(1);
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
            assert_eq!(loader.load_image(&image, LoadType::ProgramAndRun), Ok(()));
        }
        let checksum = image_checksum(&image);
        let ids: Vec<i32> = sim.packets.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 0, -checksum, -checksum * 2, 0]);
        assert_eq!(&sim.packets[2].payload[..], &PROGRAM_VERIFY_EEPROM[..]);
        assert_eq!(&sim.packets[4].payload[..], &LAUNCH_NOW[..]);
    }

    #[test]
    fn check_program_and_shutdown_timeouts() {
        let image = test_image(100);
        let mut sim = booting_sim(1);
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
            assert_eq!(loader.load_image(&image, LoadType::ProgramAndShutdown), Ok(()));
            assert_eq!(loader.state(), FastLoaderState::Launched);
        }
        assert_eq!(
            sim.timeouts,
            vec![
                (129, 2000), // ROM handshake
                (1, 10),     // RAM checksum ack
                (8, SECOND_STAGE_START_TIMEOUT_MS),
                (8, PACKET_TIMEOUT_MS), // data
                (8, PACKET_TIMEOUT_MS), // verify RAM
                (8, EEPROM_PROGRAM_TIMEOUT_MS),
                (8, PACKET_TIMEOUT_MS), // ready to launch
            ]
        );
        assert_eq!(EEPROM_PROGRAM_TIMEOUT_MS, 8000);
        let checksum = image_checksum(&image);
        let ids: Vec<i32> = sim.packets.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 0, -checksum, -checksum * 2, 0]);
        assert_eq!(&sim.packets[2].payload[..], &PROGRAM_VERIFY_EEPROM[..]);
    }

    #[test]
    fn check_packet_size_follows_connection() {
        let image = test_image(1100);
        let mut sim = booting_sim(3);
        sim.max_data_size = 512;
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
            assert_eq!(loader.packet_size(), 512);
            assert_eq!(loader.load_image(&image, LoadType::Run), Ok(()));
        }
        let sizes: Vec<usize> = sim.packets.iter().take(3).map(|p| p.payload.len()).collect();
        assert_eq!(sizes, vec![512, 512, 76]);
    }

    #[test]
    fn check_switches_to_initial_baud_rate() {
        let mut sim = booting_sim(1);
        sim.baud = 9600;
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
            assert_eq!(loader.load_image(&test_image(10), LoadType::Run), Ok(()));
        }
        assert_eq!(sim.baud_changes, vec![115_200, 921_600]);
    }

    #[test]
    fn check_configured_final_baud_rate() {
        let config = Config::default().with_baud_rates(115_200, 230_400);
        let mut sim = booting_sim(1);
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), config);
            assert_eq!(loader.load_image(&test_image(10), LoadType::Run), Ok(()));
        }
        assert_eq!(sim.baud_changes, vec![230_400]);
        let mut data = generate_initial_loader_image(&config, 1, 115_200, 230_400).unwrap();
        let image = PropellerImage::new(&mut data).unwrap();
        assert_eq!(image.get_long(INIT + 8), 347);
    }

    #[test]
    fn check_second_stage_must_report_packet_count() {
        let mut sim = booting_sim(7);
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
            assert_eq!(
                loader.load_begin(2050, 115_200, 921_600),
                Err(Error::ResultMismatch {
                    expected: 3,
                    received: 7
                })
            );
            assert_eq!(loader.state(), FastLoaderState::Failed);
        }
        assert!(sim.baud_changes.is_empty());
    }

    #[test]
    fn check_baud_rate_failure() {
        let mut sim = booting_sim(1);
        sim.fail_baud = true;
        let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
        assert_eq!(
            loader.load_begin(10, 115_200, 921_600),
            Err(Error::BaudRateSwitch(921_600))
        );
    }

    #[test]
    fn check_data_before_begin() {
        let mut sim = SimPropeller::with_responder(SecondStage::default());
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
            assert_eq!(loader.load_data(&[1, 2, 3]), Err(Error::InvalidState));
            assert_eq!(loader.load_end(LoadType::Run), Err(Error::InvalidState));
        }
        assert!(sim.sent.is_empty());
    }

    #[test]
    fn check_stale_echo_is_retried() {
        let mut sim = SimPropeller::with_responder(|id: i32, _: &[u8]| Reply::Result(id));
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
            assert_eq!(
                loader.transmit_packet(5, &[1, 2, 3], PACKET_TIMEOUT_MS),
                Err(Error::PacketTimeout { id: 5, attempts: 3 })
            );
        }
        assert_eq!(sim.packets.len(), 3);
        assert!(sim.packets.iter().all(|p| p.id == 5 && p.payload == [1, 2, 3]));
        assert_ne!(sim.packets[0].tag, sim.packets[1].tag);
        assert_ne!(sim.packets[1].tag, sim.packets[2].tag);
    }

    #[test]
    fn check_wrong_tag_is_retried() {
        let mut calls = 0;
        let mut sim = SimPropeller::with_responder(move |id: i32, _: &[u8]| {
            calls += 1;
            if calls == 1 {
                Reply::WrongTag(id - 1)
            } else {
                Reply::Result(id - 1)
            }
        });
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
            assert_eq!(loader.transmit_packet(5, &[0; 16], PACKET_TIMEOUT_MS), Ok(4));
        }
        assert_eq!(sim.packets.len(), 2);
    }

    #[test]
    fn check_short_response_is_retried() {
        let mut calls = 0;
        let mut sim = SimPropeller::with_responder(move |id: i32, _: &[u8]| {
            calls += 1;
            match calls {
                1 => Reply::Short,
                2 => Reply::Silent,
                _ => Reply::Result(id - 1),
            }
        });
        let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
        assert_eq!(loader.transmit_packet(2, &[9], PACKET_TIMEOUT_MS), Ok(1));
    }

    #[test]
    fn check_bad_ram_checksum() {
        let mut sim = booting_sim(1);
        let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
        loader.load_begin(4, 115_200, 921_600).unwrap();
        loader.load_data(&[1, 2, 3, 4]).unwrap();
        assert_eq!(loader.checksum(), 10);
        // Pretend part of the image went missing.
        loader.checksum += 1;
        let expected = -(10 + 1 + image_checksum(&[]));
        match loader.load_end(LoadType::Run) {
            Err(Error::ResultMismatch { expected: e, .. }) if e == expected => {}
            e => panic!("Did not expect: {:?}", e),
        }
        assert_eq!(loader.state(), FastLoaderState::Failed);
    }

    #[test]
    fn check_launch_is_not_answered() {
        let mut sim = SimPropeller::with_responder(|_: i32, _: &[u8]| Reply::Silent);
        {
            let mut loader = FastPropellerLoader::new(&mut sim, rng(), Config::default());
            assert_eq!(loader.send_packet(0, &LAUNCH_NOW), Ok(()));
        }
        assert_eq!(sim.receives, 0);
        assert_eq!(sim.sent[0].len(), PACKET_HEADER_SIZE + LAUNCH_NOW.len());
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
