//! Access to a Propeller executable image.
//!
//! A Spin image starts with a 16 byte header:
//!
//! | offset | size | field   |
//! |--------|------|---------|
//! | 0      | 4    | clkfreq |
//! | 4      | 1    | clkmode |
//! | 5      | 1    | chksum  |
//! | 6      | 2    | pbase   |
//! | 8      | 2    | vbase   |
//! | 10     | 2    | dbase   |
//! | 12     | 2    | pcurr   |
//! | 14     | 2    | dcurr   |
//!
//! All multi-byte fields are little-endian. The ROM only accepts an image
//! whose bytes sum to `SPIN_TARGET_CHECKSUM` modulo 256.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// A view over image bytes owned by someone else. Nothing is copied; edits
/// go straight to the caller's buffer.
#[derive(Debug)]
pub struct PropellerImage<'a> {
    data: &'a mut [u8],
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// What the bytes of a valid image must sum to.
pub const SPIN_TARGET_CHECKSUM: u8 = 0x14;

/// Size of the Spin header.
pub const HEADER_SIZE: usize = 16;

pub const OFFSET_CLKFREQ: usize = 0;
pub const OFFSET_CLKMODE: usize = 4;
pub const OFFSET_CHKSUM: usize = 5;
pub const OFFSET_PBASE: usize = 6;
pub const OFFSET_VBASE: usize = 8;
pub const OFFSET_DBASE: usize = 10;
pub const OFFSET_PCURR: usize = 12;
pub const OFFSET_DCURR: usize = 14;

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl<'a> PropellerImage<'a> {
    /// Wrap `data`. Fails if it cannot hold a header.
    pub fn new(data: &'a mut [u8]) -> Result<PropellerImage<'a>> {
        check_size(data)?;
        Ok(PropellerImage { data })
    }

    /// Point at a different buffer.
    pub fn set_image(&mut self, data: &'a mut [u8]) -> Result<()> {
        check_size(data)?;
        self.data = data;
        Ok(())
    }

    pub fn image_data(&self) -> &[u8] {
        self.data
    }

    pub fn image_size(&self) -> usize {
        self.data.len()
    }

    /// Rewrite the checksum byte so the image sums to
    /// `SPIN_TARGET_CHECKSUM`.
    ///
    /// Returns the sum of the image with the checksum byte zeroed, before
    /// the new checksum was written.
    pub fn update_checksum(&mut self) -> u8 {
        self.data[OFFSET_CHKSUM] = 0;
        let sum = self.data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        self.data[OFFSET_CHKSUM] = SPIN_TARGET_CHECKSUM.wrapping_sub(sum);
        sum
    }

    pub fn clk_freq(&self) -> u32 {
        self.get_long(OFFSET_CLKFREQ)
    }

    pub fn set_clk_freq(&mut self, clk_freq: u32) {
        self.set_long(OFFSET_CLKFREQ, clk_freq);
    }

    pub fn clk_mode(&self) -> u8 {
        self.get_byte(OFFSET_CLKMODE)
    }

    pub fn set_clk_mode(&mut self, clk_mode: u8) {
        self.set_byte(OFFSET_CLKMODE, clk_mode);
    }

    pub fn checksum(&self) -> u8 {
        self.get_byte(OFFSET_CHKSUM)
    }

    pub fn pbase(&self) -> u16 {
        self.get_word(OFFSET_PBASE)
    }

    pub fn set_pbase(&mut self, value: u16) {
        self.set_word(OFFSET_PBASE, value);
    }

    pub fn vbase(&self) -> u16 {
        self.get_word(OFFSET_VBASE)
    }

    pub fn set_vbase(&mut self, value: u16) {
        self.set_word(OFFSET_VBASE, value);
    }

    pub fn dbase(&self) -> u16 {
        self.get_word(OFFSET_DBASE)
    }

    pub fn set_dbase(&mut self, value: u16) {
        self.set_word(OFFSET_DBASE, value);
    }

    pub fn pcurr(&self) -> u16 {
        self.get_word(OFFSET_PCURR)
    }

    pub fn set_pcurr(&mut self, value: u16) {
        self.set_word(OFFSET_PCURR, value);
    }

    pub fn dcurr(&self) -> u16 {
        self.get_word(OFFSET_DCURR)
    }

    pub fn set_dcurr(&mut self, value: u16) {
        self.set_word(OFFSET_DCURR, value);
    }

    /// Raw accessors. These panic if `offset` runs past the end of the
    /// image, like slice indexing.
    pub fn get_byte(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn set_byte(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    pub fn get_word(&self, offset: usize) -> u16 {
        LittleEndian::read_u16(&self.data[offset..offset + 2])
    }

    pub fn set_word(&mut self, offset: usize, value: u16) {
        LittleEndian::write_u16(&mut self.data[offset..offset + 2], value);
    }

    pub fn get_long(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.data[offset..offset + 4])
    }

    pub fn set_long(&mut self, offset: usize, value: u32) {
        LittleEndian::write_u32(&mut self.data[offset..offset + 4], value);
    }
}

// ****************************************************************************
//
// Private Impl/Functions/Modules
//
// ****************************************************************************

fn check_size(data: &[u8]) -> Result<()> {
    if data.len() < HEADER_SIZE {
        Err(Error::ImageTooSmall(data.len()))
    } else {
        Ok(())
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
