//! Downloads programs into a Parallax Propeller.
//!
//! The Propeller boots from a ROM that will accept a program over a serial
//! line after reset. This crate speaks that protocol (`PropellerLoader`) and
//! the much faster packet protocol of a small second-stage loader that is
//! itself delivered through the ROM (`FastPropellerLoader`). Both run over
//! anything that implements `Connection`, such as a host or embedded UART.
//! The bit-banged port in `soft_serial` does not implement `Connection`
//! itself; it supplies the receive and transmit halves to build one on.
//!
//! ```ignore
//! let mut loader = PropellerLoader::new(&mut uart);
//! loader.load(&image, LoadType::ProgramAndRun)?;
//! ```

#![no_std]

extern crate alloc;

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

pub mod config;
pub mod connection;
pub mod encoding;
pub mod error;
pub mod fast_loader;
pub mod handshake;
pub mod image;
pub mod loader;
pub mod packet;
pub mod soft_serial;

#[cfg(test)]
mod sim;

pub use config::Config;
pub use connection::{Connection, ConnectionError};
pub use error::{Error, Result};
pub use fast_loader::{FastLoaderState, FastPropellerLoader};
pub use image::PropellerImage;
pub use loader::{LoaderState, PropellerLoader};
pub use packet::ByteArray;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// What the Propeller should do with the image once it has it.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LoadType {
    /// Load into RAM and run it.
    Run,
    /// Write it to the boot EEPROM, then shut down.
    ProgramAndShutdown,
    /// Write it to the boot EEPROM, then run it.
    ProgramAndRun,
}

/// Anything that can put an image into a Propeller.
pub trait ImageTransport {
    fn load_image(&mut self, image: &[u8], load_type: LoadType) -> Result<()>;
}

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl LoadType {
    /// Does this load type write the EEPROM?
    pub fn programs_eeprom(self) -> bool {
        match self {
            LoadType::Run => false,
            LoadType::ProgramAndShutdown | LoadType::ProgramAndRun => true,
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
