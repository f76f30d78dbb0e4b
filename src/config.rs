//! Link settings shared by the loaders.

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// Baud rate the Propeller ROM listens at after reset.
pub const INITIAL_BAUD_RATE: u32 = 115_200;

/// Baud rate the second-stage loader switches to.
pub const FINAL_BAUD_RATE: u32 = 921_600;

/// Size of the data buffer in the second-stage loader.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Clock the second-stage loader runs at, in Hz.
pub const CLOCK_SPEED: f64 = 80_000_000.0;

/// Seconds the second stage waits for a packet before giving up.
pub const FAILSAFE_TIMEOUT: f64 = 2.0;

/// Capacity of the buffer holding one encoded ROM download. The encoded
/// second stage needs 1127 bytes.
pub const ROM_PACKET_SIZE: usize = 2048;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Settings for a download. `Config::default()` matches what the Propeller
/// ROM and the bundled second-stage loader expect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Baud rate used for the ROM protocol.
    pub initial_baud_rate: u32,
    /// Baud rate used for the packet protocol.
    pub final_baud_rate: u32,
    /// Largest payload per fast protocol packet.
    pub max_packet_size: usize,
    /// Propeller clock in Hz, used to derive the second stage bit timings.
    pub clock_speed: f64,
    /// Second stage failsafe timeout in seconds.
    pub failsafe_timeout: f64,
    /// Capacity of the encoded ROM packet buffer.
    pub rom_packet_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            initial_baud_rate: INITIAL_BAUD_RATE,
            final_baud_rate: FINAL_BAUD_RATE,
            max_packet_size: MAX_PACKET_SIZE,
            clock_speed: CLOCK_SPEED,
            failsafe_timeout: FAILSAFE_TIMEOUT,
            rom_packet_size: ROM_PACKET_SIZE,
        }
    }
}

impl Config {
    /// Same settings, different baud rates.
    pub fn with_baud_rates(self, initial_baud_rate: u32, final_baud_rate: u32) -> Config {
        Config {
            initial_baud_rate,
            final_baud_rate,
            ..self
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
