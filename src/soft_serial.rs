//! A bit-banged serial port.
//!
//! Some boards wire the Propeller to GPIO pins with no UART behind them.
//! Receiving works from the pin-change interrupt: the falling edge of a
//! start bit lands in `InterruptRouter::dispatch`, which hands it to the
//! `SoftSerialRx` registered for that pin. The receiver clocks in the rest of
//! the frame and pushes the byte into its ring, where normal code picks it
//! up. Timing and pin access are left to `BitSampler` and `BitDriver`.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use core::cell::RefCell;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use critical_section::Mutex;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum SoftSerialError {
    /// The pin does not exist or is reserved.
    #[error("GPIO {0} cannot be used for serial")]
    InvalidPin(u8),
    /// Another receiver already owns the pin.
    #[error("GPIO {0} already has a receiver")]
    PinBusy(u8),
}

/// Something that wants to hear about edges on a pin.
pub trait EdgeHandler: Sync {
    /// The pin this handler listens on.
    fn pin(&self) -> u8;

    /// The pin level that marks a start bit.
    fn start_level(&self) -> bool;

    /// Called in interrupt context when the pin is at `start_level`.
    fn on_edge(&self);
}

/// Reads the receive line. Runs in interrupt context.
pub trait BitSampler {
    /// Wait until the middle of the next bit and return the line level.
    fn sample_bit(&self) -> bool;
}

/// Drives the transmit line.
pub trait BitDriver {
    fn set_level(&mut self, high: bool);

    /// Wait out one bit time.
    fn wait_bit(&mut self);
}

/// Single-producer single-consumer byte ring.
///
/// The interrupt side calls `push`; everything else runs in normal context.
/// One slot is kept free to tell full from empty, so it holds `N - 1` bytes.
pub struct RxRing<const N: usize> {
    buffer: [AtomicU8; N],
    head: AtomicUsize,
    tail: AtomicUsize,
}

/// Routes pin-change interrupts to the receiver registered on each pin.
pub struct InterruptRouter<'a> {
    handlers: Mutex<RefCell<[Option<&'a dyn EdgeHandler>; PIN_COUNT]>>,
}

/// The receive half of a soft serial port.
pub struct SoftSerialRx<S: BitSampler, const N: usize> {
    pin: u8,
    inverse: bool,
    sampler: S,
    ring: RxRing<N>,
    dropped: AtomicUsize,
}

/// The transmit half of a soft serial port.
pub struct SoftSerialTx<D: BitDriver> {
    pin: u8,
    inverse: bool,
    driver: D,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

/// GPIOs 0 to 15 can raise pin-change interrupts.
pub const PIN_COUNT: usize = 16;

/// The router the platform's GPIO interrupt should feed.
pub static INTERRUPT_ROUTER: InterruptRouter<'static> = InterruptRouter::new();

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

/// Pins 6 to 11 carry the SPI flash.
pub fn is_valid_pin(pin: u8) -> bool {
    pin <= 5 || (12..=15).contains(&pin)
}

impl<const N: usize> RxRing<N> {
    /// Fails to compile for rings that could never hold a byte.
    const CAPACITY_CHECK: () = assert!(N >= 2, "RxRing needs at least two slots");

    pub fn new() -> RxRing<N> {
        let () = Self::CAPACITY_CHECK;
        RxRing {
            buffer: core::array::from_fn(|_| AtomicU8::new(0)),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Store a byte. Returns `false` and drops it if the ring is full.
    pub fn push(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % N;
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        self.buffer[head].store(byte, Ordering::Relaxed);
        self.head.store(next, Ordering::Release);
        true
    }

    pub fn read(&self) -> Option<u8> {
        let byte = self.peek()?;
        let tail = self.tail.load(Ordering::Relaxed);
        self.tail.store((tail + 1) % N, Ordering::Release);
        Some(byte)
    }

    pub fn peek(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            None
        } else {
            Some(self.buffer[tail].load(Ordering::Relaxed))
        }
    }

    pub fn available(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        (head + N - tail) % N
    }

    /// Throw away everything received so far.
    pub fn flush(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }
}

impl<const N: usize> Default for RxRing<N> {
    fn default() -> RxRing<N> {
        RxRing::new()
    }
}

impl<'a> InterruptRouter<'a> {
    pub const fn new() -> InterruptRouter<'a> {
        InterruptRouter {
            handlers: Mutex::new(RefCell::new([None; PIN_COUNT])),
        }
    }

    /// Start routing edges on `handler.pin()` to `handler`.
    pub fn register(&self, handler: &'a dyn EdgeHandler) -> Result<(), SoftSerialError> {
        let pin = handler.pin();
        if !is_valid_pin(pin) {
            return Err(SoftSerialError::InvalidPin(pin));
        }
        critical_section::with(|cs| {
            let mut handlers = self.handlers.borrow_ref_mut(cs);
            let slot = &mut handlers[usize::from(pin)];
            if slot.is_some() {
                return Err(SoftSerialError::PinBusy(pin));
            }
            *slot = Some(handler);
            Ok(())
        })
    }

    /// Stop routing edges on `pin`, returning whoever had it.
    pub fn unregister(&self, pin: u8) -> Option<&'a dyn EdgeHandler> {
        if usize::from(pin) >= PIN_COUNT {
            return None;
        }
        critical_section::with(|cs| self.handlers.borrow_ref_mut(cs)[usize::from(pin)].take())
    }

    /// Handle one GPIO interrupt.
    ///
    /// `status` has a bit set for each pin that changed and `pin_level`
    /// reads a pin. The interrupt may fire on either edge, so a handler only
    /// runs if its pin is sitting at the start bit level.
    pub fn dispatch<F: Fn(u8) -> bool>(&self, status: u32, pin_level: F) {
        critical_section::with(|cs| {
            let handlers = *self.handlers.borrow_ref(cs);
            for (pin, handler) in handlers.iter().enumerate() {
                if status & (1 << pin) == 0 {
                    continue;
                }
                if let Some(handler) = handler {
                    if pin_level(pin as u8) == handler.start_level() {
                        handler.on_edge();
                    }
                }
            }
        });
    }
}

impl<'a> Default for InterruptRouter<'a> {
    fn default() -> InterruptRouter<'a> {
        InterruptRouter::new()
    }
}

impl<S: BitSampler, const N: usize> SoftSerialRx<S, N> {
    /// A receiver on `pin`. With `inverse` set the line idles low and data
    /// bits are inverted.
    pub fn new(pin: u8, inverse: bool, sampler: S) -> Result<SoftSerialRx<S, N>, SoftSerialError> {
        if !is_valid_pin(pin) {
            return Err(SoftSerialError::InvalidPin(pin));
        }
        Ok(SoftSerialRx {
            pin,
            inverse,
            sampler,
            ring: RxRing::new(),
            dropped: AtomicUsize::new(0),
        })
    }

    pub fn read(&self) -> Option<u8> {
        self.ring.read()
    }

    pub fn peek(&self) -> Option<u8> {
        self.ring.peek()
    }

    pub fn available(&self) -> usize {
        self.ring.available()
    }

    pub fn flush(&self) {
        self.ring.flush()
    }

    /// Bytes lost because the ring was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<S: BitSampler + Sync, const N: usize> EdgeHandler for SoftSerialRx<S, N> {
    fn pin(&self) -> u8 {
        self.pin
    }

    fn start_level(&self) -> bool {
        self.inverse
    }

    fn on_edge(&self) {
        let mut byte = 0u8;
        for _ in 0..8 {
            byte >>= 1;
            if self.sampler.sample_bit() {
                byte |= 0x80;
            }
        }
        if self.inverse {
            byte = !byte;
        }
        // stop bit
        self.sampler.sample_bit();
        if !self.ring.push(byte) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<D: BitDriver> SoftSerialTx<D> {
    /// A transmitter on `pin`. The line is put in its idle state straight
    /// away.
    pub fn new(pin: u8, inverse: bool, mut driver: D) -> Result<SoftSerialTx<D>, SoftSerialError> {
        if !is_valid_pin(pin) {
            return Err(SoftSerialError::InvalidPin(pin));
        }
        driver.set_level(!inverse);
        Ok(SoftSerialTx { pin, inverse, driver })
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Send one frame: start bit, eight data bits LSB first, stop bit.
    /// Interrupts are held off so the bit timing stays clean.
    pub fn write(&mut self, byte: u8) {
        let inverse = self.inverse;
        let driver = &mut self.driver;
        let bits = if inverse { !byte } else { byte };
        critical_section::with(|_| {
            driver.set_level(inverse);
            driver.wait_bit();
            for i in 0..8 {
                driver.set_level((bits >> i) & 0x01 != 0);
                driver.wait_bit();
            }
            driver.set_level(!inverse);
            driver.wait_bit();
        });
    }

    pub fn write_all(&mut self, data: &[u8]) -> usize {
        for &b in data {
            self.write(b);
        }
        data.len()
    }

    pub fn into_driver(self) -> D {
        self.driver
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
