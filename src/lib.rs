//! Raspberry Pi peripherals from userspace, without middleware.
//!
//! GPIO goes through a shared mapping of the GPIO register block (`/dev/gpiomem`),
//! SPI and I2C/SMBus through the kernel's `spidev` and `i2c-dev` ioctls.
//!
//! Each peripheral has its own manager, grouped in [`Peripherals`]. Managers
//! must be initialized before use and hand out plain integer handles: GPIO pin
//! numbers, and 1-based device ids in the order the SPI or I2C devices were
//! opened.
//!
//! ```no_run
//! use baremetal_pi::{Mode, Peripherals, SpiConfig, TransferOverrides};
//!
//! # fn main() -> baremetal_pi::Result<()> {
//! let mut p = Peripherals::new();
//!
//! p.gpio.initialize()?;
//! p.gpio.set_mode(9, Mode::Out)?;
//! p.gpio.set(&[9])?;
//!
//! p.spi.initialize(&["/dev/spidev0.0"], &SpiConfig::default())?;
//! let (rx, count) = p.spi.transfer_one(1, &[0x01, 0x80, 0x00], &TransferOverrides::default())?;
//! assert_eq!(rx.len(), count);
//!
//! p.i2c.initialize(&["/dev/i2c-1"])?;
//! p.i2c.select_slave(1, 0x48, false)?;
//! let block = p.i2c.read_i2c_block_data(1, 0x10, 4)?;
//! assert_eq!(block.len(), 5);
//!
//! p.close_all();
//! # Ok(())
//! # }
//! ```
//!
//! Nothing here locks. Calls on one device must be serialized by the caller.

mod error;
pub mod sys;

pub use error::{Error, Result};
pub use sys::gpio::{Gpio, GpioConfig, Mode, PIN_COUNT};
pub use sys::i2c::{Capabilities, I2c, I2cBus, I2cdev};
pub use sys::spi::{Setting, Spi, SpiBus, SpiConfig, Spidev, TransferOverrides};

/// The opened peripherals of one process, or of one test.
#[derive(Debug)]
pub struct Peripherals<S: SpiBus = Spidev, I: I2cBus = I2cdev> {
    pub gpio: Gpio,
    pub spi: Spi<S>,
    pub i2c: I2c<I>,
}

impl Peripherals {
    pub fn new() -> Peripherals {
        Peripherals::with_buses()
    }
}

impl Default for Peripherals {
    fn default() -> Peripherals {
        Peripherals::new()
    }
}

impl<S: SpiBus, I: I2cBus> Peripherals<S, I> {
    /// Peripherals whose SPI and I2C devices are reached through custom bus implementations.
    pub fn with_buses() -> Peripherals<S, I> {
        Peripherals {
            gpio: Gpio::new(),
            spi: Spi::with_bus(),
            i2c: I2c::with_bus(),
        }
    }

    /// Closes every SPI and I2C device and unmaps the GPIO registers.
    pub fn close_all(&mut self) {
        self.spi.close_all();
        self.i2c.close_all();
        self.gpio.close();
    }
}
