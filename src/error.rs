use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by the GPIO, SPI and I2C managers.
#[derive(Error, Debug)]
pub enum Error {
    /// The GPIO memory device could not be opened or mapped. Usually a permissions issue.
    #[error("{} unavailable", .resource.display())]
    ResourceUnavailable {
        resource: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("GPIO registers are not mapped, call initialize first")]
    GpioNotInitialized,
    /// One of the devices passed to a multi-device initialization could not be opened.
    /// Devices opened before it have already been closed.
    #[error("failed to open device {}", .path.display())]
    DeviceOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid device id {0}")]
    InvalidDeviceId(usize),
    #[error("invalid pin {0}")]
    InvalidPin(usize),
    #[error("invalid GPIO mode {0:?}")]
    InvalidMode(String),
    #[error("invalid slave address {0:#x}")]
    InvalidAddress(u16),
    #[error("{field} value {value} is out of range (max {max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },
    #[error("block of {0} bytes exceeds the 32 byte SMBus limit")]
    BlockTooLarge(usize),
    /// The kernel refused a bus configuration value.
    #[error("{}: kernel rejected {option} = {value}", .path.display())]
    ConfigurationRejected {
        path: PathBuf,
        option: &'static str,
        value: u32,
        #[source]
        source: io::Error,
    },
    /// A per-device configuration list does not match the number of devices.
    #[error("{option} has {found} values for {expected} devices")]
    ConfigurationMismatch {
        option: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("slave address {0:#x} is in use by a kernel driver")]
    DeviceBusy(u16),
    /// The transfer ioctl failed. `count` is the raw value the kernel returned.
    #[error("transfer failed (kernel returned {count})")]
    TransferFailed {
        count: i64,
        #[source]
        source: io::Error,
    },
    #[error("{tx} transmit messages but {rx} receive buffers")]
    MessageCountMismatch { tx: usize, rx: usize },
    #[error("receive buffer {index} holds {available} bytes, {needed} needed")]
    RxBufferTooSmall {
        index: usize,
        needed: usize,
        available: usize,
    },
    #[error("devices are already initialized, close them first")]
    AlreadyInitialized,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Narrows `value` into `T`, failing with [`Error::OutOfRange`] when it does not fit.
pub(crate) fn narrow<T>(field: &'static str, value: u32) -> Result<T>
where
    T: TryFrom<u32> + Bounded,
{
    T::try_from(value).map_err(|_| Error::OutOfRange {
        field,
        value: u64::from(value),
        max: T::MAX_U64,
    })
}

pub(crate) trait Bounded {
    const MAX_U64: u64;
}

impl Bounded for u8 {
    const MAX_U64: u64 = u8::MAX as u64;
}

impl Bounded for u16 {
    const MAX_U64: u64 = u16::MAX as u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_checks_width() {
        assert_eq!(narrow::<u8>("value", 255).unwrap(), 255u8);
        assert_eq!(narrow::<u16>("value", 65535).unwrap(), 65535u16);

        match narrow::<u8>("value", 256) {
            Err(Error::OutOfRange { field, value, max }) => {
                assert_eq!(field, "value");
                assert_eq!(value, 256);
                assert_eq!(max, 255);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(narrow::<u16>("word", 65536), Err(Error::OutOfRange { .. })));
    }
}
