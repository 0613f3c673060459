use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::sys::{ioc, IoctlNumType, SIZEMASK, WRITE};

/// Clock Phase
pub const SPI_CPHA: u8 = 0x01;
/// Clock Polarity
pub const SPI_CPOL: u8 = 0x02;

pub const SPI_MODE_0: u8 = 0;
pub const SPI_MODE_1: u8 = SPI_CPHA;
pub const SPI_MODE_2: u8 = SPI_CPOL;
pub const SPI_MODE_3: u8 = SPI_CPOL | SPI_CPHA;

/// Chipselect Active High?
pub const SPI_CS_HIGH: u8 = 0x04;
/// Per-word Bits On Wire
pub const SPI_LSB_FIRST: u8 = 0x08;
/// SI/SO Signals Shared
pub const SPI_3WIRE: u8 = 0x10;
/// Loopback Mode
pub const SPI_LOOP: u8 = 0x20;
/// 1 dev/bus; no chipselect
pub const SPI_NO_CS: u8 = 0x40;
/// Slave pulls low to pause
pub const SPI_READY: u8 = 0x80;

const SPI_IOC_MAGIC: u8 = b'k';
const SPI_IOC_NR_TRANSFER: u8 = 0;
const SPI_IOC_NR_MODE: u8 = 1;
const SPI_IOC_NR_BITS_PER_WORD: u8 = 3;
const SPI_IOC_NR_MAX_SPEED_HZ: u8 = 4;

const SPI_IOC_WR_MODE: IoctlNumType = ioc(WRITE, SPI_IOC_MAGIC, SPI_IOC_NR_MODE, 1);
const SPI_IOC_WR_BITS_PER_WORD: IoctlNumType = ioc(WRITE, SPI_IOC_MAGIC, SPI_IOC_NR_BITS_PER_WORD, 1);
const SPI_IOC_WR_MAX_SPEED_HZ: IoctlNumType = ioc(WRITE, SPI_IOC_MAGIC, SPI_IOC_NR_MAX_SPEED_HZ, 4);

/// Largest number of messages a single `SPI_IOC_MESSAGE` request can describe.
pub const MAX_MESSAGES: usize = SIZEMASK as usize / std::mem::size_of::<SpiIocTransfer<'static, 'static>>();

// SPI_IOC_MESSAGE(n)
fn spi_ioc_message(n: usize) -> IoctlNumType {
    ioc(
        WRITE,
        SPI_IOC_MAGIC,
        SPI_IOC_NR_TRANSFER,
        n * std::mem::size_of::<SpiIocTransfer<'static, 'static>>(),
    )
}

/// One entry of the array handed to `SPI_IOC_MESSAGE`, laid out as `struct spi_ioc_transfer`.
///
/// The buffers are borrowed for `'a` (transmit) and `'b` (receive) so the kernel
/// never sees a dangling pointer.
#[derive(Debug, Default)]
#[repr(C)]
pub struct SpiIocTransfer<'a, 'b> {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,

    // optional overrides
    pub speed_hz: u32,
    pub delay_usecs: u16,
    pub bits_per_word: u8,
    pub cs_change: u8,
    pub tx_nbits: u8,
    pub rx_nbits: u8,
    pub word_delay_usecs: u8,
    pad: u8,

    tx_buf_ref: PhantomData<&'a [u8]>,
    rx_buf_ref: PhantomData<&'b mut [u8]>,
}

impl<'a, 'b> SpiIocTransfer<'a, 'b> {
    /// Full duplex transfer of `tx_buf.len()` bytes. `rx_buf` may be longer than
    /// `tx_buf`; the extra bytes are left untouched.
    ///
    /// # Panics
    ///
    /// Panics if `rx_buf` is shorter than `tx_buf`.
    pub fn read_write(tx_buf: &'a [u8], rx_buf: &'b mut [u8]) -> Self {
        assert!(rx_buf.len() >= tx_buf.len());
        SpiIocTransfer {
            tx_buf: tx_buf.as_ptr() as usize as u64,
            rx_buf: rx_buf.as_mut_ptr() as usize as u64,
            len: tx_buf.len() as u32,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bytes to transmit.
    pub fn tx(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.tx_buf as usize as *const u8, self.len()) }
    }

    /// The part of the receive buffer covered by this transfer.
    pub fn rx_mut(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.rx_buf as usize as *mut u8, self.len()) }
    }
}

/// Access to one SPI character device.
///
/// [`Spidev`] talks to the kernel; tests substitute simulated devices.
pub trait SpiBus: Sized {
    fn open(path: &Path) -> io::Result<Self>;

    fn set_mode(&mut self, mode: u8) -> io::Result<()>;

    fn set_max_speed_hz(&mut self, speed_hz: u32) -> io::Result<()>;

    fn set_bits_per_word(&mut self, bits_per_word: u8) -> io::Result<()>;

    /// Runs all `transfers` in one kernel call and returns the raw count the kernel reported.
    fn transfer(&mut self, transfers: &mut [SpiIocTransfer]) -> io::Result<i32>;
}

/// A `/dev/spidevB.C` character device.
pub struct Spidev {
    file: File,
    _not_sync: PhantomData<*const ()>,
}

impl SpiBus for Spidev {
    fn open(path: &Path) -> io::Result<Spidev> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Spidev {
            file,
            _not_sync: PhantomData,
        })
    }

    fn set_mode(&mut self, mode: u8) -> io::Result<()> {
        syscall!(ioctl(self.file.as_raw_fd(), SPI_IOC_WR_MODE, &mode as *const u8))?;
        Ok(())
    }

    fn set_max_speed_hz(&mut self, speed_hz: u32) -> io::Result<()> {
        syscall!(ioctl(self.file.as_raw_fd(), SPI_IOC_WR_MAX_SPEED_HZ, &speed_hz as *const u32))?;
        Ok(())
    }

    fn set_bits_per_word(&mut self, bits_per_word: u8) -> io::Result<()> {
        syscall!(ioctl(self.file.as_raw_fd(), SPI_IOC_WR_BITS_PER_WORD, &bits_per_word as *const u8))?;
        Ok(())
    }

    fn transfer(&mut self, transfers: &mut [SpiIocTransfer]) -> io::Result<i32> {
        // The kernel fills the rx buffers behind each descriptor in place.
        syscall!(ioctl(
            self.file.as_raw_fd(),
            spi_ioc_message(transfers.len()),
            transfers.as_mut_ptr()
        ))
    }
}

impl AsRawFd for Spidev {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl fmt::Debug for Spidev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spidev").field("fd", &self.file.as_raw_fd()).finish()
    }
}

/// A configuration option applied either to every device or to each one by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting<T> {
    All(T),
    PerDevice(Vec<T>),
}

impl<T: Copy> Setting<T> {
    fn resolve(&self, option: &'static str, devices: usize) -> Result<Vec<T>> {
        match self {
            Setting::All(value) => Ok(vec![*value; devices]),
            Setting::PerDevice(values) if values.len() == devices => Ok(values.clone()),
            Setting::PerDevice(values) => Err(Error::ConfigurationMismatch {
                option,
                expected: devices,
                found: values.len(),
            }),
        }
    }
}

macro_rules! setting_from {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Setting<$ty> {
            fn from(value: $ty) -> Setting<$ty> {
                Setting::All(value)
            }
        }

        impl From<Vec<$ty>> for Setting<$ty> {
            fn from(values: Vec<$ty>) -> Setting<$ty> {
                Setting::PerDevice(values)
            }
        }
    )*};
}

setting_from!(u8, u32);

/// Bus configuration applied when the devices are opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiConfig {
    pub mode: Setting<u8>,
    pub max_speed_hz: Setting<u32>,
    pub bits_per_word: Setting<u8>,
}

impl Default for SpiConfig {
    fn default() -> SpiConfig {
        SpiConfig {
            mode: Setting::All(SPI_MODE_0),
            max_speed_hz: Setting::All(4_000_000),
            bits_per_word: Setting::All(8),
        }
    }
}

/// Configuration last applied to an opened device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub mode: u8,
    pub max_speed_hz: u32,
    pub bits_per_word: u8,
}

/// Per-call parameters. They apply to every message of one transfer and are not remembered.
///
/// `Some(0)` for `max_speed_hz` or `bits_per_word` means "no override".
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TransferOverrides {
    pub max_speed_hz: Option<u32>,
    pub delay_usecs: Option<u16>,
    pub bits_per_word: Option<u8>,
    /// Sets `cs_change` on every message. Between messages this deselects the
    /// device; on the last message it keeps the device selected afterwards.
    pub cs_change: Option<bool>,
}

struct SpiDevice<D> {
    bus: D,
    path: PathBuf,
    config: DeviceConfig,
}

impl<D> SpiDevice<D> {
    fn describe<'a, 'b>(
        &self,
        tx: &'a [u8],
        rx: &'b mut [u8],
        overrides: &TransferOverrides,
    ) -> SpiIocTransfer<'a, 'b> {
        let mut transfer = SpiIocTransfer::read_write(tx, rx);
        transfer.speed_hz = overrides
            .max_speed_hz
            .filter(|&hz| hz > 0)
            .unwrap_or(self.config.max_speed_hz);
        transfer.delay_usecs = overrides.delay_usecs.unwrap_or(0);
        transfer.bits_per_word = overrides
            .bits_per_word
            .filter(|&bits| bits > 0)
            .unwrap_or(self.config.bits_per_word);
        transfer.cs_change = overrides.cs_change.unwrap_or(false) as u8;
        transfer
    }
}

enum State<D> {
    Uninitialized,
    Initialized(Vec<SpiDevice<D>>),
    Closed,
}

/// The set of opened SPI devices, addressed by 1-based id in opening order.
pub struct Spi<D: SpiBus = Spidev> {
    state: State<D>,
}

impl Spi<Spidev> {
    pub fn new() -> Spi<Spidev> {
        Spi::with_bus()
    }
}

impl Default for Spi<Spidev> {
    fn default() -> Spi<Spidev> {
        Spi::new()
    }
}

impl<D: SpiBus> Spi<D> {
    /// An uninitialized manager for a custom [`SpiBus`] implementation.
    pub fn with_bus() -> Spi<D> {
        Spi {
            state: State::Uninitialized,
        }
    }

    /// Opens `paths` in order, assigning ids `1..=paths.len()`, and applies `config` to each.
    ///
    /// If any device fails, the ones already opened are closed and the manager stays uninitialized.
    ///
    /// A manager closed with [`close_all`](Spi::close_all) is [`reset`](Spi::reset)
    /// first, so ids start again at 1. Fails with `AlreadyInitialized` while devices are open.
    pub fn initialize<P: AsRef<Path>>(&mut self, paths: &[P], config: &SpiConfig) -> Result<()> {
        match self.state {
            State::Initialized(_) => return Err(Error::AlreadyInitialized),
            State::Closed => self.reset(),
            State::Uninitialized => {}
        }

        let modes = config.mode.resolve("mode", paths.len())?;
        let speeds = config.max_speed_hz.resolve("max_speed_hz", paths.len())?;
        let bits = config.bits_per_word.resolve("bits_per_word", paths.len())?;

        let mut devices = Vec::with_capacity(paths.len());

        for (i, path) in paths.iter().enumerate() {
            let config = DeviceConfig {
                mode: modes[i],
                max_speed_hz: speeds[i],
                bits_per_word: bits[i],
            };

            match open_device(path.as_ref(), config) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    if !devices.is_empty() {
                        log::warn!("closing {} SPI devices after failed initialization", devices.len());
                    }
                    return Err(e);
                }
            }
        }

        log::debug!("initialized {} SPI devices", devices.len());
        self.state = State::Initialized(devices);

        Ok(())
    }

    /// Closes every device. Ids handed out so far become invalid.
    pub fn close_all(&mut self) {
        if let State::Initialized(devices) = &self.state {
            log::debug!("closing {} SPI devices", devices.len());
        }
        self.state = State::Closed;
    }

    /// Returns a closed manager to the uninitialized state.
    pub fn reset(&mut self) {
        if let State::Closed = self.state {
            self.state = State::Uninitialized;
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, State::Initialized(_))
    }

    pub fn device_count(&self) -> usize {
        match &self.state {
            State::Initialized(devices) => devices.len(),
            _ => 0,
        }
    }

    fn device(&mut self, id: usize) -> Result<&mut SpiDevice<D>> {
        match &mut self.state {
            State::Initialized(devices) => id
                .checked_sub(1)
                .and_then(move |i| devices.get_mut(i))
                .ok_or(Error::InvalidDeviceId(id)),
            _ => Err(Error::InvalidDeviceId(id)),
        }
    }

    pub fn config(&mut self, id: usize) -> Result<DeviceConfig> {
        Ok(self.device(id)?.config)
    }

    pub fn path(&mut self, id: usize) -> Result<&Path> {
        Ok(&self.device(id)?.path)
    }

    pub fn set_mode(&mut self, id: usize, mode: u8) -> Result<()> {
        let device = self.device(id)?;
        apply(&device.path, "mode", u32::from(mode), device.bus.set_mode(mode))?;
        device.config.mode = mode;
        Ok(())
    }

    pub fn set_max_speed_hz(&mut self, id: usize, speed_hz: u32) -> Result<()> {
        let device = self.device(id)?;
        apply(&device.path, "max_speed_hz", speed_hz, device.bus.set_max_speed_hz(speed_hz))?;
        device.config.max_speed_hz = speed_hz;
        Ok(())
    }

    pub fn set_bits_per_word(&mut self, id: usize, bits_per_word: u8) -> Result<()> {
        let device = self.device(id)?;
        apply(
            &device.path,
            "bits_per_word",
            u32::from(bits_per_word),
            device.bus.set_bits_per_word(bits_per_word),
        )?;
        device.config.bits_per_word = bits_per_word;
        Ok(())
    }

    /// Full duplex transfer of every message in `tx` in one kernel call.
    ///
    /// Message `i` is clocked out of `tx[i]` while the reply is written to the
    /// start of `rx[i]`, which must be at least as long. Returns the byte count
    /// reported by the kernel, which is not checked against the requested length.
    pub fn transfer_into(
        &mut self,
        id: usize,
        tx: &[&[u8]],
        rx: &mut [&mut [u8]],
        overrides: &TransferOverrides,
    ) -> Result<usize> {
        let device = self.device(id)?;

        if tx.len() != rx.len() {
            return Err(Error::MessageCountMismatch {
                tx: tx.len(),
                rx: rx.len(),
            });
        }

        if tx.is_empty() {
            return Ok(0);
        }

        if tx.len() > MAX_MESSAGES {
            return Err(Error::OutOfRange {
                field: "message count",
                value: tx.len() as u64,
                max: MAX_MESSAGES as u64,
            });
        }

        for (index, (t, r)) in tx.iter().zip(rx.iter()).enumerate() {
            if t.len() > u32::MAX as usize {
                return Err(Error::OutOfRange {
                    field: "message length",
                    value: t.len() as u64,
                    max: u64::from(u32::MAX),
                });
            }

            if r.len() < t.len() {
                return Err(Error::RxBufferTooSmall {
                    index,
                    needed: t.len(),
                    available: r.len(),
                });
            }
        }

        let mut transfers: Vec<SpiIocTransfer> = tx
            .iter()
            .zip(rx.iter_mut())
            .map(|(t, r)| device.describe(t, r, overrides))
            .collect();

        log::trace!(
            "{}: transferring {} messages, {} bytes",
            device.path.display(),
            transfers.len(),
            transfers.iter().map(SpiIocTransfer::len).sum::<usize>()
        );

        match device.bus.transfer(&mut transfers) {
            Ok(count) if count >= 0 => Ok(count as usize),
            Ok(count) => Err(Error::TransferFailed {
                count: i64::from(count),
                source: io::Error::new(io::ErrorKind::Other, "negative transfer count"),
            }),
            Err(source) => Err(Error::TransferFailed { count: -1, source }),
        }
    }

    /// Same as [`transfer_into`](Spi::transfer_into) with receive buffers
    /// allocated to match each message.
    pub fn transfer(
        &mut self,
        id: usize,
        tx: &[&[u8]],
        overrides: &TransferOverrides,
    ) -> Result<(Vec<Vec<u8>>, usize)> {
        let mut rx: Vec<Vec<u8>> = tx.iter().map(|t| vec![0u8; t.len()]).collect();
        let count = {
            let mut views: Vec<&mut [u8]> = rx.iter_mut().map(|r| r.as_mut_slice()).collect();
            self.transfer_into(id, tx, &mut views, overrides)?
        };

        Ok((rx, count))
    }

    /// Transfers a single message.
    pub fn transfer_one(&mut self, id: usize, tx: &[u8], overrides: &TransferOverrides) -> Result<(Vec<u8>, usize)> {
        let (mut rx, count) = self.transfer(id, &[tx], overrides)?;
        Ok((rx.pop().unwrap_or_default(), count))
    }
}

impl<D: SpiBus> fmt::Debug for Spi<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Uninitialized => "uninitialized",
            State::Initialized(_) => "initialized",
            State::Closed => "closed",
        };
        f.debug_struct("Spi")
            .field("state", &state)
            .field("devices", &self.device_count())
            .finish()
    }
}

fn open_device<D: SpiBus>(path: &Path, config: DeviceConfig) -> Result<SpiDevice<D>> {
    let mut bus = D::open(path).map_err(|source| Error::DeviceOpenFailed {
        path: path.to_owned(),
        source,
    })?;

    apply(path, "mode", u32::from(config.mode), bus.set_mode(config.mode))?;
    apply(path, "max_speed_hz", config.max_speed_hz, bus.set_max_speed_hz(config.max_speed_hz))?;
    apply(
        path,
        "bits_per_word",
        u32::from(config.bits_per_word),
        bus.set_bits_per_word(config.bits_per_word),
    )?;

    log::debug!("opened {} ({:?})", path.display(), config);

    Ok(SpiDevice {
        bus,
        path: path.to_owned(),
        config,
    })
}

fn apply(path: &Path, option: &'static str, value: u32, res: io::Result<()>) -> Result<()> {
    res.map_err(|source| Error::ConfigurationRejected {
        path: path.to_owned(),
        option,
        value,
        source,
    })
}
