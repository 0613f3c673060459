use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::os::raw::c_ulong;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::error::{narrow, Error, Result};
use crate::sys::IoctlNumType;

// from include/uapi/linux/i2c-dev.h
const I2C_SLAVE: u16 = 0x0703;
const I2C_SLAVE_FORCE: u16 = 0x0706;
const I2C_TENBIT: u16 = 0x0704;
const I2C_FUNCS: u16 = 0x0705;
const I2C_SMBUS: u16 = 0x0720;

/// Maximum bytes per SMBus block transfer.
pub const I2C_SMBUS_BLOCK_MAX: usize = 32;

// Functionality flags returned by I2C_FUNCS (include/uapi/linux/i2c.h)
const FUNC_I2C: u64 = 0x0000_0001;
const FUNC_10BIT_ADDR: u64 = 0x0000_0002;
const FUNC_PROTOCOL_MANGLING: u64 = 0x0000_0004;
const FUNC_SMBUS_PEC: u64 = 0x0000_0008;
const FUNC_NOSTART: u64 = 0x0000_0010;
const FUNC_SLAVE: u64 = 0x0000_0020;
const FUNC_SMBUS_QUICK: u64 = 0x0001_0000;
const FUNC_SMBUS_READ_BYTE: u64 = 0x0002_0000;
const FUNC_SMBUS_WRITE_BYTE: u64 = 0x0004_0000;
const FUNC_SMBUS_READ_BYTE_DATA: u64 = 0x0008_0000;
const FUNC_SMBUS_WRITE_BYTE_DATA: u64 = 0x0010_0000;
const FUNC_SMBUS_READ_WORD_DATA: u64 = 0x0020_0000;
const FUNC_SMBUS_WRITE_WORD_DATA: u64 = 0x0040_0000;
const FUNC_SMBUS_READ_I2C_BLOCK: u64 = 0x0400_0000;
const FUNC_SMBUS_WRITE_I2C_BLOCK: u64 = 0x0800_0000;

const ADDRESS_7BIT_MAX: u16 = 0x7f;
const ADDRESS_10BIT_MAX: u16 = 0x3ff;

/// `read_write` field of an SMBus request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SmbusDirection {
    Write = 0,
    Read = 1,
}

/// `size` field of an SMBus request, selecting the transaction shape.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum SmbusTransaction {
    Quick = 0,
    Byte = 1,
    ByteData = 2,
    WordData = 3,
    ProcCall = 4,
    BlockData = 5,
    I2cBlockBroken = 6,
    BlockProcCall = 7,
    I2cBlockData = 8,
}

/// `union i2c_smbus_data`: a byte, a word, or a block whose first byte is the length.
#[repr(C, align(2))]
#[derive(Clone, PartialEq, Eq)]
pub struct SmbusData {
    block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
}

impl SmbusData {
    pub fn new() -> SmbusData {
        SmbusData {
            block: [0; I2C_SMBUS_BLOCK_MAX + 2],
        }
    }

    pub fn byte(&self) -> u8 {
        self.block[0]
    }

    pub fn set_byte(&mut self, value: u8) {
        self.block[0] = value;
    }

    pub fn word(&self) -> u16 {
        u16::from_ne_bytes([self.block[0], self.block[1]])
    }

    pub fn set_word(&mut self, value: u16) {
        self.block[..2].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn block(&self) -> &[u8] {
        &self.block
    }

    pub fn block_mut(&mut self) -> &mut [u8] {
        &mut self.block
    }
}

impl Default for SmbusData {
    fn default() -> SmbusData {
        SmbusData::new()
    }
}

impl fmt::Debug for SmbusData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmbusData").field("block", &&self.block[..]).finish()
    }
}

// struct i2c_smbus_ioctl_data
#[repr(C)]
#[derive(Debug)]
struct SmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut SmbusData,
}

impl SmbusIoctlData {
    fn new(direction: SmbusDirection, command: u8, transaction: SmbusTransaction, data: &mut SmbusData) -> Self {
        SmbusIoctlData {
            read_write: direction as u8,
            command,
            size: transaction as u32,
            data,
        }
    }
}

/// What an I2C adapter supports, as reported by the kernel.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct Capabilities {
    funcs: u64,
}

impl Capabilities {
    pub fn new(funcs: u64) -> Capabilities {
        Capabilities { funcs }
    }

    /// The raw `I2C_FUNC_*` bits.
    pub fn bits(self) -> u64 {
        self.funcs
    }

    fn has(self, flag: u64) -> bool {
        self.funcs & flag != 0
    }

    /// Plain I2C transfers are supported.
    pub fn i2c(self) -> bool {
        self.has(FUNC_I2C)
    }

    /// Indicates whether 10-bit addresses are supported.
    pub fn addr_10bit(self) -> bool {
        self.has(FUNC_10BIT_ADDR)
    }

    pub fn protocol_mangling(self) -> bool {
        self.has(FUNC_PROTOCOL_MANGLING)
    }

    /// Indicates whether SMBus Packet Error Checking is supported.
    pub fn smbus_pec(self) -> bool {
        self.has(FUNC_SMBUS_PEC)
    }

    pub fn nostart(self) -> bool {
        self.has(FUNC_NOSTART)
    }

    pub fn slave(self) -> bool {
        self.has(FUNC_SLAVE)
    }

    pub fn smbus_quick(self) -> bool {
        self.has(FUNC_SMBUS_QUICK)
    }

    pub fn smbus_read_byte(self) -> bool {
        self.has(FUNC_SMBUS_READ_BYTE)
    }

    pub fn smbus_write_byte(self) -> bool {
        self.has(FUNC_SMBUS_WRITE_BYTE)
    }

    pub fn smbus_read_byte_data(self) -> bool {
        self.has(FUNC_SMBUS_READ_BYTE_DATA)
    }

    pub fn smbus_write_byte_data(self) -> bool {
        self.has(FUNC_SMBUS_WRITE_BYTE_DATA)
    }

    pub fn smbus_read_word_data(self) -> bool {
        self.has(FUNC_SMBUS_READ_WORD_DATA)
    }

    pub fn smbus_write_word_data(self) -> bool {
        self.has(FUNC_SMBUS_WRITE_WORD_DATA)
    }

    pub fn smbus_read_i2c_block(self) -> bool {
        self.has(FUNC_SMBUS_READ_I2C_BLOCK)
    }

    pub fn smbus_write_i2c_block(self) -> bool {
        self.has(FUNC_SMBUS_WRITE_I2C_BLOCK)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("bits", &format_args!("{:#010x}", self.funcs))
            .field("i2c", &self.i2c())
            .field("addr_10bit", &self.addr_10bit())
            .field("smbus_pec", &self.smbus_pec())
            .field("smbus_read_i2c_block", &self.smbus_read_i2c_block())
            .field("smbus_write_i2c_block", &self.smbus_write_i2c_block())
            .finish()
    }
}

/// Access to one I2C character device.
///
/// [`I2cdev`] talks to the kernel; tests substitute simulated devices.
pub trait I2cBus: Sized {
    fn open(path: &Path) -> io::Result<Self>;

    /// Selects the slave addressed by later transactions. `force` takes the
    /// address even when a kernel driver has claimed it.
    fn set_slave_address(&mut self, address: u16, force: bool) -> io::Result<()>;

    fn set_ten_bit(&mut self, enable: bool) -> io::Result<()>;

    /// The adapter's `I2C_FUNC_*` flags.
    fn funcs(&mut self) -> io::Result<u64>;

    fn smbus(
        &mut self,
        direction: SmbusDirection,
        command: u8,
        transaction: SmbusTransaction,
        data: &mut SmbusData,
    ) -> io::Result<()>;
}

/// A `/dev/i2c-N` character device.
pub struct I2cdev {
    file: File,
    _not_sync: PhantomData<*const ()>,
}

impl I2cBus for I2cdev {
    fn open(path: &Path) -> io::Result<I2cdev> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(I2cdev {
            file,
            _not_sync: PhantomData,
        })
    }

    fn set_slave_address(&mut self, address: u16, force: bool) -> io::Result<()> {
        let request = if force { I2C_SLAVE_FORCE } else { I2C_SLAVE };
        syscall!(ioctl(self.file.as_raw_fd(), request as IoctlNumType, address as c_ulong))?;
        Ok(())
    }

    fn set_ten_bit(&mut self, enable: bool) -> io::Result<()> {
        syscall!(ioctl(self.file.as_raw_fd(), I2C_TENBIT as IoctlNumType, enable as c_ulong))?;
        Ok(())
    }

    fn funcs(&mut self) -> io::Result<u64> {
        let mut funcs: c_ulong = 0;
        syscall!(ioctl(self.file.as_raw_fd(), I2C_FUNCS as IoctlNumType, &mut funcs as *mut c_ulong))?;
        Ok(u64::from(funcs))
    }

    fn smbus(
        &mut self,
        direction: SmbusDirection,
        command: u8,
        transaction: SmbusTransaction,
        data: &mut SmbusData,
    ) -> io::Result<()> {
        let mut request = SmbusIoctlData::new(direction, command, transaction, data);
        syscall!(ioctl(
            self.file.as_raw_fd(),
            I2C_SMBUS as IoctlNumType,
            &mut request as *mut SmbusIoctlData
        ))?;
        Ok(())
    }
}

impl AsRawFd for I2cdev {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl fmt::Debug for I2cdev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I2cdev").field("fd", &self.file.as_raw_fd()).finish()
    }
}

struct I2cDevice<D> {
    bus: D,
    path: PathBuf,
    address: Option<u16>,
    ten_bit: bool,
    // Grows to the largest block read so far, never shrinks.
    scratch: Vec<u8>,
}

impl<D: I2cBus> I2cDevice<D> {
    fn smbus(
        &mut self,
        direction: SmbusDirection,
        command: u8,
        transaction: SmbusTransaction,
        data: &mut SmbusData,
    ) -> Result<()> {
        log::trace!(
            "{}: smbus {:?} {:?} command {:#04x}",
            self.path.display(),
            direction,
            transaction,
            command
        );

        self.bus
            .smbus(direction, command, transaction, data)
            .map_err(|source| Error::TransferFailed { count: -1, source })
    }
}

enum State<D> {
    Uninitialized,
    Initialized(Vec<I2cDevice<D>>),
    Closed,
}

/// The set of opened I2C devices, addressed by 1-based id in opening order.
pub struct I2c<D: I2cBus = I2cdev> {
    state: State<D>,
}

impl I2c<I2cdev> {
    pub fn new() -> I2c<I2cdev> {
        I2c::with_bus()
    }
}

impl Default for I2c<I2cdev> {
    fn default() -> I2c<I2cdev> {
        I2c::new()
    }
}

impl<D: I2cBus> I2c<D> {
    /// An uninitialized manager for a custom [`I2cBus`] implementation.
    pub fn with_bus() -> I2c<D> {
        I2c {
            state: State::Uninitialized,
        }
    }

    /// Opens `paths` in order, assigning ids `1..=paths.len()`.
    ///
    /// If any device fails, the ones already opened are closed and the manager stays uninitialized.
    ///
    /// A manager closed with [`close_all`](I2c::close_all) is [`reset`](I2c::reset)
    /// first, so ids start again at 1. Fails with `AlreadyInitialized` while devices are open.
    pub fn initialize<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<()> {
        match self.state {
            State::Initialized(_) => return Err(Error::AlreadyInitialized),
            State::Closed => self.reset(),
            State::Uninitialized => {}
        }

        let mut devices = Vec::with_capacity(paths.len());

        for path in paths {
            let path = path.as_ref();

            match D::open(path) {
                Ok(bus) => {
                    log::debug!("opened {}", path.display());
                    devices.push(I2cDevice {
                        bus,
                        path: path.to_owned(),
                        address: None,
                        ten_bit: false,
                        scratch: Vec::new(),
                    });
                }
                Err(source) => {
                    if !devices.is_empty() {
                        log::warn!("closing {} I2C devices after failed initialization", devices.len());
                    }
                    return Err(Error::DeviceOpenFailed {
                        path: path.to_owned(),
                        source,
                    });
                }
            }
        }

        log::debug!("initialized {} I2C devices", devices.len());
        self.state = State::Initialized(devices);

        Ok(())
    }

    /// Closes every device. Ids handed out so far become invalid.
    pub fn close_all(&mut self) {
        if let State::Initialized(devices) = &self.state {
            log::debug!("closing {} I2C devices", devices.len());
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

    fn device(&mut self, id: usize) -> Result<&mut I2cDevice<D>> {
        match &mut self.state {
            State::Initialized(devices) => id
                .checked_sub(1)
                .and_then(move |i| devices.get_mut(i))
                .ok_or(Error::InvalidDeviceId(id)),
            _ => Err(Error::InvalidDeviceId(id)),
        }
    }

    pub fn path(&mut self, id: usize) -> Result<&Path> {
        Ok(&self.device(id)?.path)
    }

    /// The slave address last selected on the device, if any.
    pub fn address(&mut self, id: usize) -> Result<Option<u16>> {
        Ok(self.device(id)?.address)
    }

    /// Functionality supported by the adapter behind the device.
    pub fn funcs(&mut self, id: usize) -> Result<Capabilities> {
        let device = self.device(id)?;
        let funcs = device
            .bus
            .funcs()
            .map_err(|source| Error::TransferFailed { count: -1, source })?;

        log::debug!("{}: functionality {:#010x}", device.path.display(), funcs);

        Ok(Capabilities::new(funcs))
    }

    /// Switches between 7-bit and 10-bit slave addressing.
    pub fn set_ten_bit(&mut self, id: usize, enable: bool) -> Result<()> {
        let device = self.device(id)?;
        device
            .bus
            .set_ten_bit(enable)
            .map_err(|source| Error::ConfigurationRejected {
                path: device.path.clone(),
                option: "ten_bit",
                value: u32::from(enable),
                source,
            })?;
        device.ten_bit = enable;
        Ok(())
    }

    pub fn select_slave(&mut self, id: usize, address: u16, force: bool) -> Result<()> {
        let device = self.device(id)?;

        let max = if device.ten_bit {
            ADDRESS_10BIT_MAX
        } else {
            ADDRESS_7BIT_MAX
        };
        if address > max {
            return Err(Error::InvalidAddress(address));
        }

        match device.bus.set_slave_address(address, force) {
            Ok(()) => {
                device.address = Some(address);
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Err(Error::DeviceBusy(address)),
            Err(source) => Err(Error::ConfigurationRejected {
                path: device.path.clone(),
                option: "slave address",
                value: u32::from(address),
                source,
            }),
        }
    }

    pub fn read_byte(&mut self, id: usize) -> Result<u8> {
        let device = self.device(id)?;
        let mut data = SmbusData::new();
        device.smbus(SmbusDirection::Read, 0, SmbusTransaction::Byte, &mut data)?;
        Ok(data.byte())
    }

    pub fn read_byte_data(&mut self, id: usize, command: u32) -> Result<u8> {
        let command = narrow("command", command)?;
        let device = self.device(id)?;
        let mut data = SmbusData::new();
        device.smbus(SmbusDirection::Read, command, SmbusTransaction::ByteData, &mut data)?;
        Ok(data.byte())
    }

    pub fn read_word_data(&mut self, id: usize, command: u32) -> Result<u16> {
        let command = narrow("command", command)?;
        let device = self.device(id)?;
        let mut data = SmbusData::new();
        device.smbus(SmbusDirection::Read, command, SmbusTransaction::WordData, &mut data)?;
        Ok(data.word())
    }

    pub fn write_byte(&mut self, id: usize, value: u32) -> Result<()> {
        // The byte travels in the command field.
        let value = narrow("value", value)?;
        let device = self.device(id)?;
        let mut data = SmbusData::new();
        device.smbus(SmbusDirection::Write, value, SmbusTransaction::Byte, &mut data)
    }

    pub fn write_byte_data(&mut self, id: usize, command: u32, value: u32) -> Result<()> {
        let command = narrow("command", command)?;
        let value = narrow("value", value)?;
        let device = self.device(id)?;
        let mut data = SmbusData::new();
        data.set_byte(value);
        device.smbus(SmbusDirection::Write, command, SmbusTransaction::ByteData, &mut data)
    }

    pub fn write_word_data(&mut self, id: usize, command: u32, value: u32) -> Result<()> {
        let command = narrow("command", command)?;
        let value = narrow("value", value)?;
        let device = self.device(id)?;
        let mut data = SmbusData::new();
        data.set_word(value);
        device.smbus(SmbusDirection::Write, command, SmbusTransaction::WordData, &mut data)
    }

    /// Reads `size` bytes starting at register `command`.
    ///
    /// The returned slice has `size + 1` bytes: the count reported by the kernel
    /// followed by the data. It lives in a buffer owned by the device and is
    /// only valid until the next call on this manager.
    pub fn read_i2c_block_data_view(&mut self, id: usize, command: u32, size: usize) -> Result<&[u8]> {
        if size > I2C_SMBUS_BLOCK_MAX {
            return Err(Error::BlockTooLarge(size));
        }
        let command = narrow("command", command)?;
        let device = self.device(id)?;

        let mut data = SmbusData::new();
        data.set_byte(size as u8);
        device.smbus(SmbusDirection::Read, command, SmbusTransaction::I2cBlockData, &mut data)?;

        if device.scratch.len() < size + 1 {
            device.scratch.resize(size + 1, 0);
        }

        let out = &mut device.scratch[..size + 1];
        out.copy_from_slice(&data.block()[..size + 1]);

        Ok(out)
    }

    /// Same as [`read_i2c_block_data_view`](I2c::read_i2c_block_data_view), copied
    /// into the first `size + 1` bytes of `out`.
    pub fn read_i2c_block_data_into(&mut self, id: usize, command: u32, size: usize, out: &mut [u8]) -> Result<()> {
        if size > I2C_SMBUS_BLOCK_MAX {
            return Err(Error::BlockTooLarge(size));
        }

        if out.len() < size + 1 {
            return Err(Error::RxBufferTooSmall {
                index: 0,
                needed: size + 1,
                available: out.len(),
            });
        }

        let block = self.read_i2c_block_data_view(id, command, size)?;
        out[..block.len()].copy_from_slice(block);

        Ok(())
    }

    /// Same as [`read_i2c_block_data_view`](I2c::read_i2c_block_data_view), returning an owned copy.
    pub fn read_i2c_block_data(&mut self, id: usize, command: u32, size: usize) -> Result<Vec<u8>> {
        Ok(self.read_i2c_block_data_view(id, command, size)?.to_vec())
    }

    /// Writes up to 32 bytes starting at register `command`.
    pub fn write_i2c_block_data(&mut self, id: usize, command: u32, values: &[u8]) -> Result<()> {
        if values.len() > I2C_SMBUS_BLOCK_MAX {
            return Err(Error::BlockTooLarge(values.len()));
        }
        let command = narrow("command", command)?;
        let device = self.device(id)?;

        let mut data = SmbusData::new();
        let block = data.block_mut();
        block[0] = values.len() as u8;
        block[1..=values.len()].copy_from_slice(values);

        device.smbus(SmbusDirection::Write, command, SmbusTransaction::I2cBlockData, &mut data)
    }
}

impl<D: I2cBus> fmt::Debug for I2c<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Uninitialized => "uninitialized",
            State::Initialized(_) => "initialized",
            State::Closed => "closed",
        };
        f.debug_struct("I2c")
            .field("state", &state)
            .field("devices", &self.device_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn smbus_data_layout() {
        assert_eq!(size_of::<SmbusData>(), 34);
        assert_eq!(align_of::<SmbusData>(), 2);

        assert_eq!(offset_of!(SmbusIoctlData, read_write), 0);
        assert_eq!(offset_of!(SmbusIoctlData, command), 1);
        assert_eq!(offset_of!(SmbusIoctlData, size), 4);
        assert_eq!(offset_of!(SmbusIoctlData, data), 8);
        assert_eq!(size_of::<SmbusIoctlData>(), 8 + size_of::<usize>());
    }

    #[test]
    fn ioctl_request_describes_transaction() {
        let mut data = SmbusData::new();
        let ptr = &mut data as *mut SmbusData;
        let request = SmbusIoctlData::new(SmbusDirection::Read, 0x10, SmbusTransaction::I2cBlockData, &mut data);

        assert_eq!(request.read_write, 1);
        assert_eq!(request.command, 0x10);
        assert_eq!(request.size, 8);
        assert_eq!(request.data, ptr);
    }

    #[test]
    fn capability_flags() {
        let caps = Capabilities::new(0x0eff_0009);

        assert!(caps.i2c());
        assert!(caps.smbus_pec());
        assert!(!caps.addr_10bit());
        assert!(!caps.slave());
        assert!(caps.smbus_quick());
        assert!(caps.smbus_read_word_data());
        assert!(caps.smbus_read_i2c_block());
        assert!(caps.smbus_write_i2c_block());
        assert_eq!(caps.bits(), 0x0eff_0009);

        assert!(!Capabilities::new(0).smbus_read_byte());
    }

    #[test]
    fn word_is_native_endian() {
        let mut data = SmbusData::new();
        data.set_word(0x1234);
        assert_eq!(data.word(), 0x1234);
        assert_eq!(&data.block()[..2], &0x1234u16.to_ne_bytes());

        data.set_byte(0xab);
        assert_eq!(data.byte(), 0xab);
    }
}
