use std::fmt;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Number of GPIOs driven by the first register bank.
pub const PIN_COUNT: usize = 28;

/// Mask of the bits in a set/clear/level register that map to a pin.
pub const PIN_MASK: u32 = (1 << PIN_COUNT) - 1;

// Size of the register window exposed by /dev/gpiomem.
const BLOCK_SIZE: usize = 4096;

// Word offsets into the register window (BCM2835 peripheral manual, section 6.1).
const GPFSEL0: usize = 0x00 / 4;
const GPSET0: usize = 0x1c / 4;
const GPCLR0: usize = 0x28 / 4;
const GPLEV0: usize = 0x34 / 4;

const FSEL_BITS: usize = 3;
const FSEL_MASK: u32 = 0b111;
const PINS_PER_FSEL: usize = 10;
const FSEL_WORDS: usize = (PIN_COUNT + PINS_PER_FSEL - 1) / PINS_PER_FSEL;

/// Function select value of a GPIO.
#[derive(Debug, Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Mode {
    In = 0b000,
    Out = 0b001,
    Alt0 = 0b100,
    Alt1 = 0b101,
    Alt2 = 0b110,
    Alt3 = 0b111,
    Alt4 = 0b011,
    Alt5 = 0b010,
}

impl Mode {
    pub const ALL: [Mode; 8] = [
        Mode::Out,
        Mode::In,
        Mode::Alt0,
        Mode::Alt1,
        Mode::Alt2,
        Mode::Alt3,
        Mode::Alt4,
        Mode::Alt5,
    ];

    /// Decodes a 3-bit function select field. Every pattern is a valid mode.
    pub fn from_bits(bits: u32) -> Mode {
        match bits & FSEL_MASK {
            0b000 => Mode::In,
            0b001 => Mode::Out,
            0b100 => Mode::Alt0,
            0b101 => Mode::Alt1,
            0b110 => Mode::Alt2,
            0b111 => Mode::Alt3,
            0b011 => Mode::Alt4,
            _ => Mode::Alt5,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Mode> {
        match s.trim() {
            "out" => Ok(Mode::Out),
            "in" => Ok(Mode::In),
            "alt0" => Ok(Mode::Alt0),
            "alt1" => Ok(Mode::Alt1),
            "alt2" => Ok(Mode::Alt2),
            "alt3" => Ok(Mode::Alt3),
            "alt4" => Ok(Mode::Alt4),
            "alt5" => Ok(Mode::Alt5),
            other => Err(Error::InvalidMode(other.to_owned())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Mode::Out => "out",
            Mode::In => "in",
            Mode::Alt0 => "alt0",
            Mode::Alt1 => "alt1",
            Mode::Alt2 => "alt2",
            Mode::Alt3 => "alt3",
            Mode::Alt4 => "alt4",
            Mode::Alt5 => "alt5",
        };
        f.write_str(name)
    }
}

/// Where to find the GPIO register window.
///
/// `/dev/gpiomem` exposes the GPIO block at offset 0 and does not need root. With
/// `/dev/mem`, `offset` must be the physical address of the block (for example
/// `0x3f20_0000` on the BCM2837).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpioConfig {
    pub device: PathBuf,
    pub offset: u64,
}

impl Default for GpioConfig {
    fn default() -> GpioConfig {
        GpioConfig {
            device: PathBuf::from("/dev/gpiomem"),
            offset: 0,
        }
    }
}

/// Exclusive shared mapping of the GPIO register window. Unmapped on drop.
pub struct RegisterMap {
    base: *mut u32,
    device: PathBuf,
}

impl RegisterMap {
    pub fn open(config: &GpioConfig) -> Result<RegisterMap> {
        let unavailable = |source| Error::ResourceUnavailable {
            resource: config.device.clone(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&config.device)
            .map_err(unavailable)?;

        let offset = libc::off_t::try_from(config.offset).map_err(|_| {
            unavailable(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("offset {:#x} does not fit off_t", config.offset),
            ))
        })?;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                BLOCK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(unavailable(std::io::Error::last_os_error()));
        }

        // The mapping stays valid after the file is closed.
        log::debug!("mapped {} bytes of {} at {:p}", BLOCK_SIZE, config.device.display(), base);

        Ok(RegisterMap {
            base: base as *mut u32,
            device: config.device.clone(),
        })
    }

    fn read(&self, word: usize) -> u32 {
        debug_assert!(word < BLOCK_SIZE / 4);
        unsafe { ptr::read_volatile(self.base.add(word)) }
    }

    fn write(&self, word: usize, value: u32) {
        debug_assert!(word < BLOCK_SIZE / 4);
        unsafe { ptr::write_volatile(self.base.add(word), value) }
    }
}

impl Drop for RegisterMap {
    fn drop(&mut self) {
        let res = unsafe { libc::munmap(self.base as *mut libc::c_void, BLOCK_SIZE) };
        if res == -1 {
            log::debug!("munmap of {} failed: {}", self.device.display(), std::io::Error::last_os_error());
        }
    }
}

impl fmt::Debug for RegisterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterMap")
            .field("device", &self.device)
            .field("base", &self.base)
            .finish()
    }
}

/// GPIO access through the memory mapped register block.
///
/// No check is made that a pin is configured as an output before it is set or
/// cleared, and reading a pin configured as output returns the level it drives.
#[derive(Debug, Default)]
pub struct Gpio {
    map: Option<RegisterMap>,
}

impl Gpio {
    pub fn new() -> Gpio {
        Gpio { map: None }
    }

    /// Maps `/dev/gpiomem`.
    pub fn initialize(&mut self) -> Result<()> {
        self.initialize_with(&GpioConfig::default())
    }

    /// Maps the register window described by `config`, replacing any previous mapping.
    pub fn initialize_with(&mut self, config: &GpioConfig) -> Result<()> {
        let map = RegisterMap::open(config)?;
        // Dropping the old mapping unmaps it.
        self.map = Some(map);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.map.is_some()
    }

    /// Releases the mapping. Further calls fail until the next `initialize`.
    pub fn close(&mut self) {
        if self.map.take().is_some() {
            log::debug!("GPIO registers unmapped");
        }
    }

    fn map(&self) -> Result<&RegisterMap> {
        self.map.as_ref().ok_or(Error::GpioNotInitialized)
    }

    pub fn set_mode(&self, pin: usize, mode: Mode) -> Result<()> {
        self.set_mode_many(&[pin], mode)
    }

    /// Sets every pin in `pins` to `mode`. Each function select word is
    /// read, modified and written back once, whatever the number of pins it holds.
    pub fn set_mode_many(&self, pins: &[usize], mode: Mode) -> Result<()> {
        let map = self.map()?;

        let mut clear = [0u32; FSEL_WORDS];
        let mut set = [0u32; FSEL_WORDS];

        for &pin in pins {
            let (word, shift) = fsel_field(pin)?;
            clear[word] |= FSEL_MASK << shift;
            set[word] = (set[word] & !(FSEL_MASK << shift)) | (mode.bits() << shift);
        }

        for word in 0..FSEL_WORDS {
            if clear[word] == 0 {
                continue;
            }

            let value = map.read(GPFSEL0 + word);
            map.write(GPFSEL0 + word, (value & !clear[word]) | set[word]);
        }

        Ok(())
    }

    pub fn get_mode(&self, pin: usize) -> Result<Mode> {
        let map = self.map()?;
        let (word, shift) = fsel_field(pin)?;

        Ok(Mode::from_bits(map.read(GPFSEL0 + word) >> shift))
    }

    /// Drives the given pins high.
    pub fn set(&self, pins: &[usize]) -> Result<()> {
        let mask = pin_mask(pins)?;
        self.set_mask(mask)
    }

    /// Drives the given pins low.
    pub fn clear(&self, pins: &[usize]) -> Result<()> {
        let mask = pin_mask(pins)?;
        self.clear_mask(mask)
    }

    /// Writes `mask` to the set register. Bit `i` is pin `i`; bits above the last pin are dropped.
    pub fn set_mask(&self, mask: u32) -> Result<()> {
        self.map()?.write(GPSET0, mask & PIN_MASK);
        Ok(())
    }

    /// Writes `mask` to the clear register. Bit `i` is pin `i`; bits above the last pin are dropped.
    pub fn clear_mask(&self, mask: u32) -> Result<()> {
        self.map()?.write(GPCLR0, mask & PIN_MASK);
        Ok(())
    }

    /// Returns `true` if `pin` is at a high level.
    pub fn read(&self, pin: usize) -> Result<bool> {
        if pin >= PIN_COUNT {
            return Err(Error::InvalidPin(pin));
        }

        Ok(self.map()?.read(GPLEV0) & (1 << pin) != 0)
    }

    /// Levels of all pins, bit `i` being pin `i`.
    pub fn read_all(&self) -> Result<u32> {
        Ok(self.map()?.read(GPLEV0) & PIN_MASK)
    }

    /// Sets the pins whose bit is 1 in `value` and clears all the others.
    pub fn apply_value(&self, value: u32) -> Result<()> {
        let map = self.map()?;

        map.write(GPSET0, value & PIN_MASK);
        map.write(GPCLR0, !value & PIN_MASK);

        Ok(())
    }

    /// Same as [`apply_value`](Gpio::apply_value) with entry `i` of `levels` driving pin `i`.
    pub fn apply_levels(&self, levels: &[bool]) -> Result<()> {
        let value = levels
            .iter()
            .take(PIN_COUNT)
            .enumerate()
            .filter(|&(_, &high)| high)
            .fold(0u32, |acc, (pin, _)| acc | (1 << pin));

        self.apply_value(value)
    }
}

fn fsel_field(pin: usize) -> Result<(usize, usize)> {
    if pin >= PIN_COUNT {
        return Err(Error::InvalidPin(pin));
    }

    Ok((pin / PINS_PER_FSEL, (pin % PINS_PER_FSEL) * FSEL_BITS))
}

fn pin_mask(pins: &[usize]) -> Result<u32> {
    pins.iter().try_fold(0u32, |mask, &pin| {
        if pin >= PIN_COUNT {
            Err(Error::InvalidPin(pin))
        } else {
            Ok(mask | (1 << pin))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    // A regular file stands in for /dev/gpiomem, so writes land in plain memory.
    fn mapped() -> (NamedTempFile, Gpio) {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(BLOCK_SIZE as u64).unwrap();

        let mut gpio = Gpio::new();
        gpio.initialize_with(&GpioConfig {
            device: file.path().to_owned(),
            offset: 0,
        })
        .unwrap();

        (file, gpio)
    }

    fn register(gpio: &Gpio, word: usize) -> u32 {
        gpio.map().unwrap().read(word)
    }

    #[test]
    fn mode_round_trip_every_pin() {
        let (_file, gpio) = mapped();

        for pin in 0..PIN_COUNT {
            for &mode in Mode::ALL.iter() {
                gpio.set_mode(pin, mode).unwrap();
                assert_eq!(gpio.get_mode(pin).unwrap(), mode, "pin {}", pin);
            }
        }
    }

    #[test]
    fn set_mode_leaves_neighbours_alone() {
        let (_file, gpio) = mapped();

        gpio.set_mode(10, Mode::Alt3).unwrap();
        gpio.set_mode(12, Mode::Alt5).unwrap();
        gpio.set_mode(11, Mode::Out).unwrap();

        assert_eq!(gpio.get_mode(10).unwrap(), Mode::Alt3);
        assert_eq!(gpio.get_mode(11).unwrap(), Mode::Out);
        assert_eq!(gpio.get_mode(12).unwrap(), Mode::Alt5);
        assert_eq!(register(&gpio, GPFSEL0 + 1), 0b010_001_111);
    }

    #[test]
    fn set_mode_many_spans_words() {
        let (_file, gpio) = mapped();

        gpio.set_mode(8, Mode::Alt1).unwrap();
        gpio.set_mode_many(&[9, 10, 11, 27], Mode::Alt0).unwrap();

        assert_eq!(gpio.get_mode(8).unwrap(), Mode::Alt1);
        for &pin in [9, 10, 11, 27].iter() {
            assert_eq!(gpio.get_mode(pin).unwrap(), Mode::Alt0);
        }
        assert_eq!(gpio.get_mode(12).unwrap(), Mode::In);
    }

    #[test]
    fn invalid_pin_writes_nothing() {
        let (_file, gpio) = mapped();

        assert!(matches!(gpio.set_mode_many(&[3, 28], Mode::Out), Err(Error::InvalidPin(28))));
        assert_eq!(gpio.get_mode(3).unwrap(), Mode::In);
        assert!(matches!(gpio.get_mode(99), Err(Error::InvalidPin(99))));
        assert!(matches!(gpio.read(28), Err(Error::InvalidPin(28))));
        assert!(matches!(gpio.set(&[1, 40]), Err(Error::InvalidPin(40))));
    }

    #[test]
    fn set_and_clear_write_masks() {
        let (_file, gpio) = mapped();

        gpio.set(&[0, 5, 27]).unwrap();
        assert_eq!(register(&gpio, GPSET0), (1 << 0) | (1 << 5) | (1 << 27));

        gpio.clear(&[2]).unwrap();
        assert_eq!(register(&gpio, GPCLR0), 1 << 2);

        gpio.set_mask(0xffff_ffff).unwrap();
        assert_eq!(register(&gpio, GPSET0), PIN_MASK);
    }

    #[test]
    fn apply_value_splits_into_set_and_clear() {
        let (_file, gpio) = mapped();

        for &value in [0u32, 0xaaaa_aaaa, 0x5555_5555, 0xffff_ffff, 0x0f00_0001].iter() {
            gpio.apply_value(value).unwrap();

            let set = register(&gpio, GPSET0);
            let clear = register(&gpio, GPCLR0);
            assert_eq!(set, value & PIN_MASK);
            assert_eq!(clear, !value & PIN_MASK);
            assert_eq!(set & clear, 0);
            assert_eq!((set | clear) & !PIN_MASK, 0);
        }
    }

    #[test]
    fn apply_levels_ignores_extra_entries() {
        let (_file, gpio) = mapped();

        let mut levels = vec![false; 40];
        levels[1] = true;
        levels[27] = true;
        levels[30] = true;
        gpio.apply_levels(&levels).unwrap();

        assert_eq!(register(&gpio, GPSET0), (1 << 1) | (1 << 27));
    }

    #[test]
    fn read_masks_level_register() {
        let (_file, gpio) = mapped();

        gpio.map().unwrap().write(GPLEV0, 0xf000_0021);
        assert!(gpio.read(0).unwrap());
        assert!(!gpio.read(1).unwrap());
        assert!(gpio.read(5).unwrap());
        assert_eq!(gpio.read_all().unwrap(), 0x21);
    }

    #[test]
    fn reinitialize_and_close() {
        let (file, mut gpio) = mapped();

        gpio.set_mode(4, Mode::Out).unwrap();
        gpio.initialize_with(&GpioConfig {
            device: file.path().to_owned(),
            offset: 0,
        })
        .unwrap();
        // Same backing file, so the new mapping sees the old write.
        assert_eq!(gpio.get_mode(4).unwrap(), Mode::Out);

        gpio.close();
        gpio.close();
        assert!(!gpio.is_initialized());
        assert!(matches!(gpio.read(0), Err(Error::GpioNotInitialized)));
    }

    #[test]
    fn missing_device_is_unavailable() {
        let mut gpio = Gpio::new();
        let err = gpio
            .initialize_with(&GpioConfig {
                device: PathBuf::from("/nonexistent/gpiomem"),
                offset: 0,
            })
            .unwrap_err();

        assert!(matches!(err, Error::ResourceUnavailable { .. }));
        assert!(!gpio.is_initialized());
    }

    #[test]
    fn mode_tokens() {
        assert_eq!("alt4".parse::<Mode>().unwrap(), Mode::Alt4);
        assert_eq!("out".parse::<Mode>().unwrap(), Mode::Out);
        assert!(matches!("alt6".parse::<Mode>(), Err(Error::InvalidMode(_))));

        for &mode in Mode::ALL.iter() {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
            assert_eq!(Mode::from_bits(mode.bits()), mode);
        }
    }
}
