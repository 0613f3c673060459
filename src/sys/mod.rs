// Helper macro to execute a system call that returns an `io::Result`, logging the call in case of errors.
macro_rules! syscall {
    ($fn:ident($($arg:expr),* $(,)*)) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            let err = std::io::Error::last_os_error();
            log::debug!("{} failed with {:?}: {}", stringify!($fn), ($($arg, )*), err);
            Err(err)
        } else {
            Ok(res)
        }
    }};
}

pub mod gpio;
pub mod i2c;
pub mod spi;

#[cfg(target_env = "musl")]
pub(crate) type IoctlNumType = std::os::raw::c_int;
#[cfg(not(target_env = "musl"))]
pub(crate) type IoctlNumType = std::os::raw::c_ulong;

pub(crate) const WRITE: u8 = 1;

const NRBITS: IoctlNumType = 8;
const TYPEBITS: IoctlNumType = 8;
const SIZEBITS: IoctlNumType = 14;
const DIRBITS: IoctlNumType = 2;

const NRSHIFT: IoctlNumType = 0;
const TYPESHIFT: IoctlNumType = NRSHIFT + NRBITS;
const SIZESHIFT: IoctlNumType = TYPESHIFT + TYPEBITS;
const DIRSHIFT: IoctlNumType = SIZESHIFT + SIZEBITS;

const NRMASK: IoctlNumType = (1 << NRBITS) - 1;
const TYPEMASK: IoctlNumType = (1 << TYPEBITS) - 1;
pub(crate) const SIZEMASK: IoctlNumType = (1 << SIZEBITS) - 1;
const DIRMASK: IoctlNumType = (1 << DIRBITS) - 1;

/// Encodes an ioctl request number the way `_IOC` in `asm-generic/ioctl.h` does.
pub(crate) const fn ioc(dir: u8, ty: u8, nr: u8, size: usize) -> IoctlNumType {
    ((dir as IoctlNumType & DIRMASK) << DIRSHIFT)
        | ((ty as IoctlNumType & TYPEMASK) << TYPESHIFT)
        | ((nr as IoctlNumType & NRMASK) << NRSHIFT)
        | ((size as IoctlNumType & SIZEMASK) << SIZESHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioc_matches_kernel_encoding() {
        // _IOW('k', 1, __u8) == SPI_IOC_WR_MODE
        assert_eq!(ioc(WRITE, b'k', 1, 1), 0x4001_6b01);
        // _IOW('k', 4, __u32) == SPI_IOC_WR_MAX_SPEED_HZ
        assert_eq!(ioc(WRITE, b'k', 4, 4), 0x4004_6b04);
        // _IOW('k', 0, char[32]) == SPI_IOC_MESSAGE(1)
        assert_eq!(ioc(WRITE, b'k', 0, 32), 0x4020_6b00);
        assert_eq!(ioc(0, b'k', 0, 0), 0x6b00);
    }
}
