use std::path::Path;

use baremetal_pi::{Error, GpioConfig, Mode, Peripherals, SpiConfig, TransferOverrides};
use tempfile::NamedTempFile;

fn fake_gpiomem() -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(4096).unwrap();
    file
}

#[test]
fn independent_instances() {
    let first_mem = fake_gpiomem();
    let second_mem = fake_gpiomem();

    let mut first = Peripherals::new();
    let mut second = Peripherals::new();

    first
        .gpio
        .initialize_with(&GpioConfig {
            device: first_mem.path().to_owned(),
            offset: 0,
        })
        .unwrap();
    second
        .gpio
        .initialize_with(&GpioConfig {
            device: second_mem.path().to_owned(),
            offset: 0,
        })
        .unwrap();

    first.gpio.set_mode_many(&[2, 3], Mode::Alt0).unwrap();
    second.gpio.set_mode(2, Mode::Out).unwrap();

    assert_eq!(first.gpio.get_mode(2).unwrap(), Mode::Alt0);
    assert_eq!(first.gpio.get_mode(3).unwrap(), Mode::Alt0);
    assert_eq!(second.gpio.get_mode(2).unwrap(), Mode::Out);
    assert_eq!(second.gpio.get_mode(3).unwrap(), Mode::In);
}

#[test]
fn uninitialized_peripherals_fail_cleanly() {
    let mut p = Peripherals::new();

    assert!(matches!(p.gpio.set(&[1]), Err(Error::GpioNotInitialized)));
    assert!(matches!(
        p.spi.transfer_one(1, &[0], &TransferOverrides::default()),
        Err(Error::InvalidDeviceId(1))
    ));
    assert!(matches!(p.i2c.read_byte(1), Err(Error::InvalidDeviceId(1))));

    p.close_all();
    p.close_all();
}

#[test]
fn missing_devices_report_their_path() {
    let mut p = Peripherals::new();

    match p.spi.initialize(&["/nonexistent/spidev0.0"], &SpiConfig::default()) {
        Err(Error::DeviceOpenFailed { path, .. }) => assert_eq!(path, Path::new("/nonexistent/spidev0.0")),
        other => panic!("unexpected {:?}", other),
    }
    match p.i2c.initialize(&["/nonexistent/i2c-1"]) {
        Err(Error::DeviceOpenFailed { path, .. }) => assert_eq!(path, Path::new("/nonexistent/i2c-1")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!p.spi.is_initialized());
    assert!(!p.i2c.is_initialized());
}

#[test]
fn close_all_releases_everything() {
    let mem = fake_gpiomem();
    let mut p = Peripherals::new();
    p.gpio
        .initialize_with(&GpioConfig {
            device: mem.path().to_owned(),
            offset: 0,
        })
        .unwrap();

    p.close_all();

    assert!(!p.gpio.is_initialized());
    assert!(matches!(p.gpio.read_all(), Err(Error::GpioNotInitialized)));
}
