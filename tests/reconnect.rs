use std::fs::File;
use std::io::Write;
use std::time::Duration;

use color_eyre::Result;
use common::*;
use pretty_assertions::assert_eq;
use serial_mux::{endpoint::EndpointState, error::Error, scheduler::Scheduler};
use tokio_util::sync::CancellationToken;

mod common;

#[test]
fn start_waits_for_device() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (mux_side, _device) = fake_device()?;
    let (opener, opened) = Scripted::new([None, None, Some(mux_side)]);

    let scheduler = Scheduler::start(&config(dir.path(), 1), opener, CancellationToken::new())?;

    assert_eq!(attempts(&opened), 3);
    assert_eq!(scheduler.endpoints().len(), 1);

    Ok(())
}

#[test]
fn cancel_while_waiting_for_device() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path(), 2);
    let (opener, opened) = Scripted::new(Vec::<Option<File>>::new());
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        })
    };

    let result = Scheduler::start(&config, opener, cancel);
    canceller.join().expect("canceller should not panic");

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(attempts(&opened) > 1);

    // Nothing was published
    for path in &config.virtual_ports {
        assert!(std::fs::symlink_metadata(path).is_err());
    }

    Ok(())
}

#[test]
fn unplugged_device_is_reopened_without_rebuilding_ports() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (first_mux_side, first_device) = fake_device()?;
    let (second_mux_side, mut second_device) = fake_device()?;
    let (opener, opened) = Scripted::new([Some(first_mux_side), None, Some(second_mux_side)]);
    let mut scheduler = Scheduler::start(&config(dir.path(), 2), opener, CancellationToken::new())?;

    let mut client = open_client(&dir.path().join("ttyV0"))?;
    assert!(tick_until(&mut scheduler, |s| s.endpoints()[0].state
        == EndpointState::Active)?);
    let before = scheduler.endpoints();

    // Unplug
    drop(first_device);

    assert!(tick_until(&mut scheduler, |s| s.stats().device_reconnects == 1)?);
    assert_eq!(attempts(&opened), 3);

    // Ports untouched
    assert_eq!(scheduler.endpoints(), before);

    // Relaying resumes on the new device, both ways
    second_device.write_all(b"back")?;
    let got = collect(&mut scheduler, &mut client, 4)?;
    assert_eq!(got, b"back");

    client.write_all(b"ok")?;
    let got = collect(&mut scheduler, &mut second_device, 2)?;
    assert_eq!(got, b"ok");

    Ok(())
}

#[test]
fn run_cleans_up_on_cancel() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path(), 2);
    let cancel = CancellationToken::new();

    let engine = {
        let config = config.clone();
        let cancel = cancel.clone();

        std::thread::spawn(move || -> Result<(), Error> {
            let (mux_side, _device) = fake_device().map_err(|_| Error::DeviceDisconnected)?;
            let (opener, _) = Scripted::new([Some(mux_side)]);

            Scheduler::start(&config, opener, cancel)?.run()
        })
    };

    // Wait for the ports to show up
    for _ in 0..MAX_TICKS {
        if config.virtual_ports.iter().all(|p| p.exists()) {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(config.virtual_ports.iter().all(|p| p.exists()));

    cancel.cancel();
    engine.join().expect("engine should not panic")?;

    for path in &config.virtual_ports {
        assert!(std::fs::symlink_metadata(path).is_err());
    }

    Ok(())
}
