#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use color_eyre::Result;
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    pty::openpty,
    sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg},
};
use serial_mux::{
    config::Config,
    error::Error,
    scheduler::Scheduler,
    serial::{Device, DeviceOpener},
};

/// How many iterations to allow for bytes to make it through.
pub const MAX_TICKS: usize = 100;

fn make_raw(file: &File) -> Result<()> {
    let mut termios = tcgetattr(file.as_raw_fd())?;
    cfmakeraw(&mut termios);
    tcsetattr(file.as_raw_fd(), SetArg::TCSANOW, &termios)?;

    Ok(())
}

fn make_nonblocking(file: &File) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(file.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

    Ok(())
}

/// A pseudo-terminal standing in for the physical device.
///
/// The first file goes to the multiplexer,
/// the second is what "the device" writes to and reads from.
pub fn fake_device() -> Result<(File, File)> {
    let pair = openpty(None, None)?;

    // SAFETY: Freshly opened by `openpty`, owned by nobody else.
    let (mux_side, device_side) =
        unsafe { (File::from_raw_fd(pair.master), File::from_raw_fd(pair.slave)) };

    make_raw(&device_side)?;
    make_nonblocking(&device_side)?;

    Ok((mux_side, device_side))
}

/// Hands out prepared devices in order.
/// `None` entries, or running out, fail the open.
pub struct Scripted {
    devices: VecDeque<Option<File>>,
    attempts: Arc<AtomicUsize>,
}

impl Scripted {
    pub fn new<I: IntoIterator<Item = Option<File>>>(devices: I) -> (Self, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));

        (
            Self {
                devices: devices.into_iter().collect(),
                attempts: attempts.clone(),
            },
            attempts,
        )
    }
}

impl DeviceOpener for Scripted {
    fn name(&self) -> String {
        "scripted".into()
    }

    fn open(&mut self) -> Result<Box<dyn Device>, Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match self.devices.pop_front().flatten() {
            Some(device) => Ok(Box::new(device)),
            None => Err(Error::DeviceDisconnected),
        }
    }
}

pub fn attempts(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}

/// A configuration with `ports` virtual ports in `dir` and quick timings.
pub fn config(dir: &Path, ports: usize) -> Config {
    let mut config = Config::example();

    config.virtual_ports = (0..ports).map(|i| dir.join(format!("ttyV{i}"))).collect();
    config.timing.poll_timeout = Duration::from_millis(10);
    config.timing.reconnect_interval = Duration::from_millis(10);

    config
}

/// Open a virtual port the way a client program would.
pub fn open_client(path: &Path) -> Result<File> {
    let client = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(nix::libc::O_NOCTTY | nix::libc::O_NONBLOCK)
        .open(path)?;

    make_raw(&client)?;

    Ok(client)
}

/// Read whatever is available right now.
pub fn drain(file: &mut File) -> Result<Vec<u8>> {
    let mut out = vec![];
    let mut buf = [0u8; 1024];

    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(out)
}

/// Tick until `len` bytes have shown up in `file`, or give up.
pub fn collect<O: DeviceOpener>(
    scheduler: &mut Scheduler<O>,
    file: &mut File,
    len: usize,
) -> Result<Vec<u8>> {
    let mut got = vec![];

    for _ in 0..MAX_TICKS {
        scheduler.tick()?;
        got.extend(drain(file)?);

        if got.len() >= len {
            break;
        }
    }

    Ok(got)
}

/// Tick until `condition` holds, or give up.
/// Returns whether it held.
pub fn tick_until<O: DeviceOpener, F: FnMut(&Scheduler<O>) -> bool>(
    scheduler: &mut Scheduler<O>,
    mut condition: F,
) -> Result<bool> {
    for _ in 0..MAX_TICKS {
        if condition(scheduler) {
            return Ok(true);
        }

        scheduler.tick()?;
    }

    Ok(condition(scheduler))
}
