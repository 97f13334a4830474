use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Error;

use super::{Device, DeviceOpener};

/// Sleep for `duration` unless cancelled first.
/// Returns `false` if cancelled.
fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    const SLICE: Duration = Duration::from_millis(50);

    let deadline = Instant::now() + duration;

    loop {
        if cancel.is_cancelled() {
            return false;
        }

        let now = Instant::now();
        if now >= deadline {
            return true;
        }

        std::thread::sleep(SLICE.min(deadline - now));
    }
}

/// Open the device, retrying every `interval` until it works.
///
/// There is no retry limit: a device which is unplugged is expected to come back.
/// The only way out without a device is cancellation, which gives [`Error::Cancelled`].
pub fn open_with_retry<O: DeviceOpener + ?Sized>(
    opener: &mut O,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<Box<dyn Device>, Error> {
    let name = opener.name();
    info!(device = %name, "Attempting to open device");

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match opener.open() {
            Ok(device) => {
                info!(device = %name, fd = device.as_raw_fd(), "Device opened");
                return Ok(device);
            }
            Err(e) => {
                warn!(device = %name, error = %e, "Could not open device, retrying in {interval:?}");

                if !sleep_unless_cancelled(interval, cancel) {
                    return Err(Error::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Fails a number of times, then opens `/dev/null`.
    struct Flaky {
        failures_left: usize,
        attempts: usize,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures_left: failures,
                attempts: 0,
            }
        }
    }

    impl DeviceOpener for Flaky {
        fn name(&self) -> String {
            "flaky".into()
        }

        fn open(&mut self) -> Result<Box<dyn Device>, Error> {
            self.attempts += 1;

            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(Error::DeviceDisconnected);
            }

            Ok(Box::new(
                File::options().read(true).write(true).open("/dev/null").unwrap(),
            ))
        }
    }

    #[test]
    fn retries_until_open() {
        let mut opener = Flaky::new(3);

        let device = open_with_retry(
            &mut opener,
            Duration::from_millis(1),
            &CancellationToken::new(),
        );

        assert!(device.is_ok());
        assert_eq!(opener.attempts, 4);
    }

    #[test]
    fn cancelled_before_start() {
        let mut opener = Flaky::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = open_with_retry(&mut opener, Duration::from_millis(1), &cancel);

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(opener.attempts, 0);
    }

    #[test]
    fn cancel_interrupts_backoff() {
        let mut opener = Flaky::new(usize::MAX);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                cancel.cancel();
            })
        };

        let started = Instant::now();
        let result = open_with_retry(&mut opener, Duration::from_secs(60), &cancel);
        canceller.join().unwrap();

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(opener.attempts, 1);
    }
}
