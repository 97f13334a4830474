//! The single-threaded loop moving bytes between the device and the virtual ports.
//!
//! Each [`Scheduler::tick`]:
//!
//! 1. Waits (bounded) for the device and every active virtual port to become readable.
//!    Idle ports are left out, an unattached pseudo-terminal looks permanently "ready".
//! 2. Broadcasts device output to every alive port, and forwards port input to the device.
//! 3. Probes idle ports with a single non-blocking read to notice new clients.
//! 4. Rebuilds dead ports.
//! 5. Periodically logs [`Stats`].
//!
//! A device failure reopens the device (blocking until it is back)
//! and starts over at step 1.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Instant;

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn};

use crate::{
    config::{Config, Timing},
    endpoint::{publish, EndpointState, Failure, VirtualEndpoint},
    error::Error,
    serial::{open_with_retry, Device, DeviceOpener},
};

mod stats;

pub use stats::Stats;

/// Largest chunk moved in one read.
pub const CHUNK_SIZE: usize = 4096;

/// A snapshot of a virtual port, for observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    /// Where the port is published.
    pub path: PathBuf,

    /// The pseudo-terminal peer the path currently points at.
    /// `None` while the port could not be rebuilt.
    pub peer: Option<PathBuf>,

    /// See [`EndpointState`].
    pub state: EndpointState,

    /// Starts at zero, incremented each time the port is rebuilt.
    pub generation: u64,
}

/// Position in the configured port list, and whatever lives there now.
#[derive(Debug)]
struct Slot {
    path: PathBuf,

    /// `None` only if rebuilding failed; retried every sweep.
    endpoint: Option<VirtualEndpoint>,

    generation: u64,
}

impl Slot {
    fn alive(&mut self) -> Option<&mut VirtualEndpoint> {
        self.endpoint.as_mut().filter(|e| e.is_alive())
    }

    fn state(&self) -> EndpointState {
        self.endpoint
            .as_ref()
            .map_or(EndpointState::Dead, VirtualEndpoint::state)
    }
}

/// What a readiness entry belongs to.
#[derive(Debug, Clone, Copy)]
enum Watched {
    Device,
    Endpoint(usize),
}

/// Whether the rest of an iteration may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,

    /// The device was reopened, start over from the top.
    Restart,
}

fn readable() -> PollFlags {
    PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

/// Owns the device and all virtual ports, and moves bytes between them.
///
/// Dropping the scheduler closes everything and removes the published aliases.
pub struct Scheduler<O: DeviceOpener> {
    opener: O,
    device: Option<Box<dyn Device>>,
    slots: Vec<Slot>,
    timing: Timing,
    stats: Stats,
    reporter: stats::Reporter,
    cancel: CancellationToken,
}

impl<O: DeviceOpener> Scheduler<O> {
    /// Open the device (waiting for it as long as it takes) and create the virtual ports.
    ///
    /// Fails if a virtual port cannot be created,
    /// or with [`Error::Cancelled`] if `cancel` fires while waiting for the device.
    pub fn start(config: &Config, mut opener: O, cancel: CancellationToken) -> Result<Self, Error> {
        let device = open_with_retry(&mut opener, config.timing.reconnect_interval, &cancel)?;

        let mut scheduler = Self {
            opener,
            device: Some(device),
            slots: Vec::with_capacity(config.virtual_ports.len()),
            timing: config.timing.clone(),
            stats: Stats::default(),
            reporter: stats::Reporter::new(config.timing.stats_interval, Instant::now()),
            cancel,
        };

        // Pushed one at a time so that a failure part way
        // still cleans up the ones already published.
        for path in &config.virtual_ports {
            let endpoint = VirtualEndpoint::create(path.clone())?;

            scheduler.slots.push(Slot {
                path: path.clone(),
                endpoint: Some(endpoint),
                generation: 0,
            });
        }

        Ok(scheduler)
    }

    /// Run until cancelled.
    ///
    /// Only returns an error if waiting for readiness fails,
    /// everything else is recovered from.
    pub fn run(&mut self) -> Result<(), Error> {
        let span = info_span!("mux", device = %self.opener.name());
        let _entered = span.enter();

        info!("Multiplexer running. Waiting for data...");

        while !self.cancel.is_cancelled() {
            match self.tick() {
                Ok(()) => {}
                Err(Error::Cancelled) => break,
                Err(e) => {
                    error!(error = %e, "Unrecoverable, stopping");
                    return Err(e);
                }
            }
        }

        info!("Cancelled, stopping");
        Ok(())
    }

    /// One iteration of the loop.
    pub fn tick(&mut self) -> Result<(), Error> {
        let (mut fds, watched) = self.wait_set();

        let timeout = i32::try_from(self.timing.poll_timeout.as_millis()).unwrap_or(i32::MAX);

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                trace!("Wait interrupted, waiting again");
                return Ok(());
            }
            Err(e) => return Err(Error::Wait(e)),
        }

        let ready = watched
            .into_iter()
            .zip(fds.iter())
            .filter_map(|(watched, fd)| {
                fd.revents()
                    .filter(|revents| revents.intersects(readable()))
                    .map(|revents| (watched, revents))
            })
            .collect::<Vec<_>>();

        let mut handled = vec![false; self.slots.len()];

        for (watched, revents) in ready {
            let flow = match watched {
                Watched::Device => self.relay_from_device(revents)?,
                Watched::Endpoint(index) => {
                    handled[index] = true;
                    self.relay_from_endpoint(index)?
                }
            };

            if flow == Flow::Restart {
                return Ok(());
            }
        }

        if self.probe_idle(&handled)? == Flow::Restart {
            return Ok(());
        }

        self.recover();

        let endpoints = self.endpoints();
        self.reporter
            .report_if_due(Instant::now(), &self.stats, &endpoints);

        Ok(())
    }

    /// The state of each virtual port, in configuration order.
    pub fn endpoints(&self) -> Vec<EndpointStatus> {
        self.slots
            .iter()
            .map(|slot| EndpointStatus {
                path: slot.path.clone(),
                peer: slot.endpoint.as_ref().map(|e| e.peer().to_path_buf()),
                state: slot.state(),
                generation: slot.generation,
            })
            .collect()
    }

    /// Counters so far.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    fn wait_set(&self) -> (Vec<PollFd>, Vec<Watched>) {
        let mut fds = Vec::with_capacity(self.slots.len() + 1);
        let mut watched = Vec::with_capacity(self.slots.len() + 1);

        if let Some(device) = &self.device {
            fds.push(PollFd::new(device.as_raw_fd(), PollFlags::POLLIN));
            watched.push(Watched::Device);
        }

        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(endpoint) = &slot.endpoint {
                if endpoint.state() == EndpointState::Active {
                    fds.push(PollFd::new(endpoint.as_raw_fd(), PollFlags::POLLIN));
                    watched.push(Watched::Endpoint(index));
                }
            }
        }

        (fds, watched)
    }

    /// Close the stale device and block until it can be opened again.
    fn reconnect(&mut self, reason: Error) -> Result<Flow, Error> {
        warn!(error = %reason, "Device failed, reconnecting");

        // Serial ports are opened exclusively,
        // the old handle has to go before a new one can be had.
        drop(self.device.take());

        let device = open_with_retry(
            &mut self.opener,
            self.timing.reconnect_interval,
            &self.cancel,
        )?;

        self.device = Some(device);
        self.stats.device_reconnects += 1;

        Ok(Flow::Restart)
    }

    fn relay_from_device(&mut self, revents: PollFlags) -> Result<Flow, Error> {
        let Some(device) = self.device.as_mut() else {
            return Ok(Flow::Continue);
        };

        let mut buf = [0u8; CHUNK_SIZE];

        let n = match device.read(&mut buf) {
            Ok(0) if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) => {
                return self.reconnect(Error::DeviceDisconnected);
            }
            Ok(0) => return Ok(Flow::Continue),
            Ok(n) => n,
            Err(e) if is_transient(&e) => return Ok(Flow::Continue),
            Err(e) => return self.reconnect(Error::DeviceIo(e)),
        };

        self.stats.bytes_from_device += n as u64;
        debug!(bytes = n, "Device -> virtual ports");

        self.broadcast(&buf[..n]);

        Ok(Flow::Continue)
    }

    /// Every alive port gets the data, idle ones too.
    /// A client attaching later finds it buffered.
    fn broadcast(&mut self, data: &[u8]) {
        for slot in &mut self.slots {
            let Some(endpoint) = slot.alive() else {
                continue;
            };

            match endpoint.write_all(data) {
                Ok(()) => {}
                Err(Failure::WouldBlock | Failure::Interrupted | Failure::PeerGone) => {
                    debug!(path = ?endpoint.path(), "Write to virtual port skipped");
                }
                Err(Failure::Fatal(errno)) => {
                    warn!(path = ?endpoint.path(), error = %errno, "Write to virtual port failed, marking dead");
                    endpoint.set_state(EndpointState::Dead);
                }
            }
        }
    }

    fn relay_from_endpoint(&mut self, index: usize) -> Result<Flow, Error> {
        let Some(endpoint) = self.slots[index].alive() else {
            return Ok(Flow::Continue);
        };

        let mut buf = [0u8; CHUNK_SIZE];

        let n = match endpoint.read(&mut buf) {
            Ok(0) | Err(Failure::PeerGone) => {
                info!(path = ?endpoint.path(), "Client disconnected");
                endpoint.set_state(EndpointState::Idle);
                return Ok(Flow::Continue);
            }
            Ok(n) => n,
            Err(Failure::WouldBlock | Failure::Interrupted) => return Ok(Flow::Continue),
            Err(Failure::Fatal(errno)) => {
                warn!(path = ?endpoint.path(), error = %errno, "Read from virtual port failed, marking dead");
                endpoint.set_state(EndpointState::Dead);
                return Ok(Flow::Continue);
            }
        };

        debug!(path = ?endpoint.path(), bytes = n, "Virtual port -> device");

        self.write_to_device(&buf[..n])
    }

    fn write_to_device(&mut self, data: &[u8]) -> Result<Flow, Error> {
        let Some(device) = self.device.as_mut() else {
            return Ok(Flow::Continue);
        };

        match device.write_all(data).and_then(|()| device.flush()) {
            Ok(()) => {
                self.stats.bytes_to_device += data.len() as u64;
                Ok(Flow::Continue)
            }
            Err(e) => self.reconnect(Error::DeviceIo(e)),
        }
    }

    /// Look for clients on idle ports which were not already dealt with this iteration.
    fn probe_idle(&mut self, handled: &[bool]) -> Result<Flow, Error> {
        for index in 0..self.slots.len() {
            if handled[index] {
                continue;
            }

            let Some(endpoint) = self.slots[index].alive().filter(|e| e.is_idle()) else {
                continue;
            };

            let mut byte = [0u8; 1];

            let forward = match endpoint.read(&mut byte) {
                Ok(0) | Err(Failure::PeerGone | Failure::Interrupted) => continue,
                Ok(n) => Some(n),
                Err(Failure::WouldBlock) => None,
                Err(Failure::Fatal(errno)) => {
                    warn!(path = ?endpoint.path(), error = %errno, "Probe of virtual port failed, marking dead");
                    endpoint.set_state(EndpointState::Dead);
                    continue;
                }
            };

            info!(path = ?endpoint.path(), "Client connected");
            endpoint.set_state(EndpointState::Active);

            // The probe consumed real data, it belongs to the device.
            if let Some(n) = forward {
                if self.write_to_device(&byte[..n])? == Flow::Restart {
                    return Ok(Flow::Restart);
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// Rebuild every dead port in place.
    fn recover(&mut self) {
        for slot in &mut self.slots {
            if slot.state().is_alive() {
                continue;
            }

            let rebuilt = match slot.endpoint.take() {
                Some(dead) => dead.recreate(),
                None => VirtualEndpoint::create(slot.path.clone()),
            };

            match rebuilt {
                Ok(endpoint) => {
                    slot.endpoint = Some(endpoint);
                    slot.generation += 1;
                    self.stats.endpoint_rebuilds += 1;
                }
                Err(e) => {
                    error!(path = ?slot.path, error = %e, "Could not rebuild virtual port, will retry");
                }
            }
        }
    }
}

impl<O: DeviceOpener> Drop for Scheduler<O> {
    fn drop(&mut self) {
        info!("Shutting down...");

        drop(self.device.take());

        for slot in &mut self.slots {
            if let Some(endpoint) = slot.endpoint.take() {
                endpoint.destroy();
            }

            if publish::unpublish(&slot.path) {
                info!(path = ?slot.path, "Removed alias");
            }
        }
    }
}
