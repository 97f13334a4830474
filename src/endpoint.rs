use std::fmt::Display;
use std::fs::{self, Permissions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Error;

pub(crate) mod pty;
pub(crate) mod publish;

pub use pty::Failure;

/// Where an endpoint is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    /// Alive, but no client has the peer side open.
    /// Probed every iteration rather than waited on.
    Idle,

    /// Alive, and a client has the peer side open.
    Active,

    /// Broken. Must be rebuilt before any further use.
    Dead,
}

impl EndpointState {
    /// Alive endpoints may be read from and written to.
    pub fn is_alive(&self) -> bool {
        !matches!(self, EndpointState::Dead)
    }
}

impl Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointState::Idle => write!(f, "idle"),
            EndpointState::Active => write!(f, "active"),
            EndpointState::Dead => write!(f, "dead"),
        }
    }
}

/// A virtual serial port.
///
/// The controller side of a pseudo-terminal is held here,
/// the peer side is published at [`VirtualEndpoint::path`] for clients to open.
#[derive(Debug)]
pub struct VirtualEndpoint {
    path: PathBuf,
    peer: PathBuf,
    controller: pty::Controller,
    state: EndpointState,
}

impl VirtualEndpoint {
    /// Allocate a pseudo-terminal and publish it at `path`.
    ///
    /// A stale alias at `path` is replaced.
    /// The endpoint starts out [`EndpointState::Idle`].
    pub fn create<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let path = path.into();
        let pty::Pty { controller, peer } = pty::open()?;

        fs::set_permissions(&peer, Permissions::from_mode(0o666)).map_err(|source| {
            Error::Publish {
                path: peer.clone(),
                source,
            }
        })?;

        publish::publish(&path, &peer)?;

        info!(
            ?path,
            ?peer,
            fd = controller.as_raw_fd(),
            "Virtual port created"
        );

        Ok(Self {
            path,
            peer,
            controller,
            state: EndpointState::Idle,
        })
    }

    /// Close the controller.
    /// The published alias stays, it is replaced by the next [`VirtualEndpoint::create`] at the same path.
    pub fn destroy(self) {
        debug!(path = ?self.path, fd = self.controller.as_raw_fd(), "Closing virtual port");
    }

    /// Throw this endpoint away and build a fresh one at the same path.
    pub fn recreate(self) -> Result<Self, Error> {
        let path = self.path.clone();
        self.destroy();

        info!(?path, "Recreating virtual port");
        Self::create(path)
    }

    /// Where clients find this endpoint.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The device node the published path points at.
    pub fn peer(&self) -> &Path {
        &self.peer
    }

    /// See [`EndpointState`].
    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: EndpointState) {
        self.state = state;
    }

    /// Whether the endpoint may be used.
    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    /// Whether no client is attached.
    pub fn is_idle(&self) -> bool {
        self.state == EndpointState::Idle
    }

    /// Read whatever the client has written, without waiting.
    /// `Ok(0)` means the client closed its side.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Failure> {
        self.controller.read(buf)
    }

    /// Write all of `data` towards the client, without waiting.
    ///
    /// Stops at the first failure; anything not yet written is dropped.
    pub fn write_all(&self, data: &[u8]) -> Result<(), Failure> {
        let mut written = 0;

        while written < data.len() {
            match self.controller.write(&data[written..]) {
                Ok(0) => return Err(Failure::WouldBlock),
                Ok(n) => written += n,
                Err(Failure::Interrupted) => continue,
                Err(failure) => {
                    if written > 0 {
                        debug!(
                            path = ?self.path,
                            dropped = data.len() - written,
                            "Partial write to virtual port"
                        );
                    }
                    return Err(failure);
                }
            }
        }

        Ok(())
    }
}

impl AsRawFd for VirtualEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.controller.as_raw_fd()
    }
}
