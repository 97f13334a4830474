//! Pseudo-terminal plumbing.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    pty::openpty,
    sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg},
    unistd,
};

use crate::error::Error;

/// How a failed read or write on a controller should be treated.
///
/// This is the only place raw error codes are looked at,
/// everything else matches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Nothing to read, or no room to write, right now.
    WouldBlock,

    /// A signal arrived mid-call.
    Interrupted,

    /// Nobody has the peer side open.
    PeerGone,

    /// Anything else. The endpoint is broken.
    Fatal(Errno),
}

impl From<Errno> for Failure {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EAGAIN | Errno::EBUSY => Failure::WouldBlock,
            Errno::EINTR => Failure::Interrupted,
            Errno::EIO => Failure::PeerGone,
            other => Failure::Fatal(other),
        }
    }
}

/// The controller side of a pseudo-terminal.
/// Closed when dropped.
#[derive(Debug)]
pub(crate) struct Controller(OwnedFd);

impl Controller {
    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize, Failure> {
        unistd::read(self.0.as_raw_fd(), buf).map_err(Failure::from)
    }

    pub(crate) fn write(&self, data: &[u8]) -> Result<usize, Failure> {
        unistd::write(self.0.as_raw_fd(), data).map_err(Failure::from)
    }
}

impl AsRawFd for Controller {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// A freshly allocated pair where only the controller side is still open.
#[derive(Debug)]
pub(crate) struct Pty {
    pub(crate) controller: Controller,

    /// Device node of the peer side, e.g. `/dev/pts/4`.
    pub(crate) peer: PathBuf,
}

/// Put a terminal into raw mode: no echo, no line editing, no translation.
pub fn make_raw(fd: RawFd) -> Result<(), Error> {
    let mut termios = tcgetattr(fd).map_err(Error::pty("read terminal attributes"))?;
    cfmakeraw(&mut termios);
    tcsetattr(fd, SetArg::TCSANOW, &termios).map_err(Error::pty("set raw mode"))
}

/// Make reads and writes on `fd` return instead of waiting.
pub fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(Error::pty("read descriptor flags"))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;

    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map(drop)
        .map_err(Error::pty("set non-blocking mode"))
}

/// Allocate a raw, non-blocking pair.
///
/// Our own descriptor for the peer side is closed before returning.
/// If it stayed open the kernel would never report a hangup
/// when a client closes the peer.
pub(crate) fn open() -> Result<Pty, Error> {
    let pair = openpty(None, None).map_err(Error::pty("allocate a pseudo-terminal pair"))?;

    // SAFETY: Both descriptors were just opened by `openpty` and are owned by nobody else.
    let (controller, peer) = unsafe {
        (
            OwnedFd::from_raw_fd(pair.master),
            OwnedFd::from_raw_fd(pair.slave),
        )
    };

    make_raw(controller.as_raw_fd())?;
    make_raw(peer.as_raw_fd())?;

    let peer_name =
        unistd::ttyname(peer.as_raw_fd()).map_err(Error::pty("look up the peer device name"))?;

    drop(peer);

    set_nonblocking(controller.as_raw_fd())?;

    Ok(Pty {
        controller: Controller(controller),
        peer: peer_name,
    })
}
