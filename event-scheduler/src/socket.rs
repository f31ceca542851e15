//! Socket plumbing shared by [`crate::listener`] and [`crate::connect`].
//!
//! [`Endpoint`] names either an internet host/port or a Unix-domain path, and
//! the helpers here turn it into something `mio` can bind or connect.  All
//! sockets created through this module are non-blocking.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use thiserror::Error;

use crate::scheduler::SchedulerError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from binding, listening, resolving and connecting.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("fcntl failed: {0}")]
    Fcntl(#[from] nix::Error),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("task is already scheduled")]
    AlreadyScheduled,
    #[error("task is not scheduled")]
    NotScheduled,
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Where to listen or connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Inet { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Self::Inet {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::Unix(path.as_ref().to_path_buf())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inet { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Resolve `host:port` and keep only the first address, like `getaddrinfo`
/// callers that take `res->ai_addr` and move on.
pub fn resolve_first(host: &str, port: u16) -> Result<SocketAddr, SocketError> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .next()
        .ok_or_else(|| SocketError::NoAddress(format!("{host}:{port}")))
}

/// Resolve a listen address; an empty host means every interface.
pub fn resolve_listen(host: &str, port: u16) -> Result<SocketAddr, SocketError> {
    if host.is_empty() {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    resolve_first(host, port)
}

/// Put an arbitrary fd into non-blocking mode (no-op if it already is).
pub fn set_nonblocking(fd: RawFd) -> Result<(), SocketError> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        log::trace!("[socket] fd={fd} set O_NONBLOCK");
    }
    Ok(())
}

pub(crate) fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn interrupted(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Interrupted
}
