//! TCP/Unix accept loops and UDP receive loops.
//!
//! A listener binds at [`TcpListenerTask::schedule`] time, so bind failures
//! are reported synchronously.  After that every problem (a failed `accept`,
//! a receive error) goes to `on_error` and the listener keeps running.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use mio::net::{TcpListener, TcpStream, UdpSocket, UnixListener, UnixStream};
use mio::Interest;

use crate::scheduler::{Readiness, Scheduler};
use crate::socket::{interrupted, resolve_listen, would_block, Endpoint, SocketError};

/// Largest datagram a [`UdpListenerTask`] will receive in one call.
const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Accepted connections
// ---------------------------------------------------------------------------

/// A connection produced by [`TcpListenerTask`]; already non-blocking.
#[derive(Debug)]
pub enum AcceptedStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AcceptedStream {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self {
            Self::Tcp(s) => (&*s).read(buf),
            Self::Unix(s) => (&*s).read(buf),
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        match self {
            Self::Tcp(s) => (&*s).write(buf),
            Self::Unix(s) => (&*s).write(buf),
        }
    }
}

#[derive(Debug)]
pub struct Accepted {
    pub stream: AcceptedStream,
    /// `None` for Unix-domain peers.
    pub peer: Option<SocketAddr>,
}

enum ListenSocket {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl ListenSocket {
    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(l) => l.as_raw_fd(),
            Self::Unix(l, _) => l.as_raw_fd(),
        }
    }

    fn accept(&self) -> io::Result<Accepted> {
        match self {
            Self::Tcp(l) => {
                let (stream, peer) = l.accept()?;
                Ok(Accepted {
                    stream: AcceptedStream::Tcp(stream),
                    peer: Some(peer),
                })
            }
            Self::Unix(l, _) => {
                let (stream, _) = l.accept()?;
                Ok(Accepted {
                    stream: AcceptedStream::Unix(stream),
                    peer: None,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TcpListenerTask
// ---------------------------------------------------------------------------

type AcceptCallback = Rc<RefCell<dyn FnMut(&TcpListenerTask, Accepted)>>;
type TcpErrorCallback = Rc<RefCell<dyn FnMut(&TcpListenerTask, &io::Error)>>;

struct TcpListenerInner {
    endpoint: Endpoint,
    socket: Option<ListenSocket>,
    scheduler: Option<Scheduler>,
    on_accept: Option<AcceptCallback>,
    on_error: Option<TcpErrorCallback>,
    accepted: u64,
}

/// Stream-socket accept loop (TCP or Unix-domain).
#[derive(Clone)]
pub struct TcpListenerTask {
    inner: Rc<RefCell<TcpListenerInner>>,
}

impl TcpListenerTask {
    /// Listen on `host:port`; an empty host binds every interface, port 0
    /// picks an ephemeral port.
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Self::new(Endpoint::inet(host, port))
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(Endpoint::Unix(path.into()))
    }

    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TcpListenerInner {
                endpoint,
                socket: None,
                scheduler: None,
                on_accept: None,
                on_error: None,
                accepted: 0,
            })),
        }
    }

    pub fn on_accept<F>(&self, callback: F)
    where
        F: FnMut(&TcpListenerTask, Accepted) + 'static,
    {
        self.inner.borrow_mut().on_accept = Some(Rc::new(RefCell::new(callback)));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: FnMut(&TcpListenerTask, &io::Error) + 'static,
    {
        self.inner.borrow_mut().on_error = Some(Rc::new(RefCell::new(callback)));
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.borrow().endpoint.clone()
    }

    /// Port the OS actually bound; `None` before scheduling or for Unix sockets.
    pub fn actual_port(&self) -> Option<u16> {
        match &self.inner.borrow().socket {
            Some(ListenSocket::Tcp(l)) => l.local_addr().ok().map(|a| a.port()),
            _ => None,
        }
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> u64 {
        self.inner.borrow().accepted
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.borrow().scheduler.is_some()
    }

    /// Bind, listen and start accepting.
    pub fn schedule(&self, scheduler: &Scheduler) -> Result<(), SocketError> {
        if self.is_scheduled() {
            return Err(SocketError::AlreadyScheduled);
        }

        let endpoint = self.endpoint();
        let socket = match &endpoint {
            Endpoint::Inet { host, port } => {
                let addr = resolve_listen(host, *port)?;
                ListenSocket::Tcp(TcpListener::bind(addr)?)
            }
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                ListenSocket::Unix(UnixListener::bind(path)?, path.clone())
            }
        };

        let fd = socket.raw_fd();
        let weak = Rc::downgrade(&self.inner);
        scheduler.add_fd(fd, Interest::READABLE, move |_, readiness| {
            if let Some(task) = upgrade_tcp(&weak) {
                task.handle_readiness(readiness);
            }
        })?;

        {
            let mut inner = self.inner.borrow_mut();
            inner.socket = Some(socket);
            inner.scheduler = Some(scheduler.clone());
        }
        match self.actual_port() {
            Some(port) => log::info!("[listener] listening on {endpoint} (port {port})"),
            None => log::info!("[listener] listening on {endpoint}"),
        }
        Ok(())
    }

    /// Stop accepting and close the listening socket.
    pub fn cancel(&self) {
        let (scheduler, socket) = {
            let mut inner = self.inner.borrow_mut();
            (inner.scheduler.take(), inner.socket.take())
        };
        if let (Some(scheduler), Some(socket)) = (scheduler, socket) {
            let _ = scheduler.remove_fd(socket.raw_fd());
            if let ListenSocket::Unix(_, path) = &socket {
                let _ = std::fs::remove_file(path);
            }
            log::debug!("[listener] cancelled {}", self.endpoint());
        }
    }

    fn handle_readiness(&self, readiness: Readiness) {
        if readiness.error {
            let err = io::Error::other("listener socket reported an error");
            self.fire_error(&err);
        }

        // Edge-triggered: keep accepting until the backlog is empty.
        loop {
            let result = match &self.inner.borrow().socket {
                Some(socket) => socket.accept(),
                None => return,
            };
            match result {
                Ok(accepted) => {
                    log::debug!(
                        "[listener] accepted fd={} from {:?}",
                        accepted.stream.raw_fd(),
                        accepted.peer
                    );
                    let callback = {
                        let mut inner = self.inner.borrow_mut();
                        inner.accepted += 1;
                        inner.on_accept.clone()
                    };
                    match callback {
                        Some(cb) => (cb.borrow_mut())(self, accepted),
                        None => log::warn!("[listener] no on_accept handler, dropping connection"),
                    }
                }
                Err(e) if would_block(&e) => break,
                Err(e) if interrupted(&e) => continue,
                Err(e) => {
                    log::warn!("[listener] accept failed: {e}");
                    self.fire_error(&e);
                    break;
                }
            }
        }
    }

    fn fire_error(&self, err: &io::Error) {
        let callback = self.inner.borrow().on_error.clone();
        if let Some(cb) = callback {
            (cb.borrow_mut())(self, err);
        }
    }
}

fn upgrade_tcp(weak: &Weak<RefCell<TcpListenerInner>>) -> Option<TcpListenerTask> {
    weak.upgrade().map(|inner| TcpListenerTask { inner })
}

impl Drop for TcpListenerInner {
    fn drop(&mut self) {
        if let (Some(scheduler), Some(socket)) = (self.scheduler.take(), self.socket.take()) {
            let _ = scheduler.remove_fd(socket.raw_fd());
            if let ListenSocket::Unix(_, path) = &socket {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UdpListenerTask
// ---------------------------------------------------------------------------

type DatagramCallback = Rc<RefCell<dyn FnMut(&UdpListenerTask, &[u8], SocketAddr)>>;
type UdpErrorCallback = Rc<RefCell<dyn FnMut(&UdpListenerTask, &io::Error)>>;

struct UdpListenerInner {
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
    scheduler: Option<Scheduler>,
    on_read: Option<DatagramCallback>,
    on_error: Option<UdpErrorCallback>,
}

/// Bound UDP socket that reports every datagram with its sender.
#[derive(Clone)]
pub struct UdpListenerTask {
    inner: Rc<RefCell<UdpListenerInner>>,
}

impl UdpListenerTask {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            inner: Rc::new(RefCell::new(UdpListenerInner {
                host: host.into(),
                port,
                socket: None,
                scheduler: None,
                on_read: None,
                on_error: None,
            })),
        }
    }

    pub fn on_read<F>(&self, callback: F)
    where
        F: FnMut(&UdpListenerTask, &[u8], SocketAddr) + 'static,
    {
        self.inner.borrow_mut().on_read = Some(Rc::new(RefCell::new(callback)));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: FnMut(&UdpListenerTask, &io::Error) + 'static,
    {
        self.inner.borrow_mut().on_error = Some(Rc::new(RefCell::new(callback)));
    }

    pub fn actual_port(&self) -> Option<u16> {
        self.inner
            .borrow()
            .socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.borrow().scheduler.is_some()
    }

    pub fn schedule(&self, scheduler: &Scheduler) -> Result<(), SocketError> {
        if self.is_scheduled() {
            return Err(SocketError::AlreadyScheduled);
        }

        let addr = {
            let inner = self.inner.borrow();
            resolve_listen(&inner.host, inner.port)?
        };
        let socket = UdpSocket::bind(addr)?;
        let fd = socket.as_raw_fd();

        let weak = Rc::downgrade(&self.inner);
        scheduler.add_fd(fd, Interest::READABLE, move |_, readiness| {
            if let Some(inner) = weak.upgrade() {
                UdpListenerTask { inner }.handle_readiness(readiness);
            }
        })?;

        let mut inner = self.inner.borrow_mut();
        inner.socket = Some(socket);
        inner.scheduler = Some(scheduler.clone());
        log::info!("[listener] udp bound to {addr}");
        Ok(())
    }

    pub fn cancel(&self) {
        let (scheduler, socket) = {
            let mut inner = self.inner.borrow_mut();
            (inner.scheduler.take(), inner.socket.take())
        };
        if let (Some(scheduler), Some(socket)) = (scheduler, socket) {
            let _ = scheduler.remove_fd(socket.as_raw_fd());
            log::debug!("[listener] udp cancelled");
        }
    }

    pub fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        match &self.inner.borrow().socket {
            Some(socket) => socket.send_to(data, target),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn handle_readiness(&self, readiness: Readiness) {
        if readiness.error {
            let err = io::Error::other("udp socket reported an error");
            self.fire_error(&err);
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let result = match &self.inner.borrow().socket {
                Some(socket) => socket.recv_from(&mut buf),
                None => return,
            };
            match result {
                Ok((n, from)) => {
                    let callback = self.inner.borrow().on_read.clone();
                    if let Some(cb) = callback {
                        (cb.borrow_mut())(self, &buf[..n], from);
                    }
                }
                Err(e) if would_block(&e) => break,
                Err(e) if interrupted(&e) => continue,
                Err(e) => {
                    log::warn!("[listener] udp receive failed: {e}");
                    self.fire_error(&e);
                    break;
                }
            }
        }
    }

    fn fire_error(&self, err: &io::Error) {
        let callback = self.inner.borrow().on_error.clone();
        if let Some(cb) = callback {
            (cb.borrow_mut())(self, err);
        }
    }
}

impl Drop for UdpListenerInner {
    fn drop(&mut self) {
        if let (Some(scheduler), Some(socket)) = (self.scheduler.take(), self.socket.take()) {
            let _ = scheduler.remove_fd(socket.as_raw_fd());
        }
    }
}
