//! Outbound TCP / Unix-domain connector with optional fixed-delay reconnect.
//!
//! ```text
//!  schedule() ──▶ connect() ──▶ Connecting ──writable + SO_ERROR == 0──▶ Connected
//!                    │              │                                      │
//!                    │ immediate    │ SO_ERROR / hangup          EOF / error
//!                    ▼              ▼                                      ▼
//!                Connected        Error ◀──────────────────────────── Disconnected
//!                                   │                                      │
//!                                   └──── reconnect_delay (if enabled) ────┴──▶ connect()
//! ```
//!
//! The task owns its socket between attempts only; every reconnect creates a
//! fresh socket and a fresh scheduler registration.  The delay is fixed and
//! can be changed at runtime with [`ConnectTask::set_reconnect_delay`].

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::net::{TcpStream, UnixStream};
use mio::Interest;

use crate::scheduler::{Readiness, Scheduler};
use crate::socket::{resolve_first, would_block, Endpoint, SocketError};
use crate::state::StreamState;
use crate::timer::TimerId;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Reconnect behaviour of a [`ConnectTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectConfig {
    pub reconnect: bool,
    pub reconnect_delay: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            reconnect: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Connection {
    fn open(endpoint: &Endpoint) -> Result<Self, SocketError> {
        match endpoint {
            Endpoint::Inet { host, port } => {
                let addr = resolve_first(host, *port)?;
                log::debug!("[connect] {host}:{port} resolved to {addr}");
                Ok(Self::Tcp(TcpStream::connect(addr)?))
            }
            Endpoint::Unix(path) => Ok(Self::Unix(UnixStream::connect(path)?)),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Self::Tcp(s) => s.take_error(),
            Self::Unix(s) => s.take_error(),
        }
    }

    /// `getpeername` succeeds only once the handshake has completed.
    fn is_established(&self) -> bool {
        match self {
            Self::Tcp(s) => s.peer_addr().is_ok(),
            Self::Unix(s) => s.peer_addr().is_ok(),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(s) => s.peer_addr().ok(),
            Self::Unix(_) => None,
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self {
            Self::Tcp(s) => (&*s).read(buf),
            Self::Unix(s) => (&*s).read(buf),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        match self {
            Self::Tcp(s) => (&*s).write(buf),
            Self::Unix(s) => (&*s).write(buf),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectTask
// ---------------------------------------------------------------------------

type TaskCallback = Rc<RefCell<dyn FnMut(&ConnectTask)>>;
type ErrorCallback = Rc<RefCell<dyn FnMut(&ConnectTask, &io::Error)>>;

#[derive(Default)]
struct Callbacks {
    on_connected: Option<TaskCallback>,
    on_disconnected: Option<TaskCallback>,
    on_error: Option<ErrorCallback>,
    on_read: Option<TaskCallback>,
    on_write: Option<TaskCallback>,
}

struct ConnectInner {
    endpoint: Endpoint,
    state: StreamState,
    config: ConnectConfig,
    connection: Option<Connection>,
    scheduler: Option<Scheduler>,
    reconnect_timer: Option<TimerId>,
    write_interest: bool,
    disconnect_pending: bool,
    attempts: u64,
    callbacks: Callbacks,
}

/// Non-blocking outbound connector; see the module docs for the state machine.
#[derive(Clone)]
pub struct ConnectTask {
    inner: Rc<RefCell<ConnectInner>>,
}

impl ConnectTask {
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Self::new(Endpoint::inet(host, port), ConnectConfig::default())
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(Endpoint::Unix(path.into()), ConnectConfig::default())
    }

    pub fn new(endpoint: Endpoint, config: ConnectConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ConnectInner {
                endpoint,
                state: StreamState::Unscheduled,
                config,
                connection: None,
                scheduler: None,
                reconnect_timer: None,
                write_interest: false,
                disconnect_pending: false,
                attempts: 0,
                callbacks: Callbacks::default(),
            })),
        }
    }

    // -----------------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------------

    pub fn on_connected<F: FnMut(&ConnectTask) + 'static>(&self, callback: F) {
        self.inner.borrow_mut().callbacks.on_connected = Some(Rc::new(RefCell::new(callback)));
    }

    pub fn on_disconnected<F: FnMut(&ConnectTask) + 'static>(&self, callback: F) {
        self.inner.borrow_mut().callbacks.on_disconnected = Some(Rc::new(RefCell::new(callback)));
    }

    /// Called when an attempt fails before the connection was established.
    pub fn on_error<F: FnMut(&ConnectTask, &io::Error) + 'static>(&self, callback: F) {
        self.inner.borrow_mut().callbacks.on_error = Some(Rc::new(RefCell::new(callback)));
    }

    pub fn on_read<F: FnMut(&ConnectTask) + 'static>(&self, callback: F) {
        self.inner.borrow_mut().callbacks.on_read = Some(Rc::new(RefCell::new(callback)));
    }

    pub fn on_write<F: FnMut(&ConnectTask) + 'static>(&self, callback: F) {
        self.inner.borrow_mut().callbacks.on_write = Some(Rc::new(RefCell::new(callback)));
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> StreamState {
        self.inner.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == StreamState::Connected
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.borrow().endpoint.clone()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.borrow().connection.as_ref().map(Connection::raw_fd)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner
            .borrow()
            .connection
            .as_ref()
            .and_then(Connection::peer_addr)
    }

    /// Connection attempts made so far, including the first.
    pub fn attempts(&self) -> u64 {
        self.inner.borrow().attempts
    }

    pub fn should_reconnect(&self) -> bool {
        self.inner.borrow().config.reconnect
    }

    pub fn set_reconnect(&self, reconnect: bool) {
        self.inner.borrow_mut().config.reconnect = reconnect;
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.inner.borrow().config.reconnect_delay
    }

    /// Applies to the next retry that gets armed.
    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.inner.borrow_mut().config.reconnect_delay = delay;
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.inner.borrow().reconnect_timer.is_some()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the first connection attempt.
    ///
    /// A synchronous failure is returned only when reconnect is disabled;
    /// otherwise it arms the retry timer and reports success.
    pub fn schedule(&self, scheduler: &Scheduler) -> Result<(), SocketError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.scheduler.is_some() {
                return Err(SocketError::AlreadyScheduled);
            }
            inner.scheduler = Some(scheduler.clone());
        }

        match self.connect() {
            Ok(()) => Ok(()),
            Err(e) if self.should_reconnect() => {
                log::warn!("[connect] {} failed: {e}", self.endpoint());
                self.inner.borrow_mut().state = StreamState::Error;
                self.fire_error(&io::Error::other(e.to_string()));
                self.arm_reconnect();
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.borrow_mut();
                inner.scheduler = None;
                inner.state = StreamState::Error;
                Err(e)
            }
        }
    }

    /// Drop the connection and any pending retry.
    pub fn cancel(&self) {
        let scheduler = {
            let mut inner = self.inner.borrow_mut();
            inner.state = StreamState::Disconnected;
            inner.scheduler.take()
        };
        let Some(scheduler) = scheduler else {
            return;
        };
        self.release(&scheduler);
        if let Some(timer) = self.inner.borrow_mut().reconnect_timer.take() {
            scheduler.cancel_timer(timer);
        }
        log::debug!("[connect] cancelled {}", self.endpoint());
    }

    // -----------------------------------------------------------------------
    // I/O
    // -----------------------------------------------------------------------

    /// Read from the connection.  EOF and hard errors schedule the
    /// disconnect transition; `WouldBlock` is returned as-is.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let result = match &self.inner.borrow().connection {
            Some(conn) => conn.read(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };
        match &result {
            Ok(0) => {
                log::debug!("[connect] {} closed by peer", self.endpoint());
                self.schedule_disconnect();
            }
            Err(e) if !would_block(e) && e.kind() != io::ErrorKind::NotConnected => {
                log::warn!("[connect] {} read failed: {e}", self.endpoint());
                self.schedule_disconnect();
            }
            _ => {}
        }
        result
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let result = match &self.inner.borrow().connection {
            Some(conn) if self.is_connected() => conn.write(buf),
            _ => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };
        if let Err(e) = &result {
            if !would_block(e) && e.kind() != io::ErrorKind::NotConnected {
                log::warn!("[connect] {} write failed: {e}", self.endpoint());
                self.schedule_disconnect();
            }
        }
        result
    }

    /// Ask for (or stop asking for) write readiness while connected.
    pub fn set_write_interest(&self, enabled: bool) {
        let (scheduler, fd, connected) = {
            let mut inner = self.inner.borrow_mut();
            if inner.write_interest == enabled {
                return;
            }
            inner.write_interest = enabled;
            (
                inner.scheduler.clone(),
                inner.connection.as_ref().map(Connection::raw_fd),
                inner.state == StreamState::Connected,
            )
        };
        if let (Some(scheduler), Some(fd), true) = (scheduler, fd, connected) {
            if let Err(e) = scheduler.update_fd(fd, connected_interest(enabled)) {
                log::warn!("[connect] failed to update interest: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn connect(&self) -> Result<(), SocketError> {
        let (endpoint, scheduler) = {
            let mut inner = self.inner.borrow_mut();
            inner.attempts += 1;
            inner.state = StreamState::Connecting;
            inner.disconnect_pending = false;
            let scheduler = inner.scheduler.clone().ok_or(SocketError::NotScheduled)?;
            (inner.endpoint.clone(), scheduler)
        };

        log::debug!("[connect] connecting to {endpoint}");
        let connection = Connection::open(&endpoint)?;
        let fd = connection.raw_fd();

        let weak = Rc::downgrade(&self.inner);
        scheduler.add_fd(fd, Interest::READABLE | Interest::WRITABLE, move |_, readiness| {
            if let Some(task) = upgrade(&weak) {
                task.handle_readiness(readiness);
            }
        })?;

        let established = connection.is_established();
        self.inner.borrow_mut().connection = Some(connection);
        if established {
            self.set_connected();
        }
        Ok(())
    }

    fn set_connected(&self) {
        let (scheduler, fd, write_interest) = {
            let mut inner = self.inner.borrow_mut();
            inner.state = StreamState::Connected;
            (
                inner.scheduler.clone(),
                inner.connection.as_ref().map(Connection::raw_fd),
                inner.write_interest,
            )
        };
        if let (Some(scheduler), Some(fd)) = (scheduler, fd) {
            if let Err(e) = scheduler.update_fd(fd, connected_interest(write_interest)) {
                log::warn!("[connect] failed to update interest: {e}");
            }
        }
        log::info!("[connect] connected to {}", self.endpoint());
        let callback = self.inner.borrow().callbacks.on_connected.clone();
        if let Some(cb) = callback {
            (cb.borrow_mut())(self);
        }
    }

    fn handle_readiness(&self, readiness: Readiness) {
        match self.state() {
            StreamState::Connecting => self.handle_connecting(readiness),
            StreamState::Connected => self.handle_connected(readiness),
            _ => {}
        }
    }

    fn handle_connecting(&self, readiness: Readiness) {
        let status = match &self.inner.borrow().connection {
            Some(conn) => match conn.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => Ok(conn.is_established()),
            },
            None => return,
        };

        match status {
            Ok(true) => {
                self.set_connected();
                if readiness.readable && self.is_connected() {
                    self.fire(|c| c.on_read.clone());
                }
            }
            Ok(false) if readiness.is_failure() => {
                self.fail_connect(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            Ok(false) => {}
            Err(e) => self.fail_connect(e),
        }
    }

    fn handle_connected(&self, readiness: Readiness) {
        if readiness.error {
            let err = match &self.inner.borrow().connection {
                Some(conn) => conn.take_error().ok().flatten(),
                None => None,
            };
            if let Some(err) = err {
                log::warn!("[connect] {} socket error: {err}", self.endpoint());
            }
            self.disconnect();
            return;
        }

        let has_reader = self.inner.borrow().callbacks.on_read.is_some();
        if readiness.readable || readiness.read_closed {
            if has_reader {
                self.fire(|c| c.on_read.clone());
            } else if readiness.read_closed {
                self.disconnect();
                return;
            }
        }
        if readiness.writable && self.is_connected() {
            self.fire(|c| c.on_write.clone());
        }
    }

    fn fail_connect(&self, err: io::Error) {
        log::warn!("[connect] {} failed: {err}", self.endpoint());
        let scheduler = self.inner.borrow().scheduler.clone();
        if let Some(scheduler) = &scheduler {
            self.release(scheduler);
        }
        self.inner.borrow_mut().state = StreamState::Error;
        self.fire_error(&err);
        self.arm_reconnect();
    }

    fn schedule_disconnect(&self) {
        let scheduler = {
            let mut inner = self.inner.borrow_mut();
            if inner.disconnect_pending {
                return;
            }
            inner.disconnect_pending = true;
            inner.scheduler.clone()
        };
        if let Some(scheduler) = scheduler {
            let weak = Rc::downgrade(&self.inner);
            scheduler.defer(move |_| {
                if let Some(task) = upgrade(&weak) {
                    if task.inner.borrow().disconnect_pending {
                        task.disconnect();
                    }
                }
            });
        }
    }

    fn disconnect(&self) {
        let scheduler = {
            let mut inner = self.inner.borrow_mut();
            inner.disconnect_pending = false;
            if inner.state != StreamState::Connected {
                return;
            }
            inner.state = StreamState::Disconnected;
            inner.scheduler.clone()
        };
        if let Some(scheduler) = &scheduler {
            self.release(scheduler);
        }
        log::info!("[connect] disconnected from {}", self.endpoint());
        self.fire(|c| c.on_disconnected.clone());
        self.arm_reconnect();
    }

    fn release(&self, scheduler: &Scheduler) {
        let connection = self.inner.borrow_mut().connection.take();
        if let Some(connection) = connection {
            let _ = scheduler.remove_fd(connection.raw_fd());
        }
    }

    fn arm_reconnect(&self) {
        let (scheduler, delay) = {
            let inner = self.inner.borrow();
            if !inner.config.reconnect || inner.reconnect_timer.is_some() {
                return;
            }
            match &inner.scheduler {
                Some(s) => (s.clone(), inner.config.reconnect_delay),
                None => return,
            }
        };
        log::info!("[connect] reconnecting to {} in {delay:?}", self.endpoint());
        let weak = Rc::downgrade(&self.inner);
        let timer = scheduler.add_timer(delay, move |_| {
            if let Some(task) = upgrade(&weak) {
                task.reconnect();
            }
        });
        self.inner.borrow_mut().reconnect_timer = Some(timer);
    }

    fn reconnect(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.reconnect_timer = None;
            if inner.scheduler.is_none() {
                return;
            }
        }
        if let Err(e) = self.connect() {
            self.inner.borrow_mut().state = StreamState::Error;
            self.fire_error(&io::Error::other(e.to_string()));
            self.arm_reconnect();
        }
    }

    fn fire<S>(&self, select: S)
    where
        S: FnOnce(&Callbacks) -> Option<TaskCallback>,
    {
        let callback = select(&self.inner.borrow().callbacks);
        if let Some(cb) = callback {
            match cb.try_borrow_mut() {
                Ok(mut cb) => cb(self),
                Err(_) => log::warn!("[connect] callback re-entered"),
            }
        }
    }

    fn fire_error(&self, err: &io::Error) {
        let callback = self.inner.borrow().callbacks.on_error.clone();
        if let Some(cb) = callback {
            (cb.borrow_mut())(self, err);
        }
    }
}

fn connected_interest(write: bool) -> Interest {
    if write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

fn upgrade(weak: &Weak<RefCell<ConnectInner>>) -> Option<ConnectTask> {
    weak.upgrade().map(|inner| ConnectTask { inner })
}

impl Drop for ConnectInner {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            if let Some(connection) = self.connection.take() {
                let _ = scheduler.remove_fd(connection.raw_fd());
            }
            if let Some(timer) = self.reconnect_timer.take() {
                scheduler.cancel_timer(timer);
            }
        }
    }
}
