//! Bidirectional byte streams over every transport the scheduler drives.
//!
//! A [`Stream`] hides the backend (pipe or other fd, stdio, TCP client or
//! server, UDP client or server, serial line, PTY, file) behind one
//! interface:
//!
//! ```text
//!            OS ──read──▶ read buffer ──(≥ min_bytes | timeout)──▶ observers 1..N
//!                                                                 (registration order)
//!   write() ──direct──▶ OS
//!       └── leftover ──▶ write queue (bounded) ──write-ready──▶ OS
//! ```
//!
//! Reads are buffered until `min_bytes` are available or the flush timeout
//! (armed at the first unflushed byte) expires.  Writes go straight to the
//! OS while nothing is queued; whatever the OS refuses is queued and drained
//! on write readiness.  Queued bytes are dropped on cancel.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::Interest;
use thiserror::Error;

use crate::connect::{ConnectConfig, ConnectTask};
use crate::file::FileConfig;
use crate::listener::{Accepted, AcceptedStream, TcpListenerTask, UdpListenerTask};
use crate::periodic::PeriodicTask;
use crate::pty::{self, Pty, PtyConfig, PtyDevice};
use crate::scheduler::{Readiness, Scheduler, SchedulerError};
use crate::serial::{self, SerialConfig, SerialError};
use crate::socket::{interrupted, resolve_first, set_nonblocking, would_block, Endpoint, SocketError};
use crate::state::StreamState;
use crate::timer::TimerId;

pub const DEFAULT_WRITE_CAPACITY: usize = 4 * 1024 * 1024;

const READ_CHUNK: usize = 4096;
const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StreamError {
    /// Write on a stream that is not (or no longer) connected.
    #[error("stream is not connected")]
    NotConnected,
    /// `schedule` called twice.
    #[error("stream is already scheduled")]
    AlreadyScheduled,
    /// The bytes the OS refused do not fit in the bounded write queue.
    #[error("write queue full: {pending} bytes pending, {requested} requested, capacity {capacity}")]
    WriteQueueFull {
        pending: usize,
        requested: usize,
        capacity: usize,
    },
    /// UDP server write before any client has sent a datagram.
    #[error("no datagram received yet, nowhere to send")]
    NoPeer,
    /// Underlying read or write error from the OS.
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),
    /// Resolving, binding or connecting a socket failed.
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// Registering with the scheduler failed.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    /// Opening or configuring a serial line or PTY failed.
    #[error(transparent)]
    Serial(#[from] SerialError),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// When buffered input is handed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadConfig {
    /// Deliver as soon as this many bytes are buffered.
    pub min_bytes: usize,
    /// Deliver whatever is buffered this long after the first unflushed byte.
    pub timeout: Option<Duration>,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            min_bytes: 1,
            timeout: None,
        }
    }
}

impl ReadConfig {
    pub fn buffered(min_bytes: usize, timeout: Option<Duration>) -> Self {
        Self {
            min_bytes: min_bytes.max(1),
            timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteConfig {
    /// Upper bound on queued, not yet written bytes (per client for servers).
    pub capacity: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_WRITE_CAPACITY,
        }
    }
}

/// An existing descriptor (pipe end, socket, tty, ...).
#[derive(Debug)]
pub struct FdConfig {
    pub fd: RawFd,
    /// Close `fd` when the stream is cancelled or dropped.
    pub owns_fd: bool,
}

impl FdConfig {
    /// Use `fd` without taking ownership; it must outlive the stream.
    pub fn borrowed(fd: RawFd) -> Self {
        Self { fd, owns_fd: false }
    }

    pub fn owned(fd: impl Into<OwnedFd>) -> Self {
        Self {
            fd: fd.into().into_raw_fd(),
            owns_fd: true,
        }
    }
}

/// The process's own stdin, with output to stdout or stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StdioConfig {
    pub use_stderr: bool,
    /// Leave stdin alone; the stream only writes.
    pub output_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpClientConfig {
    pub endpoint: Endpoint,
    pub connect: ConnectConfig,
}

impl TcpClientConfig {
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::inet(host, port),
            connect: ConnectConfig::default(),
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: Endpoint::Unix(path.into()),
            connect: ConnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, delay: Duration) -> Self {
        self.connect = ConnectConfig {
            reconnect: true,
            reconnect_delay: delay,
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpServerConfig {
    pub endpoint: Endpoint,
}

impl TcpServerConfig {
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::inet(host, port),
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: Endpoint::Unix(path.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpClientConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpServerConfig {
    /// Empty binds every interface.
    pub host: String,
    pub port: u16,
}

/// Backend selection for [`Stream::new`].
#[derive(Debug)]
pub enum StreamKind {
    Fd(FdConfig),
    Stdio(StdioConfig),
    TcpClient(TcpClientConfig),
    TcpServer(TcpServerConfig),
    UdpClient(UdpClientConfig),
    UdpServer(UdpServerConfig),
    Serial(SerialConfig),
    Pty(PtyConfig),
    File(FileConfig),
}

impl StreamKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fd(_) => "fd",
            Self::Stdio(_) => "stdio",
            Self::TcpClient(_) => "tcp-client",
            Self::TcpServer(_) => "tcp-server",
            Self::UdpClient(_) => "udp-client",
            Self::UdpServer(_) => "udp-server",
            Self::Serial(_) => "serial",
            Self::Pty(_) => "pty",
            Self::File(_) => "file",
        }
    }
}

// ---------------------------------------------------------------------------
// Write queue
// ---------------------------------------------------------------------------

/// Bounded FIFO of bytes waiting for the OS to accept them.
#[derive(Debug)]
pub struct WriteBuffer {
    data: Vec<u8>,
    head: usize,
    capacity: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            head: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Queue `bytes` in full, or nothing at all.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        if bytes.len() > self.available() {
            return Err(self.full(bytes.len()));
        }
        if self.head > 0 && self.head >= self.data.len() / 2 {
            self.data.drain(..self.head);
            self.head = 0;
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn peek(&self) -> &[u8] {
        &self.data[self.head..]
    }

    pub fn consume(&mut self, n: usize) {
        self.head = (self.head + n).min(self.data.len());
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Hand queued bytes to `write` until it pushes back.
    ///
    /// Returns `Ok(true)` once the queue is empty, `Ok(false)` if bytes
    /// remain because the sink would block.
    pub fn drain_into<W>(&mut self, mut write: W) -> io::Result<bool>
    where
        W: FnMut(&[u8]) -> io::Result<usize>,
    {
        while !self.is_empty() {
            match write(self.peek()) {
                Ok(0) => return Ok(false),
                Ok(n) => self.consume(n),
                Err(e) if would_block(&e) => return Ok(false),
                Err(e) if interrupted(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Write `data` directly when nothing is queued and queue the rest.
    ///
    /// Returns `Ok(true)` when bytes were queued and write readiness is
    /// needed.  Nothing is written if `data` could not be queued in full.
    pub fn write_or_queue<W>(&mut self, data: &[u8], mut write: W) -> Result<bool, StreamError>
    where
        W: FnMut(&[u8]) -> io::Result<usize>,
    {
        if data.len() > self.available() {
            return Err(self.full(data.len()));
        }
        let mut written = 0;
        if self.is_empty() {
            while written < data.len() {
                match write(&data[written..]) {
                    Ok(0) => break,
                    Ok(n) => written += n,
                    Err(e) if would_block(&e) => break,
                    Err(e) if interrupted(&e) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if written == data.len() {
            return Ok(false);
        }
        self.push(&data[written..])?;
        Ok(true)
    }

    fn full(&self, requested: usize) -> StreamError {
        StreamError::WriteQueueFull {
            pending: self.len(),
            requested,
            capacity: self.capacity,
        }
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Plain descriptor I/O: fds, serial devices and PTY masters.
struct FdBackend {
    fd: RawFd,
    file: Option<File>,
    owns: bool,
    queue: WriteBuffer,
    write_interest: bool,
    pty: Option<PtyDevice>,
}

impl FdBackend {
    fn new(file: File, owns: bool, pty: Option<PtyDevice>, capacity: usize) -> Self {
        Self {
            fd: file.as_raw_fd(),
            file: Some(file),
            owns,
            queue: WriteBuffer::new(capacity),
            write_interest: false,
            pty,
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.file {
            Some(file) => (&*file).read(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn write_or_queue(&mut self, data: &[u8]) -> Result<bool, StreamError> {
        let Some(file) = &self.file else {
            return Err(StreamError::NotConnected);
        };
        self.queue.write_or_queue(data, |chunk| (&*file).write(chunk))
    }

    fn flush(&mut self) -> io::Result<bool> {
        let Some(file) = &self.file else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        self.queue.drain_into(|chunk| (&*file).write(chunk))
    }
}

impl Drop for FdBackend {
    fn drop(&mut self) {
        if !self.owns {
            if let Some(file) = self.file.take() {
                let _ = file.into_raw_fd();
            }
        }
    }
}

struct ServerClient {
    id: u64,
    stream: AcceptedStream,
    peer: Option<SocketAddr>,
    queue: WriteBuffer,
    write_interest: bool,
}

enum FileReader {
    Polled,
    Periodic(PeriodicTask),
}

enum Backend {
    Fd(FdBackend),
    /// Reads come from `input`; writes are queued on `output`, whose fd is
    /// only registered while bytes are waiting.
    Stdio {
        input: Option<FdBackend>,
        output: FdBackend,
    },
    TcpClient {
        task: ConnectTask,
        queue: WriteBuffer,
    },
    TcpServer {
        listener: TcpListenerTask,
        clients: Vec<ServerClient>,
        next_client: u64,
    },
    UdpClient {
        socket: UdpSocket,
    },
    UdpServer {
        listener: UdpListenerTask,
        last_sender: Option<SocketAddr>,
    },
    File {
        file: File,
        reader: Option<FileReader>,
    },
}

impl Backend {
    fn pending_writes(&self) -> usize {
        match self {
            Self::Fd(fd) | Self::Stdio { output: fd, .. } => fd.queue.len(),
            Self::TcpClient { queue, .. } => queue.len(),
            Self::TcpServer { clients, .. } => clients.iter().map(|c| c.queue.len()).sum(),
            _ => 0,
        }
    }

    /// Deregister everything and close what the stream owns.
    fn teardown(self, scheduler: &Scheduler) {
        match self {
            Self::Fd(fd) => {
                let _ = scheduler.remove_fd(fd.fd);
                if let Some(device) = &fd.pty {
                    device.unlink();
                }
            }
            Self::Stdio { input, output } => {
                if let Some(input) = input {
                    let _ = scheduler.remove_fd(input.fd);
                }
                if output.write_interest {
                    let _ = scheduler.remove_fd(output.fd);
                }
            }
            Self::TcpClient { task, .. } => task.cancel(),
            Self::TcpServer {
                listener, clients, ..
            } => {
                for client in &clients {
                    let _ = scheduler.remove_fd(client.stream.raw_fd());
                }
                listener.cancel();
            }
            Self::UdpClient { socket } => {
                let _ = scheduler.remove_fd(socket.as_raw_fd());
            }
            Self::UdpServer { listener, .. } => listener.cancel(),
            Self::File { file, reader } => match reader {
                Some(FileReader::Polled) => {
                    let _ = scheduler.remove_fd(file.as_raw_fd());
                }
                Some(FileReader::Periodic(task)) => {
                    task.cancel();
                }
                None => {}
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Identifies one read observer for [`Stream::remove_on_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadHandle(u64);

type ReadCallback = Rc<RefCell<dyn FnMut(&Stream, &[u8])>>;
type ErrorCallback = Rc<RefCell<dyn FnMut(&Stream, &StreamError)>>;
type CompleteCallback = Rc<RefCell<dyn FnMut(&Stream)>>;

struct StreamInner {
    id: String,
    kind: Option<StreamKind>,
    state: StreamState,
    read_config: ReadConfig,
    write_config: WriteConfig,
    scheduler: Option<Scheduler>,
    backend: Option<Backend>,
    read_buffer: Vec<u8>,
    flush_timer: Option<TimerId>,
    observers: Vec<(ReadHandle, ReadCallback)>,
    next_handle: u64,
    on_error: Option<ErrorCallback>,
    on_complete: Option<CompleteCallback>,
    bytes_read: u64,
    bytes_written: u64,
}

/// Handle to a byte stream; clones share the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Rc<RefCell<StreamInner>>,
}

enum WriteOutcome {
    Done,
    NeedWriteInterest,
    Failed(io::Error),
    Clients { interest: Vec<u64>, failed: Vec<u64> },
}

impl Stream {
    pub fn new(id: impl Into<String>, kind: StreamKind, read_config: ReadConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StreamInner {
                id: id.into(),
                kind: Some(kind),
                state: StreamState::Unscheduled,
                read_config,
                write_config: WriteConfig::default(),
                scheduler: None,
                backend: None,
                read_buffer: Vec::new(),
                flush_timer: None,
                observers: Vec::new(),
                next_handle: 1,
                on_error: None,
                on_complete: None,
                bytes_read: 0,
                bytes_written: 0,
            })),
        }
    }

    pub fn fd(id: impl Into<String>, config: FdConfig, read_config: ReadConfig) -> Self {
        Self::new(id, StreamKind::Fd(config), read_config)
    }

    pub fn stdio(id: impl Into<String>, config: StdioConfig, read_config: ReadConfig) -> Self {
        Self::new(id, StreamKind::Stdio(config), read_config)
    }

    pub fn tcp_client(id: impl Into<String>, config: TcpClientConfig, read_config: ReadConfig) -> Self {
        Self::new(id, StreamKind::TcpClient(config), read_config)
    }

    pub fn tcp_server(id: impl Into<String>, config: TcpServerConfig, read_config: ReadConfig) -> Self {
        Self::new(id, StreamKind::TcpServer(config), read_config)
    }

    pub fn udp_client(id: impl Into<String>, config: UdpClientConfig, read_config: ReadConfig) -> Self {
        Self::new(id, StreamKind::UdpClient(config), read_config)
    }

    pub fn udp_server(id: impl Into<String>, config: UdpServerConfig, read_config: ReadConfig) -> Self {
        Self::new(id, StreamKind::UdpServer(config), read_config)
    }

    pub fn serial(id: impl Into<String>, config: SerialConfig, read_config: ReadConfig) -> Self {
        Self::new(id, StreamKind::Serial(config), read_config)
    }

    pub fn pty(id: impl Into<String>, config: PtyConfig, read_config: ReadConfig) -> Self {
        Self::new(id, StreamKind::Pty(config), read_config)
    }

    pub fn file(id: impl Into<String>, config: FileConfig, read_config: ReadConfig) -> Self {
        Self::new(id, StreamKind::File(config), read_config)
    }

    /// Must be called before [`Stream::schedule`] to affect the queues.
    pub fn with_write_config(self, config: WriteConfig) -> Self {
        self.inner.borrow_mut().write_config = config;
        self
    }

    // -----------------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------------

    /// Add a read observer.  Observers see every delivery in the order they
    /// were registered.
    pub fn on_read<F>(&self, callback: F) -> ReadHandle
    where
        F: FnMut(&Stream, &[u8]) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let handle = ReadHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.observers.push((handle, Rc::new(RefCell::new(callback))));
        handle
    }

    /// Remove an observer; a delivery already in progress still reaches it.
    pub fn remove_on_read(&self, handle: ReadHandle) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.observers.len();
        inner.observers.retain(|(h, _)| *h != handle);
        inner.observers.len() != before
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: FnMut(&Stream, &StreamError) + 'static,
    {
        self.inner.borrow_mut().on_error = Some(Rc::new(RefCell::new(callback)));
    }

    /// Called when the stream reaches `Disconnected` (EOF, hangup, peer close).
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnMut(&Stream) + 'static,
    {
        self.inner.borrow_mut().on_complete = Some(Rc::new(RefCell::new(callback)));
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> String {
        self.inner.borrow().id.clone()
    }

    pub fn state(&self) -> StreamState {
        self.inner.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == StreamState::Connected
    }

    pub fn read_config(&self) -> ReadConfig {
        self.inner.borrow().read_config
    }

    /// Bytes accepted by [`Stream::write`] but not yet taken by the OS.
    pub fn pending_writes(&self) -> usize {
        self.inner
            .borrow()
            .backend
            .as_ref()
            .map_or(0, Backend::pending_writes)
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.borrow().bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.borrow().bytes_written
    }

    /// Bound port of a TCP/UDP server (or the local port of a UDP client).
    pub fn actual_port(&self) -> Option<u16> {
        match &self.inner.borrow().backend {
            Some(Backend::TcpServer { listener, .. }) => listener.actual_port(),
            Some(Backend::UdpServer { listener, .. }) => listener.actual_port(),
            Some(Backend::UdpClient { socket }) => socket.local_addr().ok().map(|a| a.port()),
            _ => None,
        }
    }

    /// Slave device of a PTY stream.
    pub fn pty_path(&self) -> Option<PathBuf> {
        match &self.inner.borrow().backend {
            Some(Backend::Fd(fd)) => fd.pty.as_ref().map(|d| d.slave_path.clone()),
            _ => None,
        }
    }

    /// Connected clients of a TCP server stream.
    pub fn client_count(&self) -> usize {
        match &self.inner.borrow().backend {
            Some(Backend::TcpServer { clients, .. }) => clients.len(),
            _ => 0,
        }
    }

    pub fn client_peers(&self) -> Vec<Option<SocketAddr>> {
        match &self.inner.borrow().backend {
            Some(Backend::TcpServer { clients, .. }) => clients.iter().map(|c| c.peer).collect(),
            _ => Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open the backend and start delivering events.
    pub fn schedule(&self, scheduler: &Scheduler) -> Result<(), StreamError> {
        let (kind, capacity) = {
            let mut inner = self.inner.borrow_mut();
            if inner.scheduler.is_some() {
                return Err(StreamError::AlreadyScheduled);
            }
            let Some(kind) = inner.kind.take() else {
                return Err(StreamError::AlreadyScheduled);
            };
            inner.scheduler = Some(scheduler.clone());
            (kind, inner.write_config.capacity)
        };

        let id = self.id();
        let name = kind.name();
        let result = match kind {
            StreamKind::Fd(config) => {
                // SAFETY: the caller hands us an open fd; when borrowed it is
                // released with `into_raw_fd` and never closed here.
                let file = unsafe { File::from_raw_fd(config.fd) };
                self.start_fd(scheduler, FdBackend::new(file, config.owns_fd, None, capacity))
            }
            StreamKind::Stdio(config) => self.start_stdio(scheduler, config, capacity),
            StreamKind::Serial(config) => match serial::open(&config) {
                Ok(file) => self.start_fd(scheduler, FdBackend::new(file, true, None, capacity)),
                Err(e) => Err(e.into()),
            },
            StreamKind::Pty(config) => match pty::open(&config) {
                Ok(Pty { master, device }) => {
                    self.start_fd(scheduler, FdBackend::new(master, true, Some(device), capacity))
                }
                Err(e) => Err(e.into()),
            },
            StreamKind::TcpClient(config) => self.start_tcp_client(scheduler, config, capacity),
            StreamKind::TcpServer(config) => self.start_tcp_server(scheduler, config),
            StreamKind::UdpClient(config) => self.start_udp_client(scheduler, config),
            StreamKind::UdpServer(config) => self.start_udp_server(scheduler, config),
            StreamKind::File(config) => self.start_file(scheduler, config),
        };

        match result {
            Ok(()) => {
                log::info!("[stream:{id}] scheduled {name}");
                Ok(())
            }
            Err(e) => {
                log::warn!("[stream:{id}] failed to start {name}: {e}");
                let backend = {
                    let mut inner = self.inner.borrow_mut();
                    inner.state = StreamState::Error;
                    inner.scheduler = None;
                    inner.backend.take()
                };
                if let Some(backend) = backend {
                    backend.teardown(scheduler);
                }
                Err(e)
            }
        }
    }

    /// Close the backend and drop buffered input and queued output.
    /// Fires no callbacks; safe to call repeatedly and from any callback.
    pub fn cancel(&self) {
        let (scheduler, backend, timer) = {
            let mut inner = self.inner.borrow_mut();
            let Some(scheduler) = inner.scheduler.take() else {
                return;
            };
            inner.state = StreamState::Disconnected;
            inner.read_buffer.clear();
            (scheduler, inner.backend.take(), inner.flush_timer.take())
        };
        if let Some(timer) = timer {
            scheduler.cancel_timer(timer);
        }
        if let Some(backend) = backend {
            let dropped = backend.pending_writes();
            if dropped > 0 {
                log::debug!("[stream:{}] dropping {dropped} queued bytes", self.id());
            }
            backend.teardown(&scheduler);
        }
        log::debug!("[stream:{}] cancelled", self.id());
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Send `data`, queueing whatever the OS does not take right away.
    ///
    /// TCP servers broadcast to every client; UDP servers reply to the most
    /// recent sender.  A TCP client with reconnect enabled queues while
    /// (re)connecting.
    pub fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        if data.is_empty() {
            return Ok(());
        }

        let outcome = {
            let mut inner = self.inner.borrow_mut();
            let connected = inner.state == StreamState::Connected;
            let stream_id = inner.id.clone();
            let outcome = match inner.backend.as_mut() {
                None => return Err(StreamError::NotConnected),
                Some(Backend::Fd(fd)) | Some(Backend::Stdio { output: fd, .. }) => {
                    if !connected {
                        return Err(StreamError::NotConnected);
                    }
                    match fd.write_or_queue(data) {
                        Ok(true) => WriteOutcome::NeedWriteInterest,
                        Ok(false) => WriteOutcome::Done,
                        Err(StreamError::Io(e)) => WriteOutcome::Failed(e),
                        Err(e) => return Err(e),
                    }
                }
                Some(Backend::TcpClient { task, queue }) => {
                    if task.is_connected() {
                        if queue.write_or_queue(data, |chunk| task.write(chunk))? {
                            task.set_write_interest(true);
                        }
                    } else {
                        queue.push(data)?;
                    }
                    WriteOutcome::Done
                }
                Some(Backend::TcpServer { clients, .. }) => {
                    let mut interest = Vec::new();
                    let mut failed = Vec::new();
                    for client in clients.iter_mut() {
                        let ServerClient {
                            id, stream, queue, ..
                        } = client;
                        match queue.write_or_queue(data, |chunk| stream.write(chunk)) {
                            Ok(true) => interest.push(*id),
                            Ok(false) => {}
                            Err(e) => {
                                log::warn!("[stream:{stream_id}] dropping client {id}: {e}");
                                failed.push(*id);
                            }
                        }
                    }
                    WriteOutcome::Clients { interest, failed }
                }
                Some(Backend::UdpClient { socket }) => {
                    socket.send(data)?;
                    WriteOutcome::Done
                }
                Some(Backend::UdpServer {
                    listener,
                    last_sender,
                }) => {
                    let target = last_sender.ok_or(StreamError::NoPeer)?;
                    listener.send_to(data, target)?;
                    WriteOutcome::Done
                }
                Some(Backend::File { file, .. }) => {
                    file.write_all(data)?;
                    WriteOutcome::Done
                }
            };
            if !matches!(outcome, WriteOutcome::Failed(_)) {
                inner.bytes_written += data.len() as u64;
            }
            outcome
        };

        match outcome {
            WriteOutcome::Done => Ok(()),
            WriteOutcome::NeedWriteInterest => {
                self.set_write_interest(true);
                Ok(())
            }
            WriteOutcome::Failed(e) => {
                let returned = io::Error::new(e.kind(), e.to_string());
                self.set_error(e);
                Err(returned.into())
            }
            WriteOutcome::Clients { interest, failed } => {
                for id in interest {
                    self.set_client_write_interest(id, true);
                }
                for id in failed {
                    self.schedule_client_removal(id);
                }
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Backend start-up
    // -----------------------------------------------------------------------

    fn start_fd(&self, scheduler: &Scheduler, backend: FdBackend) -> Result<(), StreamError> {
        set_nonblocking(backend.fd)?;
        self.register_main(scheduler, backend.fd)?;
        let mut inner = self.inner.borrow_mut();
        inner.backend = Some(Backend::Fd(backend));
        inner.state = StreamState::Connected;
        Ok(())
    }

    fn start_stdio(&self, scheduler: &Scheduler, config: StdioConfig, capacity: usize) -> Result<(), StreamError> {
        let output_fd = if config.use_stderr {
            io::stderr().as_raw_fd()
        } else {
            io::stdout().as_raw_fd()
        };
        set_nonblocking(output_fd)?;
        // SAFETY: the standard descriptors stay open for the whole process;
        // the backends never own them, so they are released in `Drop`.
        let output = FdBackend::new(unsafe { File::from_raw_fd(output_fd) }, false, None, capacity);

        let input = if config.output_only {
            None
        } else {
            let input_fd = io::stdin().as_raw_fd();
            set_nonblocking(input_fd)?;
            // SAFETY: as above.
            let input = FdBackend::new(unsafe { File::from_raw_fd(input_fd) }, false, None, 0);
            self.register_main(scheduler, input_fd)?;
            Some(input)
        };

        let mut inner = self.inner.borrow_mut();
        log::debug!(
            "[stream:{}] stdio out={output_fd} stdin={}",
            inner.id,
            if input.is_some() { "read" } else { "ignored" }
        );
        inner.backend = Some(Backend::Stdio { input, output });
        inner.state = StreamState::Connected;
        Ok(())
    }

    fn start_tcp_client(
        &self,
        scheduler: &Scheduler,
        config: TcpClientConfig,
        capacity: usize,
    ) -> Result<(), StreamError> {
        let task = ConnectTask::new(config.endpoint, config.connect);

        let weak = Rc::downgrade(&self.inner);
        task.on_connected(move |_| {
            if let Some(stream) = upgrade(&weak) {
                stream.client_connected();
            }
        });
        let weak = Rc::downgrade(&self.inner);
        task.on_read(move |task| {
            if let Some(stream) = upgrade(&weak) {
                stream.read_client(task);
            }
        });
        let weak = Rc::downgrade(&self.inner);
        task.on_write(move |_| {
            if let Some(stream) = upgrade(&weak) {
                stream.flush_client();
            }
        });
        let weak = Rc::downgrade(&self.inner);
        task.on_disconnected(move |task| {
            if let Some(stream) = upgrade(&weak) {
                stream.client_lost(None, task.should_reconnect());
            }
        });
        let weak = Rc::downgrade(&self.inner);
        task.on_error(move |task, err| {
            if let Some(stream) = upgrade(&weak) {
                stream.client_lost(Some(err), task.should_reconnect());
            }
        });

        {
            let mut inner = self.inner.borrow_mut();
            inner.backend = Some(Backend::TcpClient {
                task: task.clone(),
                queue: WriteBuffer::new(capacity),
            });
            inner.state = StreamState::Connecting;
        }
        // May connect (and call back into us) before returning.
        task.schedule(scheduler)?;
        Ok(())
    }

    fn start_tcp_server(&self, scheduler: &Scheduler, config: TcpServerConfig) -> Result<(), StreamError> {
        let listener = TcpListenerTask::new(config.endpoint);
        let weak = Rc::downgrade(&self.inner);
        listener.on_accept(move |_, accepted| {
            if let Some(stream) = upgrade(&weak) {
                stream.add_client(accepted);
            }
        });
        let weak = Rc::downgrade(&self.inner);
        listener.on_error(move |_, err| {
            if let Some(stream) = upgrade(&weak) {
                log::warn!("[stream:{}] accept error: {err}", stream.id());
            }
        });
        listener.schedule(scheduler)?;

        let mut inner = self.inner.borrow_mut();
        inner.backend = Some(Backend::TcpServer {
            listener,
            clients: Vec::new(),
            next_client: 1,
        });
        inner.state = StreamState::Connected;
        Ok(())
    }

    fn start_udp_client(&self, scheduler: &Scheduler, config: UdpClientConfig) -> Result<(), StreamError> {
        let target = resolve_first(&config.host, config.port)?;
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(target)?;
        self.register_main(scheduler, socket.as_raw_fd())?;

        let mut inner = self.inner.borrow_mut();
        inner.backend = Some(Backend::UdpClient { socket });
        inner.state = StreamState::Connected;
        Ok(())
    }

    fn start_udp_server(&self, scheduler: &Scheduler, config: UdpServerConfig) -> Result<(), StreamError> {
        let listener = UdpListenerTask::new(config.host, config.port);
        let weak = Rc::downgrade(&self.inner);
        listener.on_read(move |_, data, from| {
            if let Some(stream) = upgrade(&weak) {
                if let Some(Backend::UdpServer { last_sender, .. }) = &mut stream.inner.borrow_mut().backend {
                    *last_sender = Some(from);
                }
                stream.receive(data);
            }
        });
        let weak = Rc::downgrade(&self.inner);
        listener.on_error(move |_, err| {
            if let Some(stream) = upgrade(&weak) {
                log::warn!("[stream:{}] receive error: {err}", stream.id());
            }
        });
        listener.schedule(scheduler)?;

        let mut inner = self.inner.borrow_mut();
        inner.backend = Some(Backend::UdpServer {
            listener,
            last_sender: None,
        });
        inner.state = StreamState::Connected;
        Ok(())
    }

    fn start_file(&self, scheduler: &Scheduler, config: FileConfig) -> Result<(), StreamError> {
        let file = config.open()?;
        let mut reader = None;
        if config.read {
            let pollable = !config.is_rate_limited() && !file.metadata()?.is_file();
            if pollable {
                match self.register_main(scheduler, file.as_raw_fd()) {
                    Ok(()) => reader = Some(FileReader::Polled),
                    // Character devices like /dev/null cannot be polled.
                    Err(SchedulerError::Io(e)) if e.kind() == io::ErrorKind::PermissionDenied => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if reader.is_none() {
                reader = Some(FileReader::Periodic(self.file_reader(&config)));
            }
        }

        let periodic = match &reader {
            Some(FileReader::Periodic(task)) => Some(task.clone()),
            _ => None,
        };
        {
            let mut inner = self.inner.borrow_mut();
            inner.backend = Some(Backend::File { file, reader });
            inner.state = StreamState::Connected;
        }
        if let Some(task) = periodic {
            task.schedule(scheduler);
        }
        Ok(())
    }

    fn file_reader(&self, config: &FileConfig) -> PeriodicTask {
        let interval = if config.is_rate_limited() {
            config.tick_interval
        } else {
            Duration::ZERO
        };
        let chunk = config.chunk();
        let task = PeriodicTask::new(interval);
        let weak = Rc::downgrade(&self.inner);
        task.set_callback(move |_| {
            if let Some(stream) = upgrade(&weak) {
                stream.read_file_chunk(chunk);
            }
        });
        task
    }

    fn register_main(&self, scheduler: &Scheduler, fd: RawFd) -> Result<(), SchedulerError> {
        let weak = Rc::downgrade(&self.inner);
        scheduler.add_fd(fd, Interest::READABLE, move |_, readiness| {
            if let Some(stream) = upgrade(&weak) {
                stream.handle_main(readiness);
            }
        })
    }

    // -----------------------------------------------------------------------
    // Event handling: fd, serial, PTY, UDP client, polled file
    // -----------------------------------------------------------------------

    fn handle_main(&self, readiness: Readiness) {
        if readiness.readable || readiness.read_closed || readiness.error {
            self.read_main();
        }
        if readiness.writable && self.is_connected() {
            self.flush_main();
        }
    }

    fn read_main(&self) {
        let datagram = matches!(self.inner.borrow().backend, Some(Backend::UdpClient { .. }));
        let mut buf = vec![0u8; if datagram { MAX_DATAGRAM } else { READ_CHUNK }];
        loop {
            if !self.is_connected() {
                return;
            }
            let result = match &self.inner.borrow().backend {
                Some(Backend::Fd(fd)) | Some(Backend::Stdio { input: Some(fd), .. }) => fd.read(&mut buf),
                Some(Backend::File { file, .. }) => (&*file).read(&mut buf),
                Some(Backend::UdpClient { socket }) => socket.recv(&mut buf),
                _ => return,
            };
            match result {
                Ok(0) if !datagram => {
                    self.set_disconnected();
                    return;
                }
                Ok(n) => self.receive(&buf[..n]),
                Err(e) if would_block(&e) => return,
                Err(e) if interrupted(&e) => continue,
                // ICMP port unreachable from an earlier send; not fatal for UDP.
                Err(e) if datagram && e.kind() == io::ErrorKind::ConnectionRefused => {
                    log::debug!("[stream:{}] {e}", self.id());
                }
                Err(e) => {
                    self.set_error(e);
                    return;
                }
            }
        }
    }

    fn flush_main(&self) {
        let result = match &mut self.inner.borrow_mut().backend {
            Some(Backend::Fd(fd)) | Some(Backend::Stdio { output: fd, .. }) => fd.flush(),
            _ => return,
        };
        match result {
            Ok(true) => self.set_write_interest(false),
            Ok(false) => {}
            Err(e) => self.set_error(e),
        }
    }

    fn set_write_interest(&self, enabled: bool) {
        let (scheduler, fd, separate) = {
            let mut inner = self.inner.borrow_mut();
            let scheduler = inner.scheduler.clone();
            match &mut inner.backend {
                Some(Backend::Fd(fd)) if fd.write_interest != enabled => {
                    fd.write_interest = enabled;
                    (scheduler, fd.fd, false)
                }
                Some(Backend::Stdio { output, .. }) if output.write_interest != enabled => {
                    output.write_interest = enabled;
                    (scheduler, output.fd, true)
                }
                _ => return,
            }
        };
        let Some(scheduler) = scheduler else {
            return;
        };
        let result = match (separate, enabled) {
            (false, _) => scheduler.update_fd(fd, interest(enabled)),
            (true, true) => self.register_output(&scheduler, fd),
            (true, false) => scheduler.remove_fd(fd),
        };
        if let Err(e) = result {
            log::warn!("[stream:{}] failed to update interest: {e}", self.id());
        }
    }

    /// Watch a write-only descriptor until its queue drains.
    fn register_output(&self, scheduler: &Scheduler, fd: RawFd) -> Result<(), SchedulerError> {
        let weak = Rc::downgrade(&self.inner);
        scheduler.add_fd(fd, Interest::WRITABLE, move |_, readiness| {
            if let Some(stream) = upgrade(&weak) {
                if readiness.writable || readiness.error || readiness.write_closed {
                    stream.flush_main();
                }
            }
        })
    }

    fn read_file_chunk(&self, chunk: usize) {
        if !self.is_connected() {
            return;
        }
        let mut buf = vec![0u8; chunk];
        let result = match &self.inner.borrow().backend {
            Some(Backend::File { file, .. }) => (&*file).read(&mut buf),
            _ => return,
        };
        match result {
            Ok(0) => self.set_disconnected(),
            Ok(n) => self.receive(&buf[..n]),
            Err(e) if would_block(&e) || interrupted(&e) => {}
            Err(e) => self.set_error(e),
        }
    }

    // -----------------------------------------------------------------------
    // Event handling: TCP client
    // -----------------------------------------------------------------------

    fn client_connected(&self) {
        self.inner.borrow_mut().state = StreamState::Connected;
        self.flush_client();
    }

    fn read_client(&self, task: &ConnectTask) {
        let mut buf = [0u8; READ_CHUNK];
        while task.is_connected() {
            match task.read(&mut buf) {
                // The task turns EOF and hard errors into a disconnect.
                Ok(0) => return,
                Ok(n) => self.receive(&buf[..n]),
                Err(e) if interrupted(&e) => continue,
                Err(_) => return,
            }
        }
    }

    fn flush_client(&self) {
        let (result, task) = match &mut self.inner.borrow_mut().backend {
            Some(Backend::TcpClient { task, queue }) => {
                (queue.drain_into(|chunk| task.write(chunk)), task.clone())
            }
            _ => return,
        };
        match result {
            Ok(drained) => task.set_write_interest(!drained),
            Err(e) => log::debug!("[stream:{}] flush failed: {e}", self.id()),
        }
    }

    fn client_lost(&self, err: Option<&io::Error>, reconnect: bool) {
        let err = err.map(|e| io::Error::new(e.kind(), e.to_string()));
        if !reconnect {
            match err {
                Some(e) => self.set_error(e),
                None => self.set_disconnected(),
            }
            return;
        }

        // The connect task keeps the backend alive and will retry.
        self.flush_reads();
        let was_connected = {
            let mut inner = self.inner.borrow_mut();
            let was = inner.state == StreamState::Connected;
            inner.state = if err.is_some() {
                StreamState::Error
            } else {
                StreamState::Disconnected
            };
            was
        };
        match err {
            Some(e) => self.fire_error(&StreamError::Io(e)),
            None if was_connected => self.fire_complete(),
            None => {}
        }
    }

    // -----------------------------------------------------------------------
    // Event handling: TCP server clients
    // -----------------------------------------------------------------------

    fn add_client(&self, accepted: Accepted) {
        let (scheduler, id, capacity) = {
            let mut inner = self.inner.borrow_mut();
            let capacity = inner.write_config.capacity;
            let Some(scheduler) = inner.scheduler.clone() else {
                return;
            };
            let Some(Backend::TcpServer { next_client, .. }) = &mut inner.backend else {
                return;
            };
            let id = *next_client;
            *next_client += 1;
            (scheduler, id, capacity)
        };

        let fd = accepted.stream.raw_fd();
        let weak = Rc::downgrade(&self.inner);
        let registered = scheduler.add_fd(fd, Interest::READABLE, move |_, readiness| {
            if let Some(stream) = upgrade(&weak) {
                stream.handle_client(id, readiness);
            }
        });
        if let Err(e) = registered {
            log::warn!("[stream:{}] cannot register client: {e}", self.id());
            return;
        }

        log::info!("[stream:{}] client {id} connected ({:?})", self.id(), accepted.peer);
        if let Some(Backend::TcpServer { clients, .. }) = &mut self.inner.borrow_mut().backend {
            clients.push(ServerClient {
                id,
                stream: accepted.stream,
                peer: accepted.peer,
                queue: WriteBuffer::new(capacity),
                write_interest: false,
            });
        }
    }

    fn handle_client(&self, id: u64, readiness: Readiness) {
        if readiness.readable || readiness.read_closed || readiness.error {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                let result = match &self.inner.borrow().backend {
                    Some(Backend::TcpServer { clients, .. }) => match clients.iter().find(|c| c.id == id) {
                        Some(client) => client.stream.read(&mut buf),
                        None => return,
                    },
                    _ => return,
                };
                match result {
                    Ok(0) => {
                        self.schedule_client_removal(id);
                        return;
                    }
                    Ok(n) => self.receive(&buf[..n]),
                    Err(e) if would_block(&e) => break,
                    Err(e) if interrupted(&e) => continue,
                    Err(e) => {
                        log::warn!("[stream:{}] client {id} read failed: {e}", self.id());
                        self.schedule_client_removal(id);
                        return;
                    }
                }
            }
        }

        if readiness.writable {
            let result = match &mut self.inner.borrow_mut().backend {
                Some(Backend::TcpServer { clients, .. }) => match clients.iter_mut().find(|c| c.id == id) {
                    Some(ServerClient { stream, queue, .. }) => queue.drain_into(|chunk| stream.write(chunk)),
                    None => return,
                },
                _ => return,
            };
            match result {
                Ok(true) => self.set_client_write_interest(id, false),
                Ok(false) => {}
                Err(e) => {
                    log::warn!("[stream:{}] client {id} write failed: {e}", self.id());
                    self.schedule_client_removal(id);
                }
            }
        }
    }

    fn set_client_write_interest(&self, id: u64, enabled: bool) {
        let (scheduler, fd) = {
            let mut inner = self.inner.borrow_mut();
            let scheduler = inner.scheduler.clone();
            let Some(Backend::TcpServer { clients, .. }) = &mut inner.backend else {
                return;
            };
            match clients.iter_mut().find(|c| c.id == id) {
                Some(client) if client.write_interest != enabled => {
                    client.write_interest = enabled;
                    (scheduler, client.stream.raw_fd())
                }
                _ => return,
            }
        };
        if let Some(scheduler) = scheduler {
            if let Err(e) = scheduler.update_fd(fd, interest(enabled)) {
                log::warn!("[stream:{}] client {id}: failed to update interest: {e}", self.id());
            }
        }
    }

    fn schedule_client_removal(&self, id: u64) {
        let Some(scheduler) = self.inner.borrow().scheduler.clone() else {
            return;
        };
        let weak = Rc::downgrade(&self.inner);
        scheduler.defer(move |scheduler| {
            if let Some(stream) = upgrade(&weak) {
                stream.remove_client(scheduler, id);
            }
        });
    }

    fn remove_client(&self, scheduler: &Scheduler, id: u64) {
        let client = match &mut self.inner.borrow_mut().backend {
            Some(Backend::TcpServer { clients, .. }) => match clients.iter().position(|c| c.id == id) {
                Some(pos) => clients.remove(pos),
                None => return,
            },
            _ => return,
        };
        let _ = scheduler.remove_fd(client.stream.raw_fd());
        if !client.queue.is_empty() {
            log::debug!(
                "[stream:{}] client {id} gone with {} bytes queued",
                self.id(),
                client.queue.len()
            );
        }
        log::info!("[stream:{}] client {id} disconnected", self.id());
    }

    // -----------------------------------------------------------------------
    // Read buffering and delivery
    // -----------------------------------------------------------------------

    fn receive(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let arm = {
            let mut inner = self.inner.borrow_mut();
            inner.bytes_read += data.len() as u64;
            inner.read_buffer.extend_from_slice(data);
            if inner.read_buffer.len() >= inner.read_config.min_bytes.max(1) {
                None
            } else if inner.flush_timer.is_some() {
                return;
            } else {
                match (inner.read_config.timeout, inner.scheduler.clone()) {
                    (Some(timeout), Some(scheduler)) => Some((timeout, scheduler)),
                    _ => return,
                }
            }
        };

        match arm {
            None => self.flush_reads(),
            Some((timeout, scheduler)) => {
                let weak = Rc::downgrade(&self.inner);
                let timer = scheduler.add_timer(timeout, move |_| {
                    if let Some(stream) = upgrade(&weak) {
                        stream.inner.borrow_mut().flush_timer = None;
                        stream.flush_reads();
                    }
                });
                self.inner.borrow_mut().flush_timer = Some(timer);
            }
        }
    }

    /// Deliver everything buffered to a snapshot of the observers.
    fn flush_reads(&self) {
        let (data, observers, timer) = {
            let mut inner = self.inner.borrow_mut();
            let timer = match (inner.flush_timer.take(), inner.scheduler.clone()) {
                (Some(id), Some(scheduler)) => Some((id, scheduler)),
                _ => None,
            };
            let data = std::mem::take(&mut inner.read_buffer);
            let observers: Vec<ReadCallback> = inner.observers.iter().map(|(_, cb)| cb.clone()).collect();
            (data, observers, timer)
        };
        if let Some((id, scheduler)) = timer {
            scheduler.cancel_timer(id);
        }
        if data.is_empty() {
            return;
        }
        for observer in observers {
            match observer.try_borrow_mut() {
                Ok(mut cb) => cb(self, &data),
                Err(_) => log::warn!("[stream:{}] read observer re-entered, skipped", self.id()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    fn set_disconnected(&self) {
        self.finish(StreamState::Disconnected, None);
    }

    fn set_error(&self, err: io::Error) {
        self.finish(StreamState::Error, Some(err));
    }

    fn finish(&self, state: StreamState, err: Option<io::Error>) {
        if self.state().is_terminal() {
            return;
        }
        match &err {
            Some(e) => log::warn!("[stream:{}] error: {e}", self.id()),
            None => log::info!("[stream:{}] disconnected", self.id()),
        }

        // Whatever is still buffered goes out before the stream closes.
        self.flush_reads();

        let (scheduler, backend) = {
            let mut inner = self.inner.borrow_mut();
            inner.state = state;
            (inner.scheduler.take(), inner.backend.take())
        };
        if let (Some(scheduler), Some(backend)) = (scheduler, backend) {
            backend.teardown(&scheduler);
        }

        match err {
            Some(e) => self.fire_error(&StreamError::Io(e)),
            None => self.fire_complete(),
        }
    }

    fn fire_error(&self, err: &StreamError) {
        let callback = self.inner.borrow().on_error.clone();
        if let Some(cb) = callback {
            match cb.try_borrow_mut() {
                Ok(mut cb) => cb(self, err),
                Err(_) => log::warn!("[stream:{}] error callback re-entered", self.id()),
            }
        }
    }

    fn fire_complete(&self) {
        let callback = self.inner.borrow().on_complete.clone();
        if let Some(cb) = callback {
            match cb.try_borrow_mut() {
                Ok(mut cb) => cb(self),
                Err(_) => log::warn!("[stream:{}] complete callback re-entered", self.id()),
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Stream")
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("buffered", &inner.read_buffer.len())
            .field("observers", &inner.observers.len())
            .finish()
    }
}

fn interest(write: bool) -> Interest {
    if write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

fn upgrade(weak: &Weak<RefCell<StreamInner>>) -> Option<Stream> {
    weak.upgrade().map(|inner| Stream { inner })
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            if let Some(timer) = self.flush_timer.take() {
                scheduler.cancel_timer(timer);
            }
            if let Some(backend) = self.backend.take() {
                backend.teardown(&scheduler);
            }
        }
        if let Some(StreamKind::Fd(config)) = self.kind.take() {
            if config.owns_fd {
                let _ = nix::unistd::close(config.fd);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that accepts at most `budget` bytes, then reports `WouldBlock`.
    struct Throttled {
        budget: usize,
        taken: Vec<u8>,
    }

    impl Throttled {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = data.len().min(self.budget);
            self.budget -= n;
            self.taken.extend_from_slice(&data[..n]);
            Ok(n)
        }
    }

    #[test]
    fn push_respects_capacity() {
        let mut queue = WriteBuffer::new(8);
        queue.push(b"abcde").unwrap();
        assert_eq!(queue.available(), 3);
        let err = queue.push(b"fghi").unwrap_err();
        assert!(matches!(
            err,
            StreamError::WriteQueueFull {
                pending: 5,
                requested: 4,
                capacity: 8
            }
        ));
        assert_eq!(queue.peek(), b"abcde");
    }

    #[test]
    fn consume_advances_and_resets() {
        let mut queue = WriteBuffer::new(64);
        queue.push(b"hello world").unwrap();
        queue.consume(6);
        assert_eq!(queue.peek(), b"world");
        queue.push(b"!").unwrap();
        assert_eq!(queue.peek(), b"world!");
        queue.consume(100);
        assert!(queue.is_empty());
        assert_eq!(queue.available(), 64);
    }

    #[test]
    fn drain_stops_on_would_block() {
        let mut queue = WriteBuffer::new(64);
        queue.push(b"0123456789").unwrap();
        let mut sink = Throttled {
            budget: 4,
            taken: Vec::new(),
        };
        assert!(!queue.drain_into(|d| sink.write(d)).unwrap());
        assert_eq!(sink.taken, b"0123");
        assert_eq!(queue.len(), 6);

        sink.budget = 100;
        assert!(queue.drain_into(|d| sink.write(d)).unwrap());
        assert_eq!(sink.taken, b"0123456789");
    }

    #[test]
    fn drain_propagates_hard_errors() {
        let mut queue = WriteBuffer::new(64);
        queue.push(b"x").unwrap();
        let err = queue
            .drain_into(|_| Err(io::Error::from(io::ErrorKind::BrokenPipe)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn write_or_queue_writes_directly_then_queues_leftover() {
        let mut queue = WriteBuffer::new(64);
        let mut sink = Throttled {
            budget: 3,
            taken: Vec::new(),
        };
        assert!(queue.write_or_queue(b"abcdef", |d| sink.write(d)).unwrap());
        assert_eq!(sink.taken, b"abc");
        assert_eq!(queue.peek(), b"def");

        // Once something is queued, new data goes behind it.
        sink.budget = 100;
        assert!(queue.write_or_queue(b"gh", |d| sink.write(d)).unwrap());
        assert_eq!(sink.taken, b"abc");
        assert_eq!(queue.peek(), b"defgh");
    }

    #[test]
    fn write_or_queue_rejects_oversized_data_without_writing() {
        let mut queue = WriteBuffer::new(4);
        let mut sink = Throttled {
            budget: 100,
            taken: Vec::new(),
        };
        assert!(queue.write_or_queue(b"too long", |d| sink.write(d)).is_err());
        assert!(sink.taken.is_empty());
    }

    #[test]
    fn read_config_defaults_to_immediate_delivery() {
        let config = ReadConfig::default();
        assert_eq!(config.min_bytes, 1);
        assert_eq!(config.timeout, None);
        assert_eq!(ReadConfig::buffered(0, None).min_bytes, 1);
    }

    #[test]
    fn write_before_schedule_is_rejected() {
        let stream = Stream::udp_client(
            "u",
            UdpClientConfig {
                host: "127.0.0.1".into(),
                port: 9,
            },
            ReadConfig::default(),
        );
        assert!(matches!(stream.write(b"x"), Err(StreamError::NotConnected)));
        assert_eq!(stream.state(), StreamState::Unscheduled);
        assert_eq!(stream.pending_writes(), 0);
    }

    #[test]
    fn observers_can_be_removed() {
        let stream = Stream::udp_client(
            "u",
            UdpClientConfig {
                host: "127.0.0.1".into(),
                port: 9,
            },
            ReadConfig::default(),
        );
        let a = stream.on_read(|_, _| {});
        let b = stream.on_read(|_, _| {});
        assert_ne!(a, b);
        assert!(stream.remove_on_read(a));
        assert!(!stream.remove_on_read(a));
        assert!(stream.remove_on_read(b));
    }
}
